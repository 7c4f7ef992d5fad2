//! Deployment controller: HTTP API over the record and credential stores

pub mod http;
pub mod server;

pub use http::{create_router, ApiResponse, AppState};
pub use server::Controller;
