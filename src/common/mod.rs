//! Common utilities and types shared across deployctl

pub mod config;
pub mod error;
pub mod metrics;
pub mod tracing_middleware;

pub use config::{Config, ServerConfig, StoreConfig};
pub use error::{Error, Result};
pub use metrics::{MetricsRegistry, METRICS};
pub use tracing_middleware::{request_tracing_middleware, REQUEST_ID_HEADER};
