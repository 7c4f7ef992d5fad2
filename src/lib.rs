//! # deployctl
//!
//! A deployment controller that accepts batches of application deployment
//! changes over HTTP and keeps a versioned history for every
//! (domain, app_name) pair:
//! - Each accepted change becomes a new, immutable record with version
//!   `previous + 1` for its key, even under concurrent pushes
//! - Batches are processed item by item; a bad item never sinks the batch
//! - Status transitions, registry credentials and aggregate stats
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │              HTTP API (axum)             │
//! │  /api/v1/push  /deployments  /registry   │
//! └───────────┬──────────────────────────────┘
//!             │
//!   ┌─────────▼──────────┐
//!   │   BatchIngestor    │  per-item validate + create
//!   └─────────┬──────────┘
//!             │
//! ┌───────────▼─────────────┬────────────────────┐
//! │      RecordStore        │  CredentialStore   │
//! │ (per-key version alloc) │  (upsert by id)    │
//! └───────────┬─────────────┴──────────┬─────────┘
//!             └──── StorePool ─────────┘
//!                  (RocksDB, bounded)
//! ```
//!
//! ## Usage
//!
//! ### Start the server
//! ```bash
//! deployctl-server serve --bind 0.0.0.0:8080 --db ./deployctl-data
//! ```
//!
//! ### Use the CLI
//! ```bash
//! # Push a batch
//! deployctl push --file ./batch.json
//!
//! # Latest version of every app
//! deployctl list
//!
//! # Mark a deployment as rolled out
//! deployctl status <id> deployed
//! ```

pub mod common;
pub mod controller;
pub mod ingest;
pub mod store;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use controller::Controller;
pub use ingest::{BatchIngestor, BatchOutcome, BatchResult};
pub use store::{RecordStore, Store};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
