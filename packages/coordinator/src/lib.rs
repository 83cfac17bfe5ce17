//! HTLC coordinator service
//!
//! HTTP front end and background tasks around [`htlc_core::SwapCoordinator`].
//! The binary in `main.rs` wires these together; integration tests drive the
//! router directly.

pub mod api;
pub mod config;
pub mod http_source;
pub mod ingest;
pub mod metrics;
pub mod server;

pub use config::Config;
pub use server::{router, start_server, AppState};
