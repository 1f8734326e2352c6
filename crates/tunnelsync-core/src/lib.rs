//! `tunnelsync` Core Library
//!
//! Shared functionality for the tunnelsync binary and daemon library:
//! - Configuration (ports, retry policies, timeouts, DuckDNS credentials)
//! - Common error types
//! - Tracing subscriber setup

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::{Config, RetryPolicy};
pub use error::{Error, Result};
