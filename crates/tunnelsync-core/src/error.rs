//! Error types for the `tunnelsync` core library.

use thiserror::Error;

/// Result type alias using the core `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for configuration handling.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Required environment variables are missing
    #[error("Missing required environment variables: {}", .0.join(", "))]
    MissingEnv(Vec<String>),
}
