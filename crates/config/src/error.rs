//! Configuration error types.

use std::path::PathBuf;

/// Result alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Reading the config file from disk failed
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        /// Path of the file
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Writing the config file to disk failed
    #[error("failed to write config file {path}: {source}")]
    FileWrite {
        /// Path of the file
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// TOML parsing failed
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization failed
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A section failed validation
    #[error("invalid config: {0}")]
    Invalid(String),
}
