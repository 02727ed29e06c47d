//! # Valcore Config
//!
//! Single-config philosophy: every node setting lives in one `valcore.toml`
//! file, parsed into [`Config`] and validated section by section before the
//! node starts.

#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

mod config;
mod error;

pub use config::{
    ChainConfig, Config, ConsensusConfig, LoggingConfig, MempoolConfig, NetworkConfig,
    StorageConfig,
};
pub use error::{ConfigError, ConfigResult};
