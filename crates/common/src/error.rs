//! Errors raised while bootstrapping the gateway.
//!
//! Everything here happens before the server binds: reading the config
//! file, parsing it, and resolving file-based secrets. Request-path
//! failures use the provider crate's error types instead.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A setting failed validation or a secret could not be resolved.
    /// The message carries the offending key or path.
    #[error("invalid gateway configuration: {0}")]
    Config(String),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed configuration file: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
