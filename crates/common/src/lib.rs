//! Common types for the keypool gateway

mod secret;
mod error;

pub use secret::Secret;
pub use error::{Error, Result};
