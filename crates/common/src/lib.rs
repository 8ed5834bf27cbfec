//! Shared types for the dashboard session client workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
