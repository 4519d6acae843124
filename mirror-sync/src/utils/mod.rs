//! Utility modules for the mirror synchroniser.

pub mod errors;
pub mod logger;

pub use errors::{MirrorError, Result};
