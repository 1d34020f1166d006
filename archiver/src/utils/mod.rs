//! Utility modules for the archiver.

pub mod errors;
pub mod logger;

pub use errors::{ArchiverError, Result};
