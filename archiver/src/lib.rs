//! Archiver Library
//!
//! Provisions, maintains and synchronizes one encrypted backup container per
//! configured source tree: sizing, loop attachment, encryption, filesystem,
//! mount, rsync mirroring and ordered teardown.

pub mod backend;
pub mod capacity;
pub mod config;
pub mod confirm;
pub mod daemon;
pub mod fs;
pub mod machine;
pub mod orchestrator;
pub mod preflight;
pub mod resources;
pub mod transfer;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::Config;
pub use orchestrator::{ArchiveStatus, Orchestrator, RunReport};
pub use utils::errors::ArchiverError;
pub type Result<T> = std::result::Result<T, ArchiverError>;
