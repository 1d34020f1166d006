//! Custom error types for the archiver.

use crate::backend::BackendError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiverError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Preflight check failed: {0}")]
    Preflight(String),

    #[error("Inventory error: {path} is unreadable: {reason}")]
    Inventory { path: PathBuf, reason: String },

    #[error("Provision error: {0}")]
    Provision(String),

    #[error("Capacity exceeded: container is {fill:.1}% full (threshold {threshold}%) and growth was not performed")]
    CapacityExceeded { fill: f64, threshold: u8 },

    #[error("Loop device error: {0}")]
    LoopAttach(#[source] BackendError),

    #[error("Container appears corrupt: {0}")]
    Corrupt(String),

    #[error("Encryption error: {0}")]
    Encrypt(String),

    #[error("Volume mapping error: {0}. Inspect the container manually, or delete it and let the archiver recreate it")]
    Map(#[source] BackendError),

    #[error("Filesystem check error: {0}")]
    FsCheck(#[source] BackendError),

    #[error("Filesystem format error: {0}")]
    Format(String),

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("Sync error: {0}")]
    Sync(#[source] BackendError),

    #[error("Teardown incomplete, manual cleanup required for: {}", remaining.join(", "))]
    TeardownPartial { remaining: Vec<String> },

    #[error("Interrupted")]
    Interrupted,
}

impl ArchiverError {
    /// Wrap a backend failure, preserving interruption as its own kind.
    pub(crate) fn from_backend(
        error: BackendError,
        wrap: impl FnOnce(BackendError) -> ArchiverError,
    ) -> ArchiverError {
        match error {
            BackendError::Interrupted { .. } => ArchiverError::Interrupted,
            other => wrap(other),
        }
    }

    /// Short machine-friendly name of the error kind, used in run summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            ArchiverError::Config(_) => "config",
            ArchiverError::Io(_) => "io",
            ArchiverError::Preflight(_) => "preflight",
            ArchiverError::Inventory { .. } => "inventory",
            ArchiverError::Provision(_) => "provision",
            ArchiverError::CapacityExceeded { .. } => "capacity-exceeded",
            ArchiverError::LoopAttach(_) => "loop-attach",
            ArchiverError::Corrupt(_) => "corrupt",
            ArchiverError::Encrypt(_) => "encrypt",
            ArchiverError::Map(_) => "map",
            ArchiverError::FsCheck(_) => "fs-check",
            ArchiverError::Format(_) => "format",
            ArchiverError::Mount(_) => "mount",
            ArchiverError::Sync(_) => "sync",
            ArchiverError::TeardownPartial { .. } => "teardown-partial",
            ArchiverError::Interrupted => "interrupted",
        }
    }
}

pub type Result<T> = std::result::Result<T, ArchiverError>;
