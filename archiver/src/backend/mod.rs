//! External collaborators of the container lifecycle.
//!
//! Each concern (loop devices, encrypted volumes, filesystems, mounts,
//! synchronization, container allocation) sits behind a trait so the state
//! machine can be driven by recording fakes in tests. The system
//! implementations shell out to the host tools through [`command::CommandRunner`]
//! and translate their exit codes into structured values.

pub mod command;
pub mod cryptsetup;
pub mod ext4;
pub mod losetup;
pub mod mount;
pub mod provision;
pub mod rsync;

use crate::config::{Passphrase, ToolsConfig};
use command::CommandRunner;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use cryptsetup::read_header_signature;

/// Failure of an external tool or native backend operation.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("required binary not found: {program}")]
    Missing { program: String },

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with code {code}: {diagnostic}")]
    Failed {
        program: String,
        code: i32,
        diagnostic: String,
    },

    #[error("{program} was interrupted")]
    Interrupted { program: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Unexpected(String),
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// A loop block device such as `/dev/loop3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoopDevice(PathBuf);

impl LoopDevice {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for LoopDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// What the first bytes of a container say about its encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderSignature {
    /// All zero, short or unreadable: never encrypted.
    Blank,
    /// A recognized encrypted-volume header.
    Luks,
    /// Data present but not a header we know.
    Unrecognized,
}

/// Outcome of testing a passphrase against an encrypted header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCheck {
    Valid,
    Rejected,
}

/// Result of a read-only filesystem check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsState {
    Clean,
    Inconsistent,
    Unformatted,
}

/// Allocate, inspect and release loop devices bound to regular files.
pub trait LoopBackend: Send + Sync {
    /// Loop devices currently bound to `file`.
    fn associated(&self, file: &Path) -> BackendResult<Vec<LoopDevice>>;

    /// Bind `file` to the next free loop device.
    fn attach(&self, file: &Path) -> BackendResult<LoopDevice>;

    /// Release a loop device. Already detached devices are not an error.
    fn detach(&self, device: &LoopDevice) -> BackendResult<()>;
}

/// Create, verify and map encrypted volumes.
pub trait CryptBackend: Send + Sync {
    /// Classify the container header without involving the device.
    fn header_signature(&self, container: &Path) -> HeaderSignature {
        read_header_signature(container)
    }

    fn verify_passphrase(
        &self,
        device: &LoopDevice,
        passphrase: &Passphrase,
    ) -> BackendResult<KeyCheck>;

    /// Initialize encryption on `device`, destroying its contents.
    fn format(&self, device: &LoopDevice, passphrase: &Passphrase) -> BackendResult<()>;

    /// Map the volume as `name` and return the mapped device path. An
    /// existing mapping of the same name is reused.
    fn open(&self, device: &LoopDevice, name: &str, passphrase: &Passphrase)
        -> BackendResult<PathBuf>;

    /// Remove the mapping. Inactive mappings are not an error.
    fn close(&self, name: &str) -> BackendResult<()>;
}

/// Check and create the filesystem inside a mapped volume.
pub trait FilesystemBackend: Send + Sync {
    fn check(&self, device: &Path) -> BackendResult<FsState>;

    fn format(&self, device: &Path, label: &str) -> BackendResult<()>;
}

/// Mount points and mounts.
pub trait MountBackend: Send + Sync {
    fn is_mounted(&self, mount_point: &Path) -> BackendResult<bool>;

    fn create_mount_point(&self, mount_point: &Path) -> BackendResult<()>;

    fn mount(&self, device: &Path, mount_point: &Path) -> BackendResult<()>;

    /// Unmount; a mount point that is not mounted is not an error.
    fn unmount(&self, mount_point: &Path) -> BackendResult<()>;

    /// Remove an empty mount point directory; a missing one is not an error.
    fn remove_mount_point(&self, mount_point: &Path) -> BackendResult<()>;
}

/// Parameters of one mirror operation.
#[derive(Debug, Clone)]
pub struct SyncRequest<'a> {
    pub source: &'a Path,
    pub target: &'a Path,
    /// KiB/s, 0 = unlimited
    pub bandwidth_limit_kbps: u32,
    pub max_delete: u32,
}

/// Mirror a source tree into a mounted container.
pub trait SyncBackend: Send + Sync {
    fn synchronize(&self, request: &SyncRequest<'_>) -> BackendResult<()>;
}

/// Allocate container files.
pub trait ProvisionBackend: Send + Sync {
    /// Create (or replace) `path` as a zero-filled file of exactly `size`
    /// bytes. The previous file, if any, survives until the new one is
    /// complete.
    fn allocate(&self, path: &Path, size: u64) -> BackendResult<()>;
}

/// The full set of collaborators one run works with.
pub struct Backends {
    pub loops: Box<dyn LoopBackend>,
    pub crypt: Box<dyn CryptBackend>,
    pub filesystem: Box<dyn FilesystemBackend>,
    pub mount: Box<dyn MountBackend>,
    pub sync: Box<dyn SyncBackend>,
    pub provision: Box<dyn ProvisionBackend>,
}

impl Backends {
    /// Host implementations driven by the configured tools.
    pub fn system(tools: &ToolsConfig, cancel: CancellationToken) -> Self {
        let runner = CommandRunner::new(tools.sudo, cancel.clone());
        Self {
            loops: Box::new(losetup::Losetup::new(runner.clone(), &tools.losetup)),
            crypt: Box::new(
                cryptsetup::Cryptsetup::new(runner.clone(), &tools.cryptsetup)
                    .with_mapper_dir(&tools.mapper_dir),
            ),
            filesystem: Box::new(ext4::Ext4::new(runner.clone(), &tools.e2fsck, &tools.mkfs)),
            mount: Box::new(mount::SystemMount::new(
                runner.clone(),
                &tools.mount,
                &tools.umount,
                &tools.mountpoint,
            )),
            sync: Box::new(rsync::Rsync::new(runner, &tools.rsync)),
            provision: Box::new(provision::ZeroFill::new(cancel)),
        }
    }
}
