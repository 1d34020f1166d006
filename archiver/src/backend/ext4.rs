//! ext4 filesystem check and creation via e2fsprogs.

use super::command::CommandRunner;
use super::{BackendResult, FilesystemBackend, FsState};
use std::ffi::OsString;
use std::path::Path;

/// ext4 volume labels hold at most 16 bytes.
const MAX_LABEL_LEN: usize = 16;

/// System filesystem backend.
#[derive(Debug, Clone)]
pub struct Ext4 {
    runner: CommandRunner,
    fsck: String,
    mkfs: String,
}

impl Ext4 {
    pub fn new(runner: CommandRunner, fsck: impl Into<String>, mkfs: impl Into<String>) -> Self {
        Self {
            runner,
            fsck: fsck.into(),
            mkfs: mkfs.into(),
        }
    }
}

impl FilesystemBackend for Ext4 {
    fn check(&self, device: &Path) -> BackendResult<FsState> {
        let args: Vec<OsString> = vec!["-n".into(), "-f".into(), device.into()];
        let out = self.runner.output(&self.fsck, &args, None)?;
        classify_fsck(out.status).ok_or_else(|| out.failure(&self.fsck))
    }

    fn format(&self, device: &Path, label: &str) -> BackendResult<()> {
        let label: String = label.chars().take(MAX_LABEL_LEN).collect();
        let args: Vec<OsString> = vec![
            "-F".into(),
            "-m".into(),
            "0".into(),
            "-L".into(),
            label.into(),
            device.into(),
        ];
        let out = self.runner.stream(&self.mkfs, &args, None)?;
        if out.success() {
            Ok(())
        } else {
            Err(out.failure(&self.mkfs))
        }
    }
}

/// Map an `e2fsck -n` exit code to a filesystem state. Codes outside the
/// documented check results (usage errors, cancellation, library failures)
/// are not a statement about the filesystem.
fn classify_fsck(code: i32) -> Option<FsState> {
    match code {
        0 | 1 => Some(FsState::Clean),
        4 => Some(FsState::Inconsistent),
        8 => Some(FsState::Unformatted),
        _ => None,
    }
}
