//! Mirroring via `rsync`.

use super::command::CommandRunner;
use super::{BackendResult, SyncBackend, SyncRequest};
use std::ffi::OsString;
use tracing::warn;

/// rsync: "partial transfer due to vanished source files".
const EXIT_VANISHED: i32 = 24;

/// System synchronization backend.
#[derive(Debug, Clone)]
pub struct Rsync {
    runner: CommandRunner,
    binary: String,
}

impl Rsync {
    pub fn new(runner: CommandRunner, binary: impl Into<String>) -> Self {
        Self {
            runner,
            binary: binary.into(),
        }
    }
}

impl SyncBackend for Rsync {
    fn synchronize(&self, request: &SyncRequest<'_>) -> BackendResult<()> {
        let args = build_args(request);
        let out = self.runner.stream(&self.binary, &args, None)?;
        match out.status {
            0 => Ok(()),
            EXIT_VANISHED => {
                warn!(
                    "Some files under {} vanished during synchronization",
                    request.source.display()
                );
                Ok(())
            }
            _ => Err(out.failure(&self.binary)),
        }
    }
}

/// The source is passed without a trailing separator so the tree lands in a
/// directory of the same name inside the mount point.
fn build_args(request: &SyncRequest<'_>) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    if request.bandwidth_limit_kbps > 0 {
        args.push("--bwlimit".into());
        args.push(request.bandwidth_limit_kbps.to_string().into());
    }
    for flag in [
        "--compress",
        "--recursive",
        "--links",
        "--perms",
        "--times",
        "--group",
        "--owner",
        "--partial",
        "--verbose",
        "--progress",
        "--delete",
        "--delete-delay",
        "--human-readable",
        "--itemize-changes",
    ] {
        args.push(flag.into());
    }
    args.push(format!("--max-delete={}", request.max_delete).into());

    let source = request.source.to_string_lossy();
    let source = source.trim_end_matches('/');
    args.push(if source.is_empty() { "/" } else { source }.into());

    let mut target = request.target.as_os_str().to_os_string();
    if !target.to_string_lossy().ends_with('/') {
        target.push("/");
    }
    args.push(target);
    args
}
