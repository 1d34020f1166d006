//! Native container allocation by zero-filling a file.
//!
//! The new image is written next to the target as `.<name>.partial` and only
//! renamed over the target once it is complete and synced, so an interrupted
//! or failed allocation never damages an existing container. Container names
//! never start with a dot, so the temporary name cannot belong to another
//! archive.

use super::{BackendError, BackendResult, ProvisionBackend};
use crate::transfer::progress::{format_bytes, format_duration, format_speed, ProgressTracker};
use nix::sys::statvfs::statvfs;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const CHUNK_SIZE: usize = 1024 * 1024;
const PARTIAL_SUFFIX: &str = ".partial";

/// Zero-filling allocator.
#[derive(Debug, Clone)]
pub struct ZeroFill {
    cancel: CancellationToken,
}

impl ZeroFill {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    fn write_zeros(&self, file: &mut File, size: u64, label: &Path) -> BackendResult<()> {
        let chunk = vec![0u8; CHUNK_SIZE];
        let mut tracker = ProgressTracker::new(size);
        let mut written: u64 = 0;

        while written < size {
            if self.cancel.is_cancelled() {
                return Err(BackendError::Interrupted {
                    program: "zero-fill".to_string(),
                });
            }
            let len = (size - written).min(CHUNK_SIZE as u64) as usize;
            file.write_all(&chunk[..len])?;
            written += len as u64;

            let progress = tracker.update(written).clone();
            if tracker.should_report() {
                info!(
                    "Allocating {}: {:.0}% of {} at {}, about {} left",
                    label.display(),
                    progress.percent_complete,
                    format_bytes(size),
                    format_speed(progress.bytes_per_second),
                    format_duration(progress.eta_seconds)
                );
            }
        }

        debug!(
            "Wrote {} in {} ({} average)",
            format_bytes(written),
            format_duration(tracker.elapsed().as_secs()),
            format_speed(tracker.average_speed())
        );
        Ok(())
    }
}

impl ProvisionBackend for ZeroFill {
    fn allocate(&self, path: &Path, size: u64) -> BackendResult<()> {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let partial = partial_path(path);

        // The old container stays until the rename, so its blocks are not free.
        let available = available_bytes(parent)?;
        if size > available {
            return Err(BackendError::Unexpected(format!(
                "not enough space in {}: {} required, {} available",
                parent.display(),
                format_bytes(size),
                format_bytes(available)
            )));
        }

        let result = (|| -> BackendResult<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&partial)?;
            self.write_zeros(&mut file, size, path)?;
            file.sync_all()?;
            drop(file);
            fs::rename(&partial, path)?;
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_file(&partial);
        }
        result
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(path.file_name().unwrap_or(path.as_os_str()));
    name.push(PARTIAL_SUFFIX);
    path.with_file_name(name)
}

fn available_bytes(dir: &Path) -> BackendResult<u64> {
    let stats = statvfs(dir).map_err(|errno| BackendError::Io(errno.into()))?;
    Ok((stats.blocks_available() as u64).saturating_mul(stats.fragment_size() as u64))
}
