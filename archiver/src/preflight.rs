//! Checks run before any container is touched.
//!
//! Missing tools or unusable container/mount directories abort the whole run.
//! Archive checks are per archive: a bad source fails only that archive.

use crate::config::{ArchiveSpec, Config, ToolsConfig};
use crate::confirm::{Action, ConfirmPolicy};
use crate::utils::errors::{ArchiverError, Result};
use std::env;
use std::fs::{self, File};
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

const WRITE_TEST_FILE: &str = ".archiver-write-test";

/// Whether an archive has anything to protect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveReadiness {
    Ready,
    /// No non-empty file found
    Empty,
}

/// Run-wide checks: tools, container directory, mount directory.
pub fn run(config: &Config, policy: &ConfirmPolicy) -> Result<()> {
    check_tools(&config.tools)?;
    check_container_dir(&config.backup.container_dir, policy)?;
    check_mount_dir(&config.backup.mount_dir)?;
    Ok(())
}

/// Every configured binary (and sudo, when enabled) must resolve.
pub fn check_tools(tools: &ToolsConfig) -> Result<()> {
    let mut binaries = tools.binaries();
    if tools.sudo {
        binaries.push(("sudo", "sudo"));
    }

    let missing: Vec<String> = binaries
        .into_iter()
        .filter_map(|(label, binary)| match resolve_binary(binary) {
            Some(path) => {
                info!("Found {}: {}", label, path.display());
                None
            }
            None => Some(format!("{label} ({binary})")),
        })
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ArchiverError::Preflight(format!(
            "required tools not found: {}",
            missing.join(", ")
        )))
    }
}

/// Locate an executable by path or on `PATH`.
pub fn resolve_binary(binary: &str) -> Option<PathBuf> {
    if binary.contains('/') {
        let path = PathBuf::from(binary);
        return is_executable(&path).then_some(path);
    }
    let search = env::var_os("PATH")?;
    env::split_paths(&search)
        .map(|dir| dir.join(binary))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// The container directory must exist (created after confirmation) and be
/// writable.
pub fn check_container_dir(dir: &Path, policy: &ConfirmPolicy) -> Result<()> {
    if !dir.exists() {
        warn!("Container directory {} not found", dir.display());
        let question = format!("Create container directory {}?", dir.display());
        if !policy.confirm(Action::Create, &question) {
            return Err(ArchiverError::Preflight(format!(
                "container directory {} does not exist and creating it was declined",
                dir.display()
            )));
        }
        fs::create_dir_all(dir)?;
        info!("Created container directory {}", dir.display());
    }

    if !dir.is_dir() {
        return Err(ArchiverError::Preflight(format!(
            "{} is not a directory",
            dir.display()
        )));
    }

    let test_file = dir.join(WRITE_TEST_FILE);
    if test_file.exists() {
        return Err(ArchiverError::Preflight(format!(
            "leftover write test file {}; remove it manually",
            test_file.display()
        )));
    }
    fs::write(&test_file, b"test write").map_err(|e| {
        ArchiverError::Preflight(format!("{} is not writable: {e}", dir.display()))
    })?;
    fs::remove_file(&test_file)?;
    info!("Container directory {} is writable", dir.display());
    Ok(())
}

/// The mount directory must already exist.
pub fn check_mount_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        Ok(())
    } else {
        Err(ArchiverError::Preflight(format!(
            "mount directory {} does not exist",
            dir.display()
        )))
    }
}

/// The source must be a directory whose first non-empty file yields a byte.
pub fn check_archive(archive: &ArchiveSpec) -> Result<ArchiveReadiness> {
    let source = archive.source();
    if !source.is_dir() {
        return Err(ArchiverError::Inventory {
            path: source.to_path_buf(),
            reason: "not an existing directory".into(),
        });
    }

    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|e| ArchiverError::Inventory {
            path: e.path().unwrap_or(source).to_path_buf(),
            reason: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let unreadable = |reason: String| ArchiverError::Inventory {
            path: path.to_path_buf(),
            reason,
        };
        let mut byte = [0u8; 1];
        let read = File::open(path)
            .and_then(|mut file| file.read(&mut byte))
            .map_err(|e| unreadable(e.to_string()))?;
        if read == 1 {
            info!("{} is readable", archive.display_path());
            return Ok(ArchiveReadiness::Ready);
        }
    }

    warn!("{} holds no data to protect", archive.display_path());
    Ok(ArchiveReadiness::Empty)
}
