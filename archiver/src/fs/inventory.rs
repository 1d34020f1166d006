//! Source tree inventory.
//!
//! Computes the on-disk size a source tree will need once mirrored, rounding
//! every file up to the filesystem block and counting hard-linked files once.
//! Every regular file is opened to prove it is readable: permission bits can
//! lie (networked filesystems with server-side ownership mismatches), and a
//! partially readable source must never be sized or synchronized.

use crate::utils::errors::{ArchiverError, Result};
use std::collections::HashSet;
use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

/// Options controlling how sizes are accumulated
#[derive(Debug, Clone)]
pub struct InventoryOptions {
    /// Rounding unit applied to every file (None = exact byte sizes)
    pub block_size: Option<u64>,

    /// Charge one rounding unit per directory below the root
    pub count_directories: bool,
}

impl Default for InventoryOptions {
    fn default() -> Self {
        Self {
            block_size: Some(512),
            count_directories: true,
        }
    }
}

/// Result of walking a source tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    /// Block-rounded byte total
    pub total_bytes: u64,

    /// Regular files counted (hard links included)
    pub files: u64,

    /// Directories below the root
    pub directories: u64,

    /// Extra links to an already counted file
    pub duplicate_links: u64,
}

/// Walk `root` once and compute its block-rounded size.
///
/// Aborts with [`ArchiverError::Inventory`] naming the first unreadable file
/// or directory; no partial total is ever returned.
pub fn estimate_size(root: &Path, options: &InventoryOptions) -> Result<Inventory> {
    let mut inventory = Inventory::default();
    let mut seen = HashSet::new();
    let block = options.block_size.filter(|size| *size > 0);

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| ArchiverError::Inventory {
            path: e.path().unwrap_or(root).to_path_buf(),
            reason: e
                .io_error()
                .map(|io| io.to_string())
                .unwrap_or_else(|| e.to_string()),
        })?;

        let file_type = entry.file_type();
        if file_type.is_dir() {
            if entry.depth() > 0 {
                inventory.directories += 1;
                if options.count_directories {
                    inventory.total_bytes += block.unwrap_or(0);
                }
            }
            continue;
        }

        // Symlinks are mirrored as links and sockets/devices are not data.
        if !file_type.is_file() {
            continue;
        }

        let path = entry.path();
        File::open(path).map_err(|e| ArchiverError::Inventory {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let metadata = entry.metadata().map_err(|e| ArchiverError::Inventory {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        inventory.files += 1;
        if inventory.files % 10_000 == 0 {
            debug!(
                "Inventory of {}: {} files so far",
                root.display(),
                inventory.files
            );
        }

        if metadata.nlink() > 1 && !seen.insert((metadata.dev(), metadata.ino())) {
            inventory.duplicate_links += 1;
            continue;
        }

        inventory.total_bytes += match block {
            Some(block) => metadata.len().div_ceil(block) * block,
            None => metadata.len(),
        };
    }

    Ok(inventory)
}
