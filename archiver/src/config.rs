//! Configuration management for the archiver.
//!
//! Loads configuration from a TOML file. The password seed may be supplied
//! through the `ARCHIVER_PASSWORD_SEED` environment variable instead of the
//! file.

use crate::capacity::OverheadModel;
use crate::fs::inventory::InventoryOptions;
use crate::utils::errors::{ArchiverError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Environment variable that overrides `backup.password_seed`.
pub const PASSWORD_SEED_ENV: &str = "ARCHIVER_PASSWORD_SEED";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub backup: BackupConfig,

    #[serde(default)]
    pub overhead: OverheadConfig,

    #[serde(default)]
    pub inventory: InventoryConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directory holding one container file per archive
    pub container_dir: PathBuf,

    /// Parent directory of the per-archive mount points
    pub mount_dir: PathBuf,

    /// Base secret combined with each container file name
    #[serde(default)]
    pub password_seed: Secret,

    /// Source trees to protect, processed in this order
    pub archives: Vec<ArchiveSpec>,

    /// Target fill ratio when creating a new container
    #[serde(default = "default_provision_fill_percent")]
    pub provision_fill_percent: u8,

    /// Fill ratio at which an existing container is grown
    #[serde(default = "default_reprovision_threshold")]
    pub reprovision_threshold: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverheadConfig {
    /// Bytes consumed regardless of container size (encryption header,
    /// superblocks, minimum journal)
    #[serde(default = "default_fixed_overhead_bytes")]
    pub fixed_bytes: u64,

    /// Share of the remaining space consumed by filesystem metadata
    #[serde(default = "default_overhead_percent")]
    pub percent: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryConfig {
    /// Rounding unit applied to every file size (0 disables rounding)
    #[serde(default = "default_block_size")]
    pub block_size: u64,

    /// Charge one block per directory
    #[serde(default = "default_true")]
    pub count_directories: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Transfer rate cap in KiB/s (0 = unlimited)
    #[serde(default = "default_bandwidth_limit")]
    pub bandwidth_limit_kbps: u32,

    /// Upper bound on deletions performed by one synchronization
    #[serde(default = "default_max_delete")]
    pub max_delete: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Run privileged tools through sudo
    #[serde(default)]
    pub sudo: bool,

    #[serde(default = "default_losetup")]
    pub losetup: String,

    #[serde(default = "default_cryptsetup")]
    pub cryptsetup: String,

    #[serde(default = "default_e2fsck")]
    pub e2fsck: String,

    #[serde(default = "default_mkfs")]
    pub mkfs: String,

    #[serde(default = "default_mount")]
    pub mount: String,

    #[serde(default = "default_umount")]
    pub umount: String,

    #[serde(default = "default_mountpoint")]
    pub mountpoint: String,

    #[serde(default = "default_rsync")]
    pub rsync: String,

    /// Where opened encrypted volumes appear
    #[serde(default = "default_mapper_dir")]
    pub mapper_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory receiving `archiver.log`
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

/// One source directory to protect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArchiveSpec {
    source: PathBuf,
    container_file_name: String,
}

impl ArchiveSpec {
    pub fn new(source: impl AsRef<Path>) -> Result<Self> {
        let raw = source.as_ref();
        if !raw.is_absolute() {
            return Err(ArchiverError::Config(format!(
                "archive path {} must be absolute",
                raw.display()
            )));
        }

        let mut normalized = PathBuf::new();
        for component in raw.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    return Err(ArchiverError::Config(format!(
                        "archive path {} must not contain '..'",
                        raw.display()
                    )));
                }
                other => normalized.push(other),
            }
        }

        let container_file_name = normalized
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                ArchiverError::Config(format!(
                    "archive path {} has no final segment to name its container",
                    raw.display()
                ))
            })?;

        if !container_file_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
            || container_file_name.starts_with('.')
        {
            return Err(ArchiverError::Config(format!(
                "archive {} yields container name `{container_file_name}`; use only A-Za-z0-9._- and no leading dot",
                raw.display()
            )));
        }

        Ok(Self {
            source: normalized,
            container_file_name,
        })
    }

    /// Source directory without a trailing separator.
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Source directory rendered with a trailing separator.
    pub fn display_path(&self) -> String {
        format!("{}/", self.source.display())
    }

    /// Stable container file name derived from the last path segment.
    pub fn container_file_name(&self) -> &str {
        &self.container_file_name
    }
}

impl TryFrom<String> for ArchiveSpec {
    type Error = ArchiverError;

    fn try_from(value: String) -> Result<Self> {
        ArchiveSpec::new(value)
    }
}

impl From<ArchiveSpec> for String {
    fn from(spec: ArchiveSpec) -> String {
        spec.source.to_string_lossy().into_owned()
    }
}

/// A string that never shows up in logs or debug output.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([redacted])")
    }
}

/// Per-container passphrase handed to the encrypted-volume backend on stdin.
#[derive(Clone, PartialEq, Eq)]
pub struct Passphrase(Vec<u8>);

impl Passphrase {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase([redacted])")
    }
}

// Default values
fn default_provision_fill_percent() -> u8 {
    70
}

fn default_reprovision_threshold() -> u8 {
    90
}

fn default_fixed_overhead_bytes() -> u64 {
    OverheadModel::default().fixed_bytes
}

fn default_overhead_percent() -> u8 {
    OverheadModel::default().percent
}

fn default_block_size() -> u64 {
    512
}

fn default_true() -> bool {
    true
}

fn default_bandwidth_limit() -> u32 {
    1300
}

fn default_max_delete() -> u32 {
    100
}

fn default_losetup() -> String {
    "losetup".to_string()
}

fn default_cryptsetup() -> String {
    "cryptsetup".to_string()
}

fn default_e2fsck() -> String {
    "e2fsck".to_string()
}

fn default_mkfs() -> String {
    "mkfs.ext4".to_string()
}

fn default_mount() -> String {
    "mount".to_string()
}

fn default_umount() -> String {
    "umount".to_string()
}

fn default_mountpoint() -> String {
    "mountpoint".to_string()
}

fn default_rsync() -> String {
    "rsync".to_string()
}

fn default_mapper_dir() -> PathBuf {
    PathBuf::from("/dev/mapper")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for OverheadConfig {
    fn default() -> Self {
        Self {
            fixed_bytes: default_fixed_overhead_bytes(),
            percent: default_overhead_percent(),
        }
    }
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            count_directories: true,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            bandwidth_limit_kbps: default_bandwidth_limit(),
            max_delete: default_max_delete(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            sudo: false,
            losetup: default_losetup(),
            cryptsetup: default_cryptsetup(),
            e2fsck: default_e2fsck(),
            mkfs: default_mkfs(),
            mount: default_mount(),
            umount: default_umount(),
            mountpoint: default_mountpoint(),
            rsync: default_rsync(),
            mapper_dir: default_mapper_dir(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
        }
    }
}

impl ToolsConfig {
    /// Every configured binary, labelled for diagnostics.
    pub fn binaries(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("losetup", self.losetup.as_str()),
            ("cryptsetup", self.cryptsetup.as_str()),
            ("e2fsck", self.e2fsck.as_str()),
            ("mkfs", self.mkfs.as_str()),
            ("mount", self.mount.as_str()),
            ("umount", self.umount.as_str()),
            ("mountpoint", self.mountpoint.as_str()),
            ("rsync", self.rsync.as_str()),
        ]
    }
}

impl Config {
    /// Load configuration from a TOML file, apply environment overrides and
    /// validate the result.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ArchiverError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config = Self::from_toml_str(&content)?;
        if let Ok(seed) = std::env::var(PASSWORD_SEED_ENV) {
            if !seed.is_empty() {
                config.backup.password_seed = Secret::new(seed);
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration text without validating it.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ArchiverError::Config(e.to_string()))
    }

    /// Check the cross-field invariants the lifecycle relies on.
    pub fn validate(&self) -> Result<()> {
        let backup = &self.backup;
        let fill = backup.provision_fill_percent;
        let threshold = backup.reprovision_threshold;
        if fill == 0 || fill > threshold || threshold > 100 {
            return Err(ArchiverError::Config(format!(
                "require 0 < provision_fill_percent ({fill}) <= reprovision_threshold ({threshold}) <= 100"
            )));
        }

        if backup.password_seed.is_empty() {
            return Err(ArchiverError::Config(format!(
                "password seed missing: set backup.password_seed or {PASSWORD_SEED_ENV}"
            )));
        }

        if backup.archives.is_empty() {
            return Err(ArchiverError::Config("no archives configured".into()));
        }

        for dir in [&backup.container_dir, &backup.mount_dir] {
            if !dir.is_absolute() {
                return Err(ArchiverError::Config(format!(
                    "{} must be an absolute path",
                    dir.display()
                )));
            }
        }

        let mut names = HashSet::new();
        for archive in &backup.archives {
            if !names.insert(archive.container_file_name()) {
                return Err(ArchiverError::Config(format!(
                    "archives share the container name `{}`; rename one of the source directories",
                    archive.container_file_name()
                )));
            }
        }

        if self.overhead.percent >= 100 {
            return Err(ArchiverError::Config(format!(
                "overhead.percent ({}) must be below 100",
                self.overhead.percent
            )));
        }

        Ok(())
    }

    pub fn overhead_model(&self) -> OverheadModel {
        OverheadModel {
            fixed_bytes: self.overhead.fixed_bytes,
            percent: self.overhead.percent,
        }
    }

    pub fn inventory_options(&self) -> InventoryOptions {
        InventoryOptions {
            block_size: Some(self.inventory.block_size).filter(|size| *size > 0),
            count_directories: self.inventory.count_directories,
        }
    }

    pub fn container_path(&self, archive: &ArchiveSpec) -> PathBuf {
        self.backup
            .container_dir
            .join(archive.container_file_name())
    }

    pub fn mount_point(&self, archive: &ArchiveSpec) -> PathBuf {
        self.backup.mount_dir.join(archive.container_file_name())
    }

    /// Derive the passphrase of one container: seed bytes then file name bytes.
    pub fn passphrase_for(&self, archive: &ArchiveSpec) -> Passphrase {
        let mut bytes = self.backup.password_seed.expose().as_bytes().to_vec();
        bytes.extend_from_slice(archive.container_file_name().as_bytes());
        Passphrase(bytes)
    }
}
