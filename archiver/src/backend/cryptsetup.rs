//! Encrypted volumes via `cryptsetup` (LUKS1).
//!
//! Passphrases are always written to the tool's stdin (`--key-file -`), never
//! placed on the command line.

use super::command::CommandRunner;
use super::{BackendError, BackendResult, CryptBackend, HeaderSignature, KeyCheck, LoopDevice};
use crate::config::Passphrase;
use std::ffi::OsString;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

const DEFAULT_MAPPER_DIR: &str = "/dev/mapper";
const HEADER_WINDOW: usize = 4096;
const LUKS_MAGIC: &[u8] = b"LUKS\xba\xbe";
/// cryptsetup exit code for "no permission (bad passphrase)".
const EXIT_BAD_PASSPHRASE: i32 = 2;

/// Classify the first bytes of a container file.
pub fn read_header_signature(container: &Path) -> HeaderSignature {
    let mut header = Vec::with_capacity(HEADER_WINDOW);
    let read = File::open(container)
        .and_then(|file| file.take(HEADER_WINDOW as u64).read_to_end(&mut header));
    if read.is_err() {
        return HeaderSignature::Blank;
    }

    if header.starts_with(LUKS_MAGIC) {
        HeaderSignature::Luks
    } else if header.iter().all(|byte| *byte == 0) {
        HeaderSignature::Blank
    } else {
        HeaderSignature::Unrecognized
    }
}

/// System encrypted-volume backend.
#[derive(Debug, Clone)]
pub struct Cryptsetup {
    runner: CommandRunner,
    binary: String,
    mapper_dir: PathBuf,
}

impl Cryptsetup {
    pub fn new(runner: CommandRunner, binary: impl Into<String>) -> Self {
        Self {
            runner,
            binary: binary.into(),
            mapper_dir: PathBuf::from(DEFAULT_MAPPER_DIR),
        }
    }

    /// Look for mapped nodes somewhere other than `/dev/mapper`.
    pub fn with_mapper_dir(mut self, mapper_dir: impl Into<PathBuf>) -> Self {
        self.mapper_dir = mapper_dir.into();
        self
    }

    fn mapped_node(&self, name: &str) -> PathBuf {
        self.mapper_dir.join(name)
    }
}

impl CryptBackend for Cryptsetup {
    fn verify_passphrase(
        &self,
        device: &LoopDevice,
        passphrase: &Passphrase,
    ) -> BackendResult<KeyCheck> {
        let args: Vec<OsString> = vec![
            "open".into(),
            "--test-passphrase".into(),
            "--type".into(),
            "luks".into(),
            "--batch-mode".into(),
            "--key-file".into(),
            "-".into(),
            device.path().into(),
        ];
        let out = self
            .runner
            .output(&self.binary, &args, Some(passphrase.as_bytes()))?;

        if out.success() {
            return Ok(KeyCheck::Valid);
        }

        let diagnostic = out.diagnostic().to_ascii_lowercase();
        if out.status == EXIT_BAD_PASSPHRASE
            || diagnostic.contains("no key available")
            || diagnostic.contains("passphrase is incorrect")
        {
            return Ok(KeyCheck::Rejected);
        }
        Err(out.failure(&self.binary))
    }

    fn format(&self, device: &LoopDevice, passphrase: &Passphrase) -> BackendResult<()> {
        let args: Vec<OsString> = vec![
            "luksFormat".into(),
            "--type".into(),
            "luks1".into(),
            "--batch-mode".into(),
            "--key-file".into(),
            "-".into(),
            device.path().into(),
        ];
        let out = self
            .runner
            .stream(&self.binary, &args, Some(passphrase.as_bytes()))?;
        if out.success() {
            Ok(())
        } else {
            Err(out.failure(&self.binary))
        }
    }

    fn open(
        &self,
        device: &LoopDevice,
        name: &str,
        passphrase: &Passphrase,
    ) -> BackendResult<PathBuf> {
        let node = self.mapped_node(name);
        if node.exists() {
            return Ok(node);
        }

        let args: Vec<OsString> = vec![
            "open".into(),
            "--type".into(),
            "luks".into(),
            "--batch-mode".into(),
            "--key-file".into(),
            "-".into(),
            device.path().into(),
            name.into(),
        ];
        let out = self
            .runner
            .output(&self.binary, &args, Some(passphrase.as_bytes()))?;
        if !out.success() {
            return Err(out.failure(&self.binary));
        }

        if !node.exists() {
            return Err(BackendError::Unexpected(format!(
                "{} reported success but {} is missing",
                self.binary,
                node.display()
            )));
        }
        Ok(node)
    }

    fn close(&self, name: &str) -> BackendResult<()> {
        if !self.mapped_node(name).exists() {
            return Ok(());
        }

        let args: Vec<OsString> = vec!["close".into(), name.into()];
        let out = self
            .runner
            .uncancellable()
            .output(&self.binary, &args, None)?;
        if out.success() {
            return Ok(());
        }

        let diagnostic = out.diagnostic().to_ascii_lowercase();
        if diagnostic.contains("not active")
            || diagnostic.contains("does not exist")
            || diagnostic.contains("doesn't exist")
        {
            return Ok(());
        }
        Err(out.failure(&self.binary))
    }
}
