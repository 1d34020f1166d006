//! Loop devices via util-linux `losetup`.

use super::command::CommandRunner;
use super::{BackendError, BackendResult, LoopBackend, LoopDevice};
use serde::Deserialize;
use std::ffi::OsString;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct LoopListing {
    #[serde(default)]
    loopdevices: Vec<LoopEntry>,
}

#[derive(Debug, Deserialize)]
struct LoopEntry {
    name: String,
}

/// System loop backend.
#[derive(Debug, Clone)]
pub struct Losetup {
    runner: CommandRunner,
    binary: String,
}

impl Losetup {
    pub fn new(runner: CommandRunner, binary: impl Into<String>) -> Self {
        Self {
            runner,
            binary: binary.into(),
        }
    }
}

impl LoopBackend for Losetup {
    fn associated(&self, file: &Path) -> BackendResult<Vec<LoopDevice>> {
        let args: Vec<OsString> = vec![
            "--list".into(),
            "--json".into(),
            "--output".into(),
            "NAME".into(),
            "--associated".into(),
            file.into(),
        ];
        let out = self.runner.output(&self.binary, &args, None)?;
        if !out.success() {
            return Err(out.failure(&self.binary));
        }
        parse_listing(&out.stdout)
    }

    fn attach(&self, file: &Path) -> BackendResult<LoopDevice> {
        let args: Vec<OsString> = vec!["--find".into(), "--show".into(), file.into()];
        let out = self.runner.output(&self.binary, &args, None)?;
        if !out.success() {
            return Err(out.failure(&self.binary));
        }

        let device = out.stdout.trim();
        if !device.starts_with("/dev/") {
            return Err(BackendError::Unexpected(format!(
                "{} --find --show returned no device for {}: {}",
                self.binary,
                file.display(),
                out.diagnostic()
            )));
        }
        Ok(LoopDevice::new(device))
    }

    fn detach(&self, device: &LoopDevice) -> BackendResult<()> {
        let args: Vec<OsString> = vec!["--detach".into(), device.path().into()];
        let out = self
            .runner
            .uncancellable()
            .output(&self.binary, &args, None)?;
        if out.success() {
            return Ok(());
        }

        let diagnostic = out.diagnostic().to_ascii_lowercase();
        if diagnostic.contains("no such device") || diagnostic.contains("no such file") {
            return Ok(());
        }
        Err(out.failure(&self.binary))
    }
}

fn parse_listing(stdout: &str) -> BackendResult<Vec<LoopDevice>> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let listing: LoopListing = serde_json::from_str(stdout).map_err(|e| {
        BackendError::Unexpected(format!("unparseable losetup listing: {e}"))
    })?;
    Ok(listing
        .loopdevices
        .into_iter()
        .map(|entry| LoopDevice::new(entry.name))
        .collect())
}
