//! Mounts via util-linux `mount`, `umount` and `mountpoint`.

use super::command::CommandRunner;
use super::{BackendResult, MountBackend};
use std::ffi::OsString;
use std::fs;
use std::path::Path;

/// System mount backend. Mount point directories are managed natively unless
/// sudo is enabled, in which case `mkdir`/`rmdir` run through it as well.
#[derive(Debug, Clone)]
pub struct SystemMount {
    runner: CommandRunner,
    mount_binary: String,
    umount_binary: String,
    mountpoint_binary: String,
}

impl SystemMount {
    pub fn new(
        runner: CommandRunner,
        mount_binary: impl Into<String>,
        umount_binary: impl Into<String>,
        mountpoint_binary: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            mount_binary: mount_binary.into(),
            umount_binary: umount_binary.into(),
            mountpoint_binary: mountpoint_binary.into(),
        }
    }

    fn mounted(&self, runner: &CommandRunner, mount_point: &Path) -> BackendResult<bool> {
        if !mount_point.exists() {
            return Ok(false);
        }
        let args: Vec<OsString> = vec!["-q".into(), mount_point.into()];
        let out = runner.output(&self.mountpoint_binary, &args, None)?;
        Ok(out.success())
    }
}

fn run_checked(runner: &CommandRunner, program: &str, args: &[OsString]) -> BackendResult<()> {
    let out = runner.output(program, args, None)?;
    if out.success() {
        Ok(())
    } else {
        Err(out.failure(program))
    }
}

impl MountBackend for SystemMount {
    fn is_mounted(&self, mount_point: &Path) -> BackendResult<bool> {
        self.mounted(&self.runner, mount_point)
    }

    fn create_mount_point(&self, mount_point: &Path) -> BackendResult<()> {
        if self.runner.uses_sudo() {
            let args: Vec<OsString> = vec!["-p".into(), mount_point.into()];
            return run_checked(&self.runner, "mkdir", &args);
        }
        fs::create_dir_all(mount_point)?;
        Ok(())
    }

    fn mount(&self, device: &Path, mount_point: &Path) -> BackendResult<()> {
        let args: Vec<OsString> = vec![device.into(), mount_point.into()];
        run_checked(&self.runner, &self.mount_binary, &args)
    }

    fn unmount(&self, mount_point: &Path) -> BackendResult<()> {
        let runner = self.runner.uncancellable();
        if !self.mounted(&runner, mount_point)? {
            return Ok(());
        }
        let args: Vec<OsString> = vec![mount_point.into()];
        run_checked(&runner, &self.umount_binary, &args)
    }

    fn remove_mount_point(&self, mount_point: &Path) -> BackendResult<()> {
        if !mount_point.exists() {
            return Ok(());
        }
        if self.runner.uses_sudo() {
            let args: Vec<OsString> = vec![mount_point.into()];
            return run_checked(&self.runner.uncancellable(), "rmdir", &args);
        }
        fs::remove_dir(mount_point)?;
        Ok(())
    }
}
