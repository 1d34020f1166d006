//! Recording fake backends for unit tests.
//!
//! Every fake shares one [`HostState`], so a single journal shows the exact
//! order of operations across loop, crypt, filesystem, mount, sync and
//! provision calls. Operations are keyed by the first word of their journal
//! entry (`attach`, `open`, `umount`, ...), which is what failure and
//! interruption injection match against.

use crate::backend::{
    BackendError, BackendResult, Backends, CryptBackend, FilesystemBackend, FsState,
    HeaderSignature, KeyCheck, LoopBackend, LoopDevice, MountBackend, ProvisionBackend,
    SyncBackend, SyncRequest,
};
use crate::config::Passphrase;
use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

const RELEASE_OPS: &[&str] = &["umount", "rmdir", "close", "detach"];

pub(crate) struct HostState {
    journal: Vec<String>,
    header: HeaderSignature,
    key_check: KeyCheck,
    fs_state: FsState,
    associated: Vec<LoopDevice>,
    mounted: HashSet<PathBuf>,
    next_loop: u32,
    fail_on: Option<String>,
    interrupt_on: Option<(String, CancellationToken)>,
}

impl Default for HostState {
    fn default() -> Self {
        Self {
            journal: Vec::new(),
            header: HeaderSignature::Blank,
            key_check: KeyCheck::Rejected,
            fs_state: FsState::Unformatted,
            associated: Vec::new(),
            mounted: HashSet::new(),
            next_loop: 0,
            fail_on: None,
            interrupt_on: None,
        }
    }
}

/// Handle on the shared fake host.
#[derive(Clone, Default)]
pub(crate) struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap()
    }

    pub fn backends(&self) -> Backends {
        Backends {
            loops: Box::new(self.clone()),
            crypt: Box::new(self.clone()),
            filesystem: Box::new(self.clone()),
            mount: Box::new(self.clone()),
            sync: Box::new(self.clone()),
            provision: Box::new(self.clone()),
        }
    }

    pub fn journal(&self) -> Vec<String> {
        self.lock().journal.clone()
    }

    /// Journal entries of release operations only.
    pub fn releases(&self) -> Vec<String> {
        self.journal()
            .into_iter()
            .filter(|entry| RELEASE_OPS.contains(&op_of(entry)))
            .collect()
    }

    /// Number of journal entries for `op`.
    pub fn count(&self, op: &str) -> usize {
        self.journal()
            .iter()
            .filter(|entry| op_of(entry) == op)
            .count()
    }

    /// Make every call of `op` fail.
    pub fn fail_on(&self, op: &str) {
        self.lock().fail_on = Some(op.to_string());
    }

    /// Cancel `token` and report an interruption when `op` runs, the way the
    /// command runner does when a signal arrives mid-command.
    pub fn interrupt_on(&self, op: &str, token: CancellationToken) {
        self.lock().interrupt_on = Some((op.to_string(), token));
    }

    pub fn set_header(&self, header: HeaderSignature) {
        self.lock().header = header;
    }

    pub fn set_key_check(&self, key_check: KeyCheck) {
        self.lock().key_check = key_check;
    }

    pub fn set_fs_state(&self, fs_state: FsState) {
        self.lock().fs_state = fs_state;
    }

    /// Pretend `devices` are already bound to the container.
    pub fn set_associated(&self, devices: Vec<LoopDevice>) {
        self.lock().associated = devices;
    }

    pub fn set_mounted(&self, mount_point: &Path) {
        self.lock().mounted.insert(mount_point.to_path_buf());
    }

    /// An encrypted, formatted container whose passphrase matches.
    pub fn prepared(&self) {
        let mut state = self.lock();
        state.header = HeaderSignature::Luks;
        state.key_check = KeyCheck::Valid;
        state.fs_state = FsState::Clean;
    }

    fn call(&self, entry: String) -> BackendResult<MutexGuard<'_, HostState>> {
        let mut state = self.lock();
        let op = op_of(&entry).to_string();
        state.journal.push(entry);

        if state.fail_on.as_deref() == Some(op.as_str()) {
            return Err(BackendError::Failed {
                program: op,
                code: 1,
                diagnostic: "injected failure".into(),
            });
        }
        if let Some((target, token)) = &state.interrupt_on {
            if *target == op {
                token.cancel();
                return Err(BackendError::Interrupted { program: op });
            }
        }
        Ok(state)
    }
}

fn op_of(entry: &str) -> &str {
    entry.split_whitespace().next().unwrap_or("")
}

impl LoopBackend for FakeHost {
    fn associated(&self, file: &Path) -> BackendResult<Vec<LoopDevice>> {
        let state = self.call(format!("associated {}", file.display()))?;
        Ok(state.associated.clone())
    }

    fn attach(&self, file: &Path) -> BackendResult<LoopDevice> {
        let mut state = self.call(format!("attach {}", file.display()))?;
        let device = LoopDevice::new(format!("/dev/loop{}", state.next_loop));
        state.next_loop += 1;
        state.associated.push(device.clone());
        Ok(device)
    }

    fn detach(&self, device: &LoopDevice) -> BackendResult<()> {
        let mut state = self.call(format!("detach {device}"))?;
        state.associated.retain(|held| held != device);
        Ok(())
    }
}

impl CryptBackend for FakeHost {
    fn header_signature(&self, _container: &Path) -> HeaderSignature {
        let mut state = self.lock();
        state.journal.push("signature".into());
        state.header
    }

    fn verify_passphrase(
        &self,
        device: &LoopDevice,
        _passphrase: &Passphrase,
    ) -> BackendResult<KeyCheck> {
        let state = self.call(format!("verify {device}"))?;
        Ok(state.key_check)
    }

    fn format(&self, device: &LoopDevice, _passphrase: &Passphrase) -> BackendResult<()> {
        let mut state = self.call(format!("luksFormat {device}"))?;
        state.header = HeaderSignature::Luks;
        state.key_check = KeyCheck::Valid;
        Ok(())
    }

    fn open(
        &self,
        _device: &LoopDevice,
        name: &str,
        _passphrase: &Passphrase,
    ) -> BackendResult<PathBuf> {
        self.call(format!("open {name}"))?;
        Ok(PathBuf::from("/dev/mapper").join(name))
    }

    fn close(&self, name: &str) -> BackendResult<()> {
        self.call(format!("close {name}"))?;
        Ok(())
    }
}

impl FilesystemBackend for FakeHost {
    fn check(&self, device: &Path) -> BackendResult<FsState> {
        let state = self.call(format!("fsck {}", device.display()))?;
        Ok(state.fs_state)
    }

    fn format(&self, device: &Path, label: &str) -> BackendResult<()> {
        let mut state = self.call(format!("mkfs {} {label}", device.display()))?;
        state.fs_state = FsState::Clean;
        Ok(())
    }
}

impl MountBackend for FakeHost {
    fn is_mounted(&self, mount_point: &Path) -> BackendResult<bool> {
        let state = self.call(format!("mountpoint {}", mount_point.display()))?;
        Ok(state.mounted.contains(mount_point))
    }

    fn create_mount_point(&self, mount_point: &Path) -> BackendResult<()> {
        self.call(format!("mkdir {}", mount_point.display()))?;
        fs::create_dir_all(mount_point)?;
        Ok(())
    }

    fn mount(&self, device: &Path, mount_point: &Path) -> BackendResult<()> {
        let mut state = self.call(format!(
            "mount {} {}",
            device.display(),
            mount_point.display()
        ))?;
        state.mounted.insert(mount_point.to_path_buf());
        Ok(())
    }

    fn unmount(&self, mount_point: &Path) -> BackendResult<()> {
        let mut state = self.call(format!("umount {}", mount_point.display()))?;
        state.mounted.remove(mount_point);
        Ok(())
    }

    fn remove_mount_point(&self, mount_point: &Path) -> BackendResult<()> {
        self.call(format!("rmdir {}", mount_point.display()))?;
        let _ = fs::remove_dir(mount_point);
        Ok(())
    }
}

impl SyncBackend for FakeHost {
    fn synchronize(&self, request: &SyncRequest<'_>) -> BackendResult<()> {
        self.call(format!(
            "rsync {} {} {}",
            request.source.display(),
            request.target.display(),
            request.bandwidth_limit_kbps
        ))?;
        Ok(())
    }
}

impl ProvisionBackend for FakeHost {
    fn allocate(&self, path: &Path, size: u64) -> BackendResult<()> {
        self.call(format!("allocate {size}"))?;
        File::create(path)?.set_len(size)?;
        Ok(())
    }
}
