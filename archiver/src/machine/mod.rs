//! Container lifecycle of one archive.
//!
//! [`ArchiveMachine`] walks an archive from measuring its source to a
//! synchronized, mounted container and back down again:
//!
//! ```text
//! Start -> ContainerCheck -> (Provision ->) CapacityCheck -> (Reprovision -> Provision -> CapacityCheck ->)
//!   LoopAttach -> EncryptionCheck -> (Encrypt ->) MapVolume -> FsCheck -> (FormatFs ->)
//!   MountCheck -> Sync -> Teardown -> Done
//! ```
//!
//! Whatever the machine acquired is recorded in its [`ContainerState`] and
//! released in reverse order during `Teardown`, which runs after success,
//! after any failure and after an interrupt.

use crate::backend::{
    BackendError, Backends, FsState, HeaderSignature, KeyCheck, LoopDevice, SyncRequest,
};
use crate::capacity::{estimate_capacity, plan_container_size};
use crate::config::{ArchiveSpec, Config, Passphrase};
use crate::confirm::{Action, ConfirmPolicy};
use crate::fs::inventory::estimate_size;
use crate::resources::{ContainerState, Resource};
use crate::transfer::progress::format_bytes;
use crate::utils::errors::{ArchiverError, Result};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};


/// Lifecycle states, in the order a fresh archive passes through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Start,
    ContainerCheck,
    Provision,
    CapacityCheck,
    Reprovision,
    LoopAttach,
    EncryptionCheck,
    Encrypt,
    MapVolume,
    FsCheck,
    FormatFs,
    MountCheck,
    Sync,
    Teardown,
    Done,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Run-wide switches that shape every archive's lifecycle.
#[derive(Debug, Clone)]
pub struct MachineOptions {
    /// Leave every acquired resource attached at the end
    pub no_cleanup: bool,
    /// Prepare and mount the container but do not synchronize
    pub skip_sync: bool,
    /// KiB/s, 0 = unlimited
    pub bandwidth_limit_kbps: u32,
    pub max_delete: u32,
}

impl MachineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            no_cleanup: false,
            skip_sync: false,
            bandwidth_limit_kbps: config.sync.bandwidth_limit_kbps,
            max_delete: config.sync.max_delete,
        }
    }
}

/// How one archive's lifecycle ended.
#[derive(Debug)]
pub struct ArchiveOutcome {
    /// The state that failed and why
    pub failure: Option<(State, ArchiverError)>,
    /// Set when teardown could not release everything
    pub teardown_error: Option<ArchiverError>,
    /// Identifiers of resources still attached after the run
    pub resources_left: Vec<String>,
    pub source_size_bytes: u64,
}

impl ArchiveOutcome {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    pub fn interrupted(&self) -> bool {
        matches!(self.failure, Some((_, ArchiverError::Interrupted)))
    }
}

/// State machine driving one archive. Owns the archive's [`ContainerState`]
/// exclusively for the duration of the run.
pub struct ArchiveMachine<'a> {
    archive: &'a ArchiveSpec,
    config: &'a Config,
    backends: &'a Backends,
    policy: &'a ConfirmPolicy,
    options: &'a MachineOptions,
    cancel: CancellationToken,
    container: ContainerState,
    mount_point: PathBuf,
    passphrase: Passphrase,
    /// Provision is replacing an over-full container
    growing: bool,
    /// Growth already happened during this run
    reprovisioned: bool,
    last_fill_percent: f64,
}

impl<'a> ArchiveMachine<'a> {
    pub fn new(
        archive: &'a ArchiveSpec,
        config: &'a Config,
        backends: &'a Backends,
        policy: &'a ConfirmPolicy,
        options: &'a MachineOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            archive,
            config,
            backends,
            policy,
            options,
            cancel,
            container: ContainerState::new(config.container_path(archive)),
            mount_point: config.mount_point(archive),
            passphrase: config.passphrase_for(archive),
            growing: false,
            reprovisioned: false,
            last_fill_percent: 0.0,
        }
    }

    /// Drive the archive to `Done`. Teardown always runs.
    pub fn run(mut self) -> ArchiveOutcome {
        let name = self.archive.container_file_name().to_string();
        let mut current = State::Start;
        let mut failure = None;

        while current != State::Teardown {
            if self.cancel.is_cancelled() {
                failure = Some((current, ArchiverError::Interrupted));
                break;
            }
            debug!("[{}] entering {}", name, current);
            match self.step(current) {
                Ok(next) => current = next,
                Err(e) => {
                    failure = Some((current, e));
                    break;
                }
            }
        }

        if let Some((state, e)) = &failure {
            error!("[{}] {} failed: {}", name, state, e);
        }

        debug!("[{}] entering {}", name, State::Teardown);
        let (teardown_error, resources_left) = self.teardown();
        debug!("[{}] entering {}", name, State::Done);

        ArchiveOutcome {
            failure,
            teardown_error,
            resources_left,
            source_size_bytes: self.container.source_size_bytes,
        }
    }

    /// Perform one state's action and return the next state.
    fn step(&mut self, state: State) -> Result<State> {
        match state {
            State::Start => self.measure_source(),
            State::ContainerCheck => Ok(self.check_container()),
            State::Provision => self.provision(),
            State::CapacityCheck => self.check_capacity(),
            State::Reprovision => self.reprovision(),
            State::LoopAttach => self.attach_loop(),
            State::EncryptionCheck => self.check_encryption(),
            State::Encrypt => self.encrypt(),
            State::MapVolume => self.map_volume(),
            State::FsCheck => self.check_filesystem(),
            State::FormatFs => self.format_filesystem(),
            State::MountCheck => self.mount(),
            State::Sync => self.synchronize(),
            State::Teardown | State::Done => Ok(state),
        }
    }

    fn measure_source(&mut self) -> Result<State> {
        info!("Measuring {}", self.archive.display_path());
        let inventory = estimate_size(self.archive.source(), &self.config.inventory_options())?;
        self.container.source_size_bytes = inventory.total_bytes;
        info!(
            "{} needs {} ({} files, {} directories)",
            self.archive.display_path(),
            format_bytes(inventory.total_bytes),
            inventory.files,
            inventory.directories
        );
        Ok(State::ContainerCheck)
    }

    fn check_container(&self) -> State {
        if self.container.container_path.is_file() {
            State::CapacityCheck
        } else {
            info!(
                "Container {} does not exist",
                self.container.container_path.display()
            );
            State::Provision
        }
    }

    fn provision(&mut self) -> Result<State> {
        let path = self.container.container_path.clone();
        let source_bytes = self.container.source_size_bytes;
        let size = plan_container_size(
            source_bytes,
            self.config.backup.provision_fill_percent,
            &self.config.overhead_model(),
        );

        // Growth was already approved in Reprovision.
        if !self.growing {
            let question = format!(
                "Create container {} of {}?",
                path.display(),
                format_bytes(size)
            );
            if !self.policy.confirm(Action::Create, &question) {
                return Err(ArchiverError::Provision(format!(
                    "creating {} was declined",
                    path.display()
                )));
            }
        }

        info!(
            "Allocating {} for {} ({} of source data at {}% fill)",
            format_bytes(size),
            path.display(),
            format_bytes(source_bytes),
            self.config.backup.provision_fill_percent
        );
        self.backends
            .provision
            .allocate(&path, size)
            .map_err(|e| {
                ArchiverError::from_backend(e, |e| ArchiverError::Provision(e.to_string()))
            })?;
        self.growing = false;
        Ok(State::CapacityCheck)
    }

    /// Decision depends only on the source size and the container file, so
    /// repeating it without changes yields the same transition.
    fn check_capacity(&mut self) -> Result<State> {
        let path = &self.container.container_path;
        let container_bytes = fs::metadata(path)?.len();
        let estimate = estimate_capacity(
            self.container.source_size_bytes,
            container_bytes,
            &self.config.overhead_model(),
        );
        self.last_fill_percent = estimate.projected_fill_percent;
        let threshold = self.config.backup.reprovision_threshold;

        info!(
            "Container {} ({}, {} usable) will be {:.1}% full",
            path.display(),
            format_bytes(container_bytes),
            format_bytes(estimate.usable_bytes),
            estimate.projected_fill_percent
        );

        if estimate.needs_growth(threshold) {
            warn!(
                "Container {} is at or above the {}% growth threshold",
                path.display(),
                threshold
            );
            Ok(State::Reprovision)
        } else {
            Ok(State::LoopAttach)
        }
    }

    fn reprovision(&mut self) -> Result<State> {
        let path = self.container.container_path.clone();
        let exceeded = ArchiverError::CapacityExceeded {
            fill: self.last_fill_percent,
            threshold: self.config.backup.reprovision_threshold,
        };
        if self.reprovisioned {
            return Err(exceeded);
        }

        // Never grow a live container.
        let remaining = self.container.resources_mut().release_all(self.backends);
        if !remaining.is_empty() {
            return Err(ArchiverError::TeardownPartial { remaining });
        }
        let bound = self
            .backends
            .loops
            .associated(&path)
            .map_err(|e| ArchiverError::from_backend(e, ArchiverError::LoopAttach))?;
        if !bound.is_empty() {
            let devices: Vec<String> = bound.iter().map(LoopDevice::to_string).collect();
            return Err(ArchiverError::Provision(format!(
                "{} is still attached to {}; release it before growing the container",
                path.display(),
                devices.join(", ")
            )));
        }

        let question = format!(
            "Container {} is {:.1}% full. Replace it with a larger one? All of its contents will be synchronized again",
            path.display(),
            self.last_fill_percent
        );
        if !self.policy.confirm(Action::Reprovision, &question) {
            return Err(exceeded);
        }

        self.reprovisioned = true;
        self.growing = true;
        Ok(State::Provision)
    }

    fn attach_loop(&mut self) -> Result<State> {
        let path = self.container.container_path.clone();
        let wrap = |e: BackendError| ArchiverError::from_backend(e, ArchiverError::LoopAttach);

        let mut bound = self.backends.loops.associated(&path).map_err(wrap)?;
        let device = if bound.is_empty() {
            self.backends.loops.attach(&path).map_err(wrap)?
        } else {
            let device = bound.remove(0);
            for stale in &bound {
                warn!(
                    "Detaching stale loop device {} bound to {}",
                    stale,
                    path.display()
                );
                self.backends.loops.detach(stale).map_err(wrap)?;
            }
            info!(
                "Reusing loop device {} already bound to {}",
                device,
                path.display()
            );
            device
        };

        self.container.resources_mut().push(Resource::Loop(device));
        Ok(State::EncryptionCheck)
    }

    fn check_encryption(&mut self) -> Result<State> {
        let path = self.container.container_path.clone();
        let device = self.attached_loop()?;

        match self.backends.crypt.header_signature(&path) {
            HeaderSignature::Blank => {
                info!("Container {} is not encrypted yet", path.display());
                Ok(State::Encrypt)
            }
            HeaderSignature::Unrecognized => Err(ArchiverError::Corrupt(format!(
                "{} holds data without a recognizable encryption header; inspect it, or delete it to start over",
                path.display()
            ))),
            HeaderSignature::Luks => {
                let check = self
                    .backends
                    .crypt
                    .verify_passphrase(&device, &self.passphrase)
                    .map_err(|e| {
                        ArchiverError::from_backend(e, |e| {
                            ArchiverError::Corrupt(format!(
                                "cannot verify the passphrase of {}: {e}",
                                path.display()
                            ))
                        })
                    })?;
                match check {
                    KeyCheck::Valid => Ok(State::MapVolume),
                    KeyCheck::Rejected => Err(ArchiverError::Corrupt(format!(
                        "{} is encrypted but rejects the derived passphrase; refusing to overwrite it",
                        path.display()
                    ))),
                }
            }
        }
    }

    fn encrypt(&mut self) -> Result<State> {
        let path = self.container.container_path.clone();
        let device = self.attached_loop()?;

        let question = format!(
            "Encrypt container {} on {}? Its current contents will be destroyed",
            path.display(),
            device
        );
        if !self.policy.confirm(Action::Encrypt, &question) {
            return Err(ArchiverError::Encrypt(format!(
                "encrypting {} was declined",
                path.display()
            )));
        }

        info!("Encrypting {}", path.display());
        self.backends
            .crypt
            .format(&device, &self.passphrase)
            .map_err(|e| ArchiverError::from_backend(e, |e| ArchiverError::Encrypt(e.to_string())))?;
        Ok(State::MapVolume)
    }

    fn map_volume(&mut self) -> Result<State> {
        let device = self.attached_loop()?;
        let name = self.archive.container_file_name().to_string();

        let mapped = self
            .backends
            .crypt
            .open(&device, &name, &self.passphrase)
            .map_err(|e| ArchiverError::from_backend(e, ArchiverError::Map))?;

        self.container.resources_mut().push(Resource::Mapping {
            name,
            device: mapped,
        });
        Ok(State::FsCheck)
    }

    fn check_filesystem(&mut self) -> Result<State> {
        let mapped = self.mapped_device()?;
        let state = self
            .backends
            .filesystem
            .check(&mapped)
            .map_err(|e| ArchiverError::from_backend(e, ArchiverError::FsCheck))?;

        match state {
            FsState::Clean => Ok(State::MountCheck),
            FsState::Inconsistent => {
                warn!("Filesystem on {} is inconsistent", mapped.display());
                Ok(State::FormatFs)
            }
            FsState::Unformatted => {
                info!("{} holds no filesystem yet", mapped.display());
                Ok(State::FormatFs)
            }
        }
    }

    fn format_filesystem(&mut self) -> Result<State> {
        let mapped = self.mapped_device()?;

        let question = format!(
            "Create a new filesystem on {}? Its current contents will be destroyed",
            mapped.display()
        );
        if !self.policy.confirm(Action::Format, &question) {
            return Err(ArchiverError::Format(format!(
                "formatting {} was declined",
                mapped.display()
            )));
        }

        info!("Formatting {}", mapped.display());
        self.backends
            .filesystem
            .format(&mapped, self.archive.container_file_name())
            .map_err(|e| ArchiverError::from_backend(e, |e| ArchiverError::Format(e.to_string())))?;
        Ok(State::MountCheck)
    }

    fn mount(&mut self) -> Result<State> {
        let mapped = self.mapped_device()?;
        let mount_point = self.mount_point.clone();
        let wrap =
            |e: BackendError| ArchiverError::from_backend(e, |e| ArchiverError::Mount(e.to_string()));

        if self.backends.mount.is_mounted(&mount_point).map_err(wrap)? {
            info!("{} is already mounted, reusing it", mount_point.display());
            self.container
                .resources_mut()
                .push(Resource::Mount { path: mount_point });
            return Ok(State::Sync);
        }

        if !mount_point.is_dir() {
            let question = format!("Create mount point {}?", mount_point.display());
            if !self.policy.confirm(Action::MountCreate, &question) {
                return Err(ArchiverError::Mount(format!(
                    "mount point {} does not exist and creating it was declined",
                    mount_point.display()
                )));
            }
            self.backends
                .mount
                .create_mount_point(&mount_point)
                .map_err(wrap)?;
        }

        // Tracked before mounting so a failed mount still removes the directory.
        self.container.resources_mut().push(Resource::Mount {
            path: mount_point.clone(),
        });
        self.backends
            .mount
            .mount(&mapped, &mount_point)
            .map_err(wrap)?;
        Ok(State::Sync)
    }

    fn synchronize(&mut self) -> Result<State> {
        if self.options.skip_sync {
            info!(
                "Skipping synchronization of {}",
                self.archive.display_path()
            );
            return Ok(State::Teardown);
        }

        let target = self
            .container
            .mount_point()
            .ok_or_else(|| ArchiverError::Mount("no mount point is held".into()))?;
        let request = SyncRequest {
            source: self.archive.source(),
            target,
            bandwidth_limit_kbps: self.options.bandwidth_limit_kbps,
            max_delete: self.options.max_delete,
        };
        info!(
            "Synchronizing {} into {}",
            self.archive.display_path(),
            target.display()
        );
        self.backends
            .sync
            .synchronize(&request)
            .map_err(|e| ArchiverError::from_backend(e, ArchiverError::Sync))?;
        Ok(State::Teardown)
    }

    /// Release everything held, unless cleanup is disabled.
    fn teardown(&mut self) -> (Option<ArchiverError>, Vec<String>) {
        if self.container.resources().is_empty() {
            return (None, Vec::new());
        }

        if self.options.no_cleanup {
            let left: Vec<String> = self
                .container
                .resources_mut()
                .abandon()
                .iter()
                .map(Resource::identifier)
                .collect();
            warn!("Cleanup disabled, leaving attached: {}", left.join(", "));
            return (None, left);
        }

        let remaining = self.container.resources_mut().release_all(self.backends);
        if remaining.is_empty() {
            (None, remaining)
        } else {
            let e = ArchiverError::TeardownPartial {
                remaining: remaining.clone(),
            };
            warn!("{}", e);
            (Some(e), remaining)
        }
    }

    fn attached_loop(&self) -> Result<LoopDevice> {
        self.container.loop_device().cloned().ok_or_else(|| {
            ArchiverError::LoopAttach(BackendError::Unexpected(
                "no loop device attached".into(),
            ))
        })
    }

    fn mapped_device(&self) -> Result<PathBuf> {
        self.container
            .mapped_volume()
            .map(|(_, device)| device.to_path_buf())
            .ok_or_else(|| ArchiverError::Map(BackendError::Unexpected("no volume mapped".into())))
    }

    #[cfg(test)]
    fn container_state(&self) -> &ContainerState {
        &self.container
    }
}
