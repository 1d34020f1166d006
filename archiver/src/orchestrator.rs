//! Run loop over every configured archive.
//!
//! Archives are processed one at a time in configuration order, each through
//! its own [`ArchiveMachine`] including teardown, before the next begins. A
//! failed archive does not stop the run; an interrupt does, and every archive
//! not yet started is reported as skipped.

use crate::backend::Backends;
use crate::config::{ArchiveSpec, Config};
use crate::confirm::ConfirmPolicy;
use crate::machine::{ArchiveMachine, MachineOptions, State};
use crate::preflight::{self, ArchiveReadiness};
use crate::transfer::progress::{format_bytes, format_duration};
use crate::utils::errors::ArchiverError;
use chrono::Local;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Exit status of an interrupted run (128 + SIGINT).
pub const EXIT_INTERRUPTED: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveStatus {
    Success,
    Skipped,
    Failed,
}

/// Result of one archive.
#[derive(Debug)]
pub struct ArchiveReport {
    pub archive: String,
    pub status: ArchiveStatus,
    pub failed_state: Option<State>,
    pub error: Option<ArchiverError>,
    pub teardown_error: Option<ArchiverError>,
    pub resources_left: Vec<String>,
    pub source_size_bytes: u64,
    pub elapsed: Duration,
}

impl ArchiveReport {
    fn skipped(archive: &ArchiveSpec) -> Self {
        Self {
            archive: archive.display_path(),
            status: ArchiveStatus::Skipped,
            failed_state: None,
            error: None,
            teardown_error: None,
            resources_left: Vec::new(),
            source_size_bytes: 0,
            elapsed: Duration::ZERO,
        }
    }
}

/// Result of a whole run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub archives: Vec<ArchiveReport>,
    pub interrupted: bool,
    pub elapsed: Duration,
}

impl RunReport {
    /// True when no archive failed and the run was not interrupted.
    pub fn succeeded(&self) -> bool {
        !self.interrupted
            && self
                .archives
                .iter()
                .all(|report| report.status != ArchiveStatus::Failed)
    }

    pub fn exit_code(&self) -> i32 {
        if self.interrupted {
            EXIT_INTERRUPTED
        } else if self.succeeded() {
            0
        } else {
            1
        }
    }

    /// Per-archive summary plus anything that needs manual attention.
    pub fn log_summary(&self) {
        for report in &self.archives {
            match report.status {
                ArchiveStatus::Success => info!(
                    "{}: success ({}, {})",
                    report.archive,
                    format_bytes(report.source_size_bytes),
                    format_duration(report.elapsed.as_secs())
                ),
                ArchiveStatus::Skipped => warn!("{}: skipped", report.archive),
                ArchiveStatus::Failed => {
                    let state = report
                        .failed_state
                        .map(|state| state.to_string())
                        .unwrap_or_else(|| "preflight".to_string());
                    let reason = report
                        .error
                        .as_ref()
                        .map(|e| format!("{} ({})", e, e.kind()))
                        .unwrap_or_default();
                    error!("{}: failed in {}: {}", report.archive, state, reason);
                }
            }

            if !report.resources_left.is_empty() {
                warn!(
                    "{}: still attached, clean up manually: {}",
                    report.archive,
                    report.resources_left.join(", ")
                );
            }
        }

        info!(
            "Finished at {} after {}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            format_duration(self.elapsed.as_secs())
        );
    }
}

/// Drives every archive of a configuration.
pub struct Orchestrator<'a> {
    config: &'a Config,
    backends: &'a Backends,
    policy: &'a ConfirmPolicy,
    options: MachineOptions,
    cancel: CancellationToken,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: &'a Config,
        backends: &'a Backends,
        policy: &'a ConfirmPolicy,
        options: MachineOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            backends,
            policy,
            options,
            cancel,
        }
    }

    pub fn run(&self) -> RunReport {
        let started = Instant::now();
        let mut report = RunReport::default();

        for archive in &self.config.backup.archives {
            if self.cancel.is_cancelled() {
                report.interrupted = true;
                report.archives.push(ArchiveReport::skipped(archive));
                continue;
            }

            info!("==== {} ====", archive.display_path());
            let archive_report = self.run_archive(archive);
            if matches!(archive_report.error, Some(ArchiverError::Interrupted)) {
                report.interrupted = true;
            }
            report.archives.push(archive_report);
        }

        // A signal during the last archive's teardown has no error to show for it.
        report.interrupted |= self.cancel.is_cancelled();
        report.elapsed = started.elapsed();
        report
    }

    fn run_archive(&self, archive: &ArchiveSpec) -> ArchiveReport {
        let started = Instant::now();
        let mut report = ArchiveReport::skipped(archive);

        match preflight::check_archive(archive) {
            Ok(ArchiveReadiness::Ready) => {}
            Ok(ArchiveReadiness::Empty) => return report,
            Err(e) => {
                error!("{}: {}", archive.display_path(), e);
                report.status = ArchiveStatus::Failed;
                report.error = Some(e);
                report.elapsed = started.elapsed();
                return report;
            }
        }

        let outcome = ArchiveMachine::new(
            archive,
            self.config,
            self.backends,
            self.policy,
            &self.options,
            self.cancel.clone(),
        )
        .run();

        report.status = if outcome.succeeded() {
            ArchiveStatus::Success
        } else {
            ArchiveStatus::Failed
        };
        if let Some((state, e)) = outcome.failure {
            report.failed_state = Some(state);
            report.error = Some(e);
        }
        report.teardown_error = outcome.teardown_error;
        report.resources_left = outcome.resources_left;
        report.source_size_bytes = outcome.source_size_bytes;
        report.elapsed = started.elapsed();
        report
    }
}
