//! Archiver - Main entry point
//!
//! Brings every configured archive's encrypted container up to date.

use anyhow::Result;
use archiver::backend::Backends;
use archiver::config::Config;
use archiver::confirm::{AutoConfirm, ConfirmPolicy, TerminalPrompt};
use archiver::daemon::shutdown::ShutdownCoordinator;
use archiver::machine::MachineOptions;
use archiver::orchestrator::Orchestrator;
use archiver::{preflight, utils};
use chrono::Local;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Approve every create/encrypt/format/mount-create/reprovision step
    #[arg(long)]
    auto: bool,

    /// Approve creating missing containers and the container directory
    #[arg(long)]
    create: bool,

    /// Approve encrypting unencrypted containers
    #[arg(long)]
    encrypt: bool,

    /// Approve creating filesystems
    #[arg(long)]
    format: bool,

    /// Approve creating missing mount points
    #[arg(long)]
    mount_create: bool,

    /// Approve growing over-full containers
    #[arg(long)]
    reprovision: bool,

    /// Leave loop devices, mappings and mounts attached at the end
    #[arg(long)]
    no_cleanup: bool,

    /// Prepare and mount containers without synchronizing
    #[arg(long)]
    skip_sync: bool,

    /// Transfer rate cap in KiB/s, 0 = unlimited (overrides config)
    #[arg(long, value_name = "KBPS")]
    bandwidth_limit: Option<u32>,

    /// Debug logging, including every external command
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn auto_confirm(&self) -> AutoConfirm {
        if self.auto {
            return AutoConfirm::all();
        }
        AutoConfirm {
            create: self.create,
            encrypt: self.encrypt,
            format: self.format,
            mount_create: self.mount_create,
            reprovision: self.reprovision,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Load configuration
    let config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", args.config.display(), e);
            return Ok(ExitCode::FAILURE);
        }
    };

    // Initialize logging
    let log_level = if args.verbose {
        "debug"
    } else {
        config.log.level.as_str()
    };
    utils::logger::init(log_level, config.log.directory.as_deref())?;

    tracing::info!(
        "Starting archiver v{} at {} ({} archives)",
        env!("CARGO_PKG_VERSION"),
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        config.backup.archives.len()
    );

    let shutdown_coordinator = ShutdownCoordinator::default();
    let cancel = shutdown_coordinator.token();
    let signal_handle = tokio::spawn(async move {
        shutdown_coordinator.wait_for_signal().await;
    });

    let mut options = MachineOptions::from_config(&config);
    options.no_cleanup = args.no_cleanup;
    options.skip_sync = args.skip_sync;
    if let Some(limit) = args.bandwidth_limit {
        options.bandwidth_limit_kbps = limit;
    }
    if options.no_cleanup {
        tracing::warn!("Cleanup disabled: resources will stay attached after the run");
    }

    let auto = args.auto_confirm();
    let worker_cancel = cancel.clone();

    // Every step below blocks on external tools; keep it off the runtime.
    let outcome = tokio::task::spawn_blocking(move || {
        let policy = ConfirmPolicy::new(auto, Box::new(TerminalPrompt::new(worker_cancel.clone())));
        preflight::run(&config, &policy)?;

        let backends = Backends::system(&config.tools, worker_cancel.clone());
        let report = Orchestrator::new(&config, &backends, &policy, options, worker_cancel).run();
        report.log_summary();
        Ok::<_, archiver::ArchiverError>(report.exit_code())
    })
    .await;

    // Stop listening for signals.
    cancel.cancel();
    let _ = signal_handle.await;

    let code = match outcome {
        Ok(Ok(code)) => code,
        Ok(Err(e)) => {
            tracing::error!("{}", e);
            1
        }
        Err(e) => {
            tracing::error!("Archiver task panicked: {}", e);
            1
        }
    };

    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}
