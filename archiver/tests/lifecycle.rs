//! Full runs against the system backends with fake host tools.

mod common;

use archiver::backend::Backends;
use archiver::confirm::{AutoConfirm, ConfirmPolicy};
use archiver::machine::{MachineOptions, State};
use archiver::orchestrator::{ArchiveStatus, Orchestrator, RunReport, EXIT_INTERRUPTED};
use archiver::preflight;
use common::{FakeTools, SEED};
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn run(tools: &FakeTools, policy: &ConfirmPolicy, cancel: CancellationToken) -> RunReport {
    let config = tools.config();
    preflight::run(&config, policy).unwrap();
    let backends = Backends::system(&config.tools, cancel.clone());
    Orchestrator::new(
        &config,
        &backends,
        policy,
        MachineOptions::from_config(&config),
        cancel,
    )
    .run()
}

#[test]
fn test_fresh_container_is_prepared_synchronized_and_released() {
    let tools = FakeTools::install();

    let report = run(&tools, &ConfirmPolicy::approve_all(), CancellationToken::new());

    assert!(report.succeeded(), "{:?}", report);
    assert_eq!(report.archives[0].status, ArchiveStatus::Success);
    assert!(tools.container().is_file());
    assert_eq!(
        tools.stored_key().as_deref(),
        Some(format!("{SEED}photos").as_str())
    );
    assert!(tools.state().join("synced/photos/2024/beach.jpg").is_file());

    let rsync = tools.calls_to("rsync");
    assert_eq!(rsync.len(), 1);
    assert!(rsync[0].contains("--max-delete=25"));
    assert!(!rsync[0].contains("--bwlimit"));
    assert!(rsync[0].ends_with(&format!(
        "{} {}/",
        tools.root().join("photos").display(),
        tools.mount_point().display()
    )));

    // Everything acquired was given back.
    assert!(!tools.loop_attached());
    assert!(!tools.mapped_node().exists());
    assert!(!tools.mount_point().exists());
}

#[test]
fn test_passphrase_never_reaches_the_command_line() {
    let tools = FakeTools::install();

    run(&tools, &ConfirmPolicy::approve_all(), CancellationToken::new());

    assert!(tools.calls().iter().all(|call| !call.contains(SEED)));
}

#[test]
fn test_teardown_runs_in_reverse_order() {
    let tools = FakeTools::install();

    run(&tools, &ConfirmPolicy::approve_all(), CancellationToken::new());

    let releases: Vec<String> = tools
        .calls()
        .into_iter()
        .filter(|call| {
            call.starts_with("umount")
                || call.starts_with("cryptsetup close")
                || call.starts_with("losetup --detach")
        })
        .collect();
    assert_eq!(
        releases,
        vec![
            format!("umount {}", tools.mount_point().display()),
            "cryptsetup close photos".to_string(),
            "losetup --detach /dev/loop0".to_string(),
        ]
    );
}

#[test]
fn test_second_run_reuses_the_prepared_container() {
    let tools = FakeTools::install();
    let policy = ConfirmPolicy::approve_all();
    run(&tools, &policy, CancellationToken::new());
    tools.clear_calls();

    // Only the mount point, removed by the previous teardown, may be created.
    let auto = AutoConfirm {
        mount_create: true,
        ..AutoConfirm::default()
    };
    let report = run(
        &tools,
        &ConfirmPolicy::non_interactive(auto),
        CancellationToken::new(),
    );

    assert!(report.succeeded(), "{:?}", report);
    assert!(tools.calls_to("mkfs.ext4").is_empty());
    assert!(tools
        .calls_to("cryptsetup")
        .iter()
        .all(|call| !call.contains("luksFormat")));
    assert!(tools
        .calls_to("cryptsetup")
        .iter()
        .any(|call| call.contains("--test-passphrase")));
    assert_eq!(tools.calls_to("rsync").len(), 1);
}

#[test]
fn test_failed_sync_still_releases_everything() {
    let tools = FakeTools::install();
    tools.fail_sync(23);

    let report = run(&tools, &ConfirmPolicy::approve_all(), CancellationToken::new());

    assert!(!report.succeeded());
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.archives[0].failed_state, Some(State::Sync));
    assert!(!tools.loop_attached());
    assert!(!tools.mapped_node().exists());
    assert!(!tools.mount_point().exists());
}

#[test]
fn test_vanished_source_files_are_not_a_failure() {
    let tools = FakeTools::install();
    tools.fail_sync(24);

    let report = run(&tools, &ConfirmPolicy::approve_all(), CancellationToken::new());

    assert!(report.succeeded(), "{:?}", report);
}

#[test]
fn test_interrupt_during_sync_tears_down() {
    let tools = FakeTools::install();
    tools.stall_sync();
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    let calls_log = tools.state().join("calls");
    let interrupter = thread::spawn(move || {
        // Wait until rsync has started before interrupting.
        let deadline = Instant::now() + Duration::from_secs(20);
        while Instant::now() < deadline {
            let started = std::fs::read_to_string(&calls_log)
                .map(|calls| calls.lines().any(|line| line.starts_with("rsync")))
                .unwrap_or(false);
            if started {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        thread::sleep(Duration::from_millis(100));
        trigger.cancel();
    });

    let started = Instant::now();
    let report = run(&tools, &ConfirmPolicy::approve_all(), cancel);
    interrupter.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(25));
    assert!(report.interrupted);
    assert_eq!(report.exit_code(), EXIT_INTERRUPTED);
    assert_eq!(report.archives[0].failed_state, Some(State::Sync));
    assert!(report.archives[0].resources_left.is_empty());
    assert!(!tools.loop_attached());
    assert!(!tools.mapped_node().exists());
    assert!(!tools.mount_point().exists());
}

#[test]
fn test_declined_creation_touches_nothing() {
    let tools = FakeTools::install();
    std::fs::create_dir_all(tools.root().join("containers")).unwrap();
    let policy = ConfirmPolicy::non_interactive(Default::default());

    let report = run(&tools, &policy, CancellationToken::new());

    assert_eq!(report.archives[0].status, ArchiveStatus::Failed);
    assert_eq!(report.archives[0].failed_state, Some(State::Provision));
    assert!(!tools.container().exists());
    assert!(tools.calls_to("losetup").iter().all(|call| !call.contains("--find")));
}

#[test]
fn test_no_cleanup_leaves_resources_attached() {
    let tools = FakeTools::install();
    let config = tools.config();
    let policy = ConfirmPolicy::approve_all();
    preflight::run(&config, &policy).unwrap();
    let cancel = CancellationToken::new();
    let backends = Backends::system(&config.tools, cancel.clone());
    let mut options = MachineOptions::from_config(&config);
    options.no_cleanup = true;

    let report = Orchestrator::new(&config, &backends, &policy, options, cancel).run();

    assert!(report.succeeded(), "{:?}", report);
    assert_eq!(report.archives[0].resources_left.len(), 3);
    assert!(tools.loop_attached());
    assert!(tools.mapped_node().exists());
    assert!(tools.mount_point().join(".mounted").exists());
    assert!(tools.calls_to("umount").is_empty());
}
