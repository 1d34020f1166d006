//! The `archiver` binary against fake host tools.

mod common;

use common::FakeTools;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn archiver(config: &Path, args: &[&str]) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_archiver"));
    command
        .arg(config)
        .args(args)
        .env_remove("ARCHIVER_PASSWORD_SEED")
        .stdin(Stdio::null());
    command
}

fn run(command: &mut Command) -> Output {
    command.output().unwrap()
}

#[test]
fn test_missing_config_file() {
    let tools = FakeTools::install();
    let output = run(&mut archiver(&tools.root().join("missing.toml"), &[]));

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("missing.toml"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let tools = FakeTools::install();
    let path = tools.root().join("archiver.toml");
    fs::write(
        &path,
        tools.config_text().replace(
            "[backup]",
            "[backup]\nprovision_fill_percent = 95\nreprovision_threshold = 90",
        ),
    )
    .unwrap();

    let output = run(&mut archiver(&path, &["--auto"]));

    assert_eq!(output.status.code(), Some(1));
    assert!(!tools.root().join("containers").exists());
}

#[test]
fn test_auto_run_succeeds() {
    let tools = FakeTools::install();
    let config = tools.write_config();

    let output = run(&mut archiver(&config, &["--auto"]));

    assert_eq!(
        output.status.code(),
        Some(0),
        "{}",
        String::from_utf8_lossy(&output.stdout)
    );
    assert!(tools.container().is_file());
    assert!(tools.state().join("synced/photos/notes.txt").is_file());
    assert!(!tools.loop_attached());
    assert!(!tools.mount_point().exists());
}

#[test]
fn test_closed_stdin_declines_every_prompt() {
    let tools = FakeTools::install();
    let config = tools.write_config();

    let output = run(&mut archiver(&config, &[]));

    assert_eq!(output.status.code(), Some(1));
    assert!(!tools.root().join("containers").exists());
    assert!(tools.calls().is_empty());
}

#[test]
fn test_seed_from_environment() {
    let tools = FakeTools::install();
    let config = tools.write_config();

    let output = run(archiver(&config, &["--auto"]).env("ARCHIVER_PASSWORD_SEED", "from-env"));

    assert_eq!(output.status.code(), Some(0));
    assert_eq!(tools.stored_key().as_deref(), Some("from-envphotos"));
}

#[test]
fn test_skip_sync_prepares_without_mirroring() {
    let tools = FakeTools::install();
    let config = tools.write_config();

    let output = run(&mut archiver(&config, &["--auto", "--skip-sync"]));

    assert_eq!(output.status.code(), Some(0));
    assert!(tools.container().is_file());
    assert!(tools.calls_to("rsync").is_empty());
    assert_eq!(tools.calls_to("mkfs.ext4").len(), 1);
}

#[test]
fn test_bandwidth_limit_flag_overrides_config() {
    let tools = FakeTools::install();
    let config = tools.write_config();

    let output = run(&mut archiver(&config, &["--auto", "--bandwidth-limit", "640"]));

    assert_eq!(output.status.code(), Some(0));
    let rsync = tools.calls_to("rsync");
    assert_eq!(rsync.len(), 1);
    assert!(rsync[0].starts_with("rsync --bwlimit 640 "));
}

#[test]
fn test_sigterm_tears_down_and_exits_130() {
    let tools = FakeTools::install();
    tools.stall_sync();
    let config = tools.write_config();

    let mut child = archiver(&config, &["--auto"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(20);
    while tools.calls_to("rsync").is_empty() {
        assert!(Instant::now() < deadline, "rsync never started");
        thread::sleep(Duration::from_millis(20));
    }
    thread::sleep(Duration::from_millis(100));
    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).unwrap();

    let status = child.wait().unwrap();
    assert_eq!(status.code(), Some(130));
    assert!(!tools.loop_attached());
    assert!(!tools.mapped_node().exists());
    assert!(!tools.mount_point().exists());
}
