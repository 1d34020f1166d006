//! Execution wrapper for invoking host tools.
//!
//! Keeps shell integration in one place so backend logic stays testable with
//! fake binaries. Output is drained by one reader thread per pipe into a
//! bounded channel; the calling thread consumes the channel while polling the
//! child for exit and the cancellation token for interruption, and joins the
//! readers before returning.

use super::{BackendError, BackendResult};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const TERMINATE_GRACE: Duration = Duration::from_secs(5);
const LINE_BUFFER: usize = 256;
const DIAGNOSTIC_TAIL: usize = 20;

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl Output {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Trimmed stderr, falling back to stdout, for error messages.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        let stdout = self.stdout.trim();
        let text = if !stderr.is_empty() { stderr } else { stdout };
        if text.is_empty() {
            "no additional output".to_string()
        } else {
            text.to_string()
        }
    }

    /// Convert into a [`BackendError::Failed`] for `program`.
    pub fn failure(&self, program: &str) -> BackendError {
        BackendError::Failed {
            program: program.to_string(),
            code: self.status,
            diagnostic: self.diagnostic(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Capture,
    Stream,
}

/// Runs host tools, optionally through sudo, honoring a cancellation token.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    sudo: bool,
    cancel: CancellationToken,
}

impl CommandRunner {
    pub fn new(sudo: bool, cancel: CancellationToken) -> Self {
        Self { sudo, cancel }
    }

    /// Whether privileged tools are run through sudo.
    pub fn uses_sudo(&self) -> bool {
        self.sudo
    }

    /// Same runner, detached from the cancellation token. Release operations
    /// use it so teardown completes after an interrupt.
    pub fn uncancellable(&self) -> Self {
        Self {
            sudo: self.sudo,
            cancel: CancellationToken::new(),
        }
    }

    /// Run to completion, capturing stdout and stderr.
    pub fn output(
        &self,
        program: &str,
        args: &[OsString],
        input: Option<&[u8]>,
    ) -> BackendResult<Output> {
        self.execute(program, args, input, Mode::Capture)
    }

    /// Run to completion, logging every output line as it arrives. Only the
    /// tail of stderr is kept for diagnostics.
    pub fn stream(
        &self,
        program: &str,
        args: &[OsString],
        input: Option<&[u8]>,
    ) -> BackendResult<Output> {
        self.execute(program, args, input, Mode::Stream)
    }

    fn execute(
        &self,
        program: &str,
        args: &[OsString],
        input: Option<&[u8]>,
        mode: Mode,
    ) -> BackendResult<Output> {
        if self.cancel.is_cancelled() {
            return Err(BackendError::Interrupted {
                program: program.to_string(),
            });
        }

        let mut command = if self.sudo {
            let mut command = Command::new("sudo");
            command.arg(program);
            command
        } else {
            Command::new(program)
        };
        command
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        debug!(
            "Running {}{} {}",
            if self.sudo { "sudo " } else { "" },
            program,
            args.iter()
                .map(|arg| arg.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let mut child = command.spawn().map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                BackendError::Missing {
                    program: program.to_string(),
                }
            } else {
                BackendError::Spawn {
                    program: program.to_string(),
                    source,
                }
            }
        })?;

        if let Some(payload) = input {
            if let Some(mut stdin) = child.stdin.take() {
                match stdin.write_all(payload).and_then(|_| stdin.flush()) {
                    Ok(()) => {}
                    // The tool exited before reading; its status tells the story.
                    Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
                    Err(e) => {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(e.into());
                    }
                }
            }
        }

        let (tx, rx) = mpsc::sync_channel(LINE_BUFFER);
        let stdout_reader = spawn_line_reader(child.stdout.take(), Stream::Stdout, tx.clone());
        let stderr_reader = spawn_line_reader(child.stderr.take(), Stream::Stderr, tx);

        let mut sink = LineSink::new(mode);
        let mut interrupted = false;
        let status = loop {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok((stream, line)) => sink.push(stream, line),
                Err(RecvTimeoutError::Timeout) => {}
                // Both pipes closed ahead of the exit status.
                Err(RecvTimeoutError::Disconnected) => thread::sleep(POLL_INTERVAL),
            }

            if let Some(status) = child.try_wait()? {
                break status;
            }

            if self.cancel.is_cancelled() {
                warn!("Interrupt received, stopping {}", program);
                interrupted = true;
                break terminate(&mut child)?;
            }
        };

        for (stream, line) in rx.iter() {
            sink.push(stream, line);
        }
        join_reader(stdout_reader, "stdout")?;
        join_reader(stderr_reader, "stderr")?;

        if interrupted {
            return Err(BackendError::Interrupted {
                program: program.to_string(),
            });
        }

        Ok(sink.finish(status))
    }
}

/// Ask the child to stop, escalating to SIGKILL after a grace period.
fn terminate(child: &mut Child) -> io::Result<ExitStatus> {
    if let Ok(pid) = i32::try_from(child.id()) {
        let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
    }

    let deadline = Instant::now() + TERMINATE_GRACE;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        thread::sleep(POLL_INTERVAL);
    }

    let _ = child.kill();
    child.wait()
}

struct LineSink {
    mode: Mode,
    stdout: String,
    stderr: String,
    stderr_tail: VecDeque<String>,
}

impl LineSink {
    fn new(mode: Mode) -> Self {
        Self {
            mode,
            stdout: String::new(),
            stderr: String::new(),
            stderr_tail: VecDeque::with_capacity(DIAGNOSTIC_TAIL),
        }
    }

    fn push(&mut self, stream: Stream, line: String) {
        match self.mode {
            Mode::Capture => {
                let target = match stream {
                    Stream::Stdout => &mut self.stdout,
                    Stream::Stderr => &mut self.stderr,
                };
                target.push_str(&line);
                target.push('\n');
            }
            Mode::Stream => {
                info!("    {}", line);
                if stream == Stream::Stderr {
                    if self.stderr_tail.len() == DIAGNOSTIC_TAIL {
                        self.stderr_tail.pop_front();
                    }
                    self.stderr_tail.push_back(line);
                }
            }
        }
    }

    fn finish(self, status: ExitStatus) -> Output {
        let stderr = match self.mode {
            Mode::Capture => self.stderr,
            Mode::Stream => Vec::from(self.stderr_tail).join("\n"),
        };
        Output {
            stdout: self.stdout,
            stderr,
            status: status.code().unwrap_or(-1),
        }
    }
}

/// Forward a pipe line by line. Carriage returns also end a line so progress
/// meters are streamed instead of accumulating.
fn spawn_line_reader<R>(
    pipe: Option<R>,
    stream: Stream,
    tx: SyncSender<(Stream, String)>,
) -> thread::JoinHandle<io::Result<()>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> io::Result<()> {
        let Some(pipe) = pipe else {
            return Ok(());
        };
        let mut reader = BufReader::new(pipe);
        let mut line = Vec::new();
        loop {
            let buf = reader.fill_buf()?;
            if buf.is_empty() {
                break;
            }
            let consumed = buf.len();
            for &byte in buf {
                if byte == b'\n' || byte == b'\r' {
                    if !emit(&tx, stream, &mut line) {
                        return Ok(());
                    }
                } else {
                    line.push(byte);
                }
            }
            reader.consume(consumed);
        }
        emit(&tx, stream, &mut line);
        Ok(())
    })
}

fn emit(tx: &SyncSender<(Stream, String)>, stream: Stream, line: &mut Vec<u8>) -> bool {
    if line.is_empty() {
        return true;
    }
    let text = String::from_utf8_lossy(line).into_owned();
    line.clear();
    tx.send((stream, text)).is_ok()
}

fn join_reader(handle: thread::JoinHandle<io::Result<()>>, name: &str) -> BackendResult<()> {
    handle
        .join()
        .map_err(|_| BackendError::Unexpected(format!("{name} reader thread panicked")))??;
    Ok(())
}
