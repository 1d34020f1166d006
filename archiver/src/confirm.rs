//! Confirmation of destructive or state-creating steps.
//!
//! Every step that creates or overwrites something asks a [`Decider`]. Steps
//! can be approved up front per step or all at once; everything else falls
//! through to the decider, which is an interactive prompt in the binary and
//! a scripted closure in tests.

use std::fmt;
use std::io::{self, BufRead, Write};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

const PROMPT_POLL: Duration = Duration::from_millis(100);

/// Steps that need approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Allocate a missing container file
    Create,
    /// Initialize encryption, destroying container contents
    Encrypt,
    /// Create a filesystem, destroying volume contents
    Format,
    /// Create a missing mount point directory
    MountCreate,
    /// Replace a container with a larger one
    Reprovision,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Create => "create",
            Action::Encrypt => "encrypt",
            Action::Format => "format",
            Action::MountCreate => "mount-create",
            Action::Reprovision => "reprovision",
        };
        f.write_str(name)
    }
}

/// Answers a yes/no question about one step.
pub trait Decider: Send + Sync {
    fn decide(&self, action: Action, question: &str) -> bool;
}

impl<F> Decider for F
where
    F: Fn(Action, &str) -> bool + Send + Sync,
{
    fn decide(&self, action: Action, question: &str) -> bool {
        self(action, question)
    }
}

/// Steps approved without asking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AutoConfirm {
    pub create: bool,
    pub encrypt: bool,
    pub format: bool,
    pub mount_create: bool,
    pub reprovision: bool,
}

impl AutoConfirm {
    /// Approve every step.
    pub fn all() -> Self {
        Self {
            create: true,
            encrypt: true,
            format: true,
            mount_create: true,
            reprovision: true,
        }
    }

    pub fn covers(&self, action: Action) -> bool {
        match action {
            Action::Create => self.create,
            Action::Encrypt => self.encrypt,
            Action::Format => self.format,
            Action::MountCreate => self.mount_create,
            Action::Reprovision => self.reprovision,
        }
    }
}

/// Auto-approvals in front of a fallback decider.
pub struct ConfirmPolicy {
    auto: AutoConfirm,
    decider: Box<dyn Decider>,
}

impl ConfirmPolicy {
    pub fn new(auto: AutoConfirm, decider: Box<dyn Decider>) -> Self {
        Self { auto, decider }
    }

    /// Approve everything without asking.
    pub fn approve_all() -> Self {
        Self::new(AutoConfirm::all(), Box::new(|_: Action, _: &str| true))
    }

    /// Approve only what `auto` covers; decline everything else.
    pub fn non_interactive(auto: AutoConfirm) -> Self {
        Self::new(auto, Box::new(|_: Action, _: &str| false))
    }

    pub fn confirm(&self, action: Action, question: &str) -> bool {
        if self.auto.covers(action) {
            info!("{} (auto-confirmed: {})", question, action);
            return true;
        }
        let approved = self.decider.decide(action, question);
        info!(
            "{} -> {}",
            question,
            if approved { "approved" } else { "declined" }
        );
        approved
    }
}

/// Interactive yes/no prompt on the controlling terminal. An empty answer
/// means yes. End of input and cancellation answer no.
pub struct TerminalPrompt {
    cancel: CancellationToken,
}

impl TerminalPrompt {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }
}

impl Decider for TerminalPrompt {
    fn decide(&self, _action: Action, question: &str) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }

        let mut stdout = io::stdout();
        let _ = write!(stdout, "{question} [Y/n] ");
        let _ = stdout.flush();

        // stdin blocks without a timeout; read it on a helper thread so an
        // interrupt is not stuck behind an unanswered prompt.
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut line = String::new();
            let answer = io::stdin()
                .lock()
                .read_line(&mut line)
                .map(|read| (read > 0).then_some(line));
            let _ = tx.send(answer);
        });

        loop {
            match rx.recv_timeout(PROMPT_POLL) {
                Ok(Ok(Some(line))) => return parse_answer(&line),
                // Closed stdin never approves anything.
                Ok(Ok(None)) | Ok(Err(_)) | Err(mpsc::RecvTimeoutError::Disconnected) => return false,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if self.cancel.is_cancelled() {
                        let _ = writeln!(stdout);
                        return false;
                    }
                }
            }
        }
    }
}

fn parse_answer(line: &str) -> bool {
    matches!(
        line.trim().to_ascii_lowercase().as_str(),
        "" | "y" | "yes"
    )
}
