//! Command Dispatcher
//!
//! Builds the softphone's textual commands and writes them to its input.
//! The protocol is unframed: nothing is echoed back that ties a response to
//! a command, so the dispatcher only writes and never waits.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, TryLockError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::DispatchError;

/// Kind of command sent to the softphone
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Call,
    Bye,
    Answer,
    Mute,
    UnMute,
    Dtmf,
    Hold,
    UnHold,
    Register,
    Deregister,
    Line,
    Dnd,
    User,
    Presence,
    AutoAnswer,
    Help,
    Quit,
}

/// One outbound command, consumed once it is written
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandIntent {
    pub text: String,
    pub kind: CommandKind,
    pub payload: Option<String>,
}

fn switch(on: bool) -> &'static str {
    if on { "on" } else { "off" }
}

impl CommandIntent {
    fn bare(kind: CommandKind, verb: &str) -> Self {
        Self {
            text: verb.to_string(),
            kind,
            payload: None,
        }
    }

    fn with_arg(kind: CommandKind, verb: &str, arg: &str) -> Self {
        Self {
            text: format!("{} {}", verb, arg),
            kind,
            payload: Some(arg.to_string()),
        }
    }

    pub fn call(number: &str) -> Self {
        Self::with_arg(CommandKind::Call, "call", number.trim())
    }

    pub fn answer() -> Self {
        Self::bare(CommandKind::Answer, "answer")
    }

    pub fn bye() -> Self {
        Self::bare(CommandKind::Bye, "bye")
    }

    pub fn mute() -> Self {
        Self::with_arg(CommandKind::Mute, "mute", "-s on")
    }

    pub fn un_mute() -> Self {
        Self::with_arg(CommandKind::UnMute, "mute", "-s off")
    }

    pub fn dtmf(digits: &str) -> Self {
        Self::with_arg(CommandKind::Dtmf, "dtmf", digits.trim())
    }

    pub fn hold() -> Self {
        Self::bare(CommandKind::Hold, "hold")
    }

    pub fn un_hold() -> Self {
        Self::bare(CommandKind::UnHold, "retrieve")
    }

    pub fn register() -> Self {
        Self::bare(CommandKind::Register, "register")
    }

    pub fn deregister() -> Self {
        Self::bare(CommandKind::Deregister, "deregister")
    }

    pub fn set_line(line: u8) -> Self {
        Self::with_arg(CommandKind::Line, "line", &line.to_string())
    }

    pub fn dnd(on: bool) -> Self {
        Self::with_arg(CommandKind::Dnd, "dnd", &format!("-s {}", switch(on)))
    }

    /// Show the active user, or switch to `profile`
    pub fn user(profile: Option<&str>) -> Self {
        match profile.map(str::trim).filter(|p| !p.is_empty()) {
            Some(profile) => Self::with_arg(CommandKind::User, "user", profile),
            None => Self::bare(CommandKind::User, "user"),
        }
    }

    pub fn presence(online: bool) -> Self {
        let state = if online { "online" } else { "offline" };
        Self::with_arg(CommandKind::Presence, "presence", &format!("-b {}", state))
    }

    pub fn auto_answer(on: bool) -> Self {
        Self::with_arg(
            CommandKind::AutoAnswer,
            "auto_answer",
            &format!("-s {}", switch(on)),
        )
    }

    pub fn help() -> Self {
        Self::bare(CommandKind::Help, "help")
    }

    pub fn quit() -> Self {
        Self::bare(CommandKind::Quit, "quit")
    }
}

/// Serialises commands onto the process input
pub struct CommandDispatcher {
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    open: AtomicBool,
    next_seq: AtomicU64,
}

impl CommandDispatcher {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(Some(writer)),
            open: AtomicBool::new(true),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Write `intent.text` followed by a newline
    pub fn send(&self, intent: &CommandIntent) -> Result<(), DispatchError> {
        if !self.is_open() {
            return Err(DispatchError::ProcessClosed);
        }
        self.write_line(intent)
    }

    /// Write regardless of the liveness flag, ignoring failures
    pub fn send_best_effort(&self, intent: &CommandIntent) {
        if let Err(e) = self.write_line(intent) {
            debug!("Best-effort '{}' not delivered: {}", intent.text, e);
        }
    }

    /// Mark the process input closed and release the writer.
    ///
    /// Does not wait for a write in progress; that write releases the writer
    /// when it returns.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        match self.writer.try_lock() {
            Ok(mut writer) => *writer = None,
            Err(TryLockError::Poisoned(e)) => *e.into_inner() = None,
            Err(TryLockError::WouldBlock) => debug!("Write in progress; writer released after it"),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn write_line(&self, intent: &CommandIntent) -> Result<(), DispatchError> {
        let mut guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let writer = guard.as_mut().ok_or(DispatchError::ProcessClosed)?;

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let result = writer
            .write_all(intent.text.as_bytes())
            .and_then(|_| writer.write_all(b"\n"))
            .and_then(|_| writer.flush());

        match result {
            Ok(()) => {
                debug!(seq, kind = ?intent.kind, "SENT: {}", intent.text);
                if !self.is_open() {
                    *guard = None;
                }
                Ok(())
            }
            Err(e) => {
                warn!(seq, "Failed to write '{}' to softphone: {}", intent.text, e);
                self.open.store(false, Ordering::SeqCst);
                *guard = None;
                Err(DispatchError::ProcessClosed)
            }
        }
    }
}
