//! Line Channel
//!
//! Turns the softphone's raw output stream into a sequence of distinct,
//! whitespace-normalised lines. A blocking thread owns the stream and
//! forwards line text over a channel; the consumer waits with a bounded
//! idle timeout so the inbound loop stays responsive to shutdown.

use std::io::{ErrorKind, Read};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Default idle wait before the channel reports a timeout
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(100);

/// Consecutive read faults tolerated before the stream is considered gone
const MAX_CONSECUTIVE_FAULTS: u32 = 5;

const READ_BUFFER_SIZE: usize = 4096;
const CHANNEL_CAPACITY: usize = 1024;

/// One distinct line read from the process
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLine {
    pub text: String,
    /// Milliseconds since the Unix epoch (UTC)
    pub timestamp: i64,
}

impl RawLine {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// What the channel yields to its consumer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LineSignal {
    Line(RawLine),
    /// Nothing arrived within the idle timeout, or a read fault was absorbed
    Timeout,
    /// The stream closed; this is the last signal the channel yields
    Ended,
}

/// Messages from the reader thread
enum ReaderEvent {
    Text(String),
    Fault(String),
}

/// Consumer side of the line pipeline
pub struct LineChannel {
    rx: mpsc::Receiver<ReaderEvent>,
    idle_timeout: Duration,
    dedup: Dedup,
    finished: bool,
}

impl LineChannel {
    /// Start reading `reader` on a dedicated thread
    pub fn spawn<R>(reader: R, idle_timeout: Duration) -> Self
    where
        R: Read + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        std::thread::spawn(move || {
            read_lines(reader, tx, idle_timeout);
        });

        Self {
            rx,
            idle_timeout,
            dedup: Dedup::default(),
            finished: false,
        }
    }

    /// Wait for the next signal.
    ///
    /// Returns `None` once `LineSignal::Ended` has been yielded.
    pub async fn next(&mut self) -> Option<LineSignal> {
        if self.finished {
            return None;
        }

        loop {
            match tokio::time::timeout(self.idle_timeout, self.rx.recv()).await {
                Err(_) => return Some(LineSignal::Timeout),
                Ok(None) => {
                    self.finished = true;
                    return Some(LineSignal::Ended);
                }
                Ok(Some(ReaderEvent::Fault(reason))) => {
                    warn!("Read fault on softphone output: {}", reason);
                    return Some(LineSignal::Timeout);
                }
                Ok(Some(ReaderEvent::Text(text))) => {
                    if let Some(line) = self.dedup.accept(&text) {
                        trace!("READ: {}", line.text);
                        return Some(LineSignal::Line(line));
                    }
                }
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Drops empty lines and immediate repeats
#[derive(Default)]
struct Dedup {
    last: Option<String>,
}

impl Dedup {
    fn accept(&mut self, text: &str) -> Option<RawLine> {
        let normalized = normalize(text);
        if normalized.is_empty() || self.last.as_deref() == Some(normalized.as_str()) {
            return None;
        }
        self.last = Some(normalized.clone());
        Some(RawLine::new(normalized))
    }
}

/// Strip terminal escape sequences and control characters, collapse whitespace
pub fn normalize(text: &str) -> String {
    let mut cleaned = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            // CSI: ESC [ params final-byte
            if chars.peek() == Some(&'[') {
                chars.next();
                for next in chars.by_ref() {
                    if ('@'..='~').contains(&next) {
                        break;
                    }
                }
            }
            continue;
        }
        if c.is_control() && !c.is_whitespace() {
            continue;
        }
        cleaned.push(c);
    }

    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn read_lines<R: Read>(mut reader: R, tx: mpsc::Sender<ReaderEvent>, backoff: Duration) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    let mut pending: Vec<u8> = Vec::new();
    let mut faults = 0u32;

    'read: loop {
        match reader.read(&mut buffer) {
            Ok(0) => {
                info!("Softphone output EOF detected");
                break;
            }
            Ok(n) => {
                faults = 0;
                for &byte in &buffer[..n] {
                    if byte == b'\n' || byte == b'\r' {
                        if !pending.is_empty() {
                            let text = String::from_utf8_lossy(&pending).to_string();
                            pending.clear();
                            if tx.blocking_send(ReaderEvent::Text(text)).is_err() {
                                break 'read;
                            }
                        }
                    } else {
                        pending.push(byte);
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if is_closed(&e) => {
                debug!("Softphone output closed: {}", e);
                break;
            }
            Err(e) => {
                faults += 1;
                if faults > MAX_CONSECUTIVE_FAULTS {
                    warn!("Giving up on softphone output after {} faults", faults);
                    break;
                }
                if tx.blocking_send(ReaderEvent::Fault(e.to_string())).is_err() {
                    break;
                }
                std::thread::sleep(backoff);
            }
        }
    }

    if !pending.is_empty() {
        let text = String::from_utf8_lossy(&pending).to_string();
        let _ = tx.blocking_send(ReaderEvent::Text(text));
    }
    debug!("Softphone reader thread exiting");
}

/// A PTY master reports EIO once the child side has gone away
fn is_closed(err: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(nix::libc::EIO)
    }
    #[cfg(not(unix))]
    {
        err.kind() == ErrorKind::BrokenPipe
    }
}
