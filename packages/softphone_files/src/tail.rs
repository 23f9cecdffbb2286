//! Follow a growing log file.
//!
//! [`TailLines`] is an infinite iterator: at end of file it sleeps for the
//! poll interval and tries again, so `next()` only returns once a complete
//! line is available. Incomplete trailing lines are held back until their
//! newline is written.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// `~/.twinkle/twinkle.log`
pub fn default_log_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".twinkle").join("twinkle.log"))
}

/// Tail `path` from its beginning
pub fn tail_lines<P: AsRef<Path>>(path: P) -> TailLines {
    TailLines::new(path)
}

pub struct TailLines {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    /// Byte offset of the next unread byte
    position: u64,
    partial: Vec<u8>,
    poll_interval: Duration,
    start_at_end: bool,
    missing_reported: bool,
}

impl TailLines {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            reader: None,
            position: 0,
            partial: Vec::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            start_at_end: false,
            missing_reported: false,
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Skip what the file already holds and only yield lines written later.
    ///
    /// If the file exists it is opened right away, so anything appended after
    /// this call is seen.
    pub fn from_end(mut self) -> Self {
        self.start_at_end = true;
        self.open();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&mut self) -> bool {
        if self.reader.is_some() {
            return true;
        }
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) => {
                if !self.missing_reported {
                    warn!("Cannot open {}: {}; waiting for it", self.path.display(), e);
                    self.missing_reported = true;
                }
                return false;
            }
        };

        let mut reader = BufReader::new(file);
        self.position = 0;
        if self.start_at_end {
            match reader.seek(SeekFrom::End(0)) {
                Ok(end) => self.position = end,
                Err(e) => warn!("Cannot seek to end of {}: {}", self.path.display(), e),
            }
        }
        info!("Tailing {} from offset {}", self.path.display(), self.position);
        self.reader = Some(reader);
        true
    }

    /// Restart from the beginning if the file shrank below our position
    fn check_truncation(&mut self) {
        let Some(reader) = self.reader.as_mut() else {
            return;
        };
        let len = match reader.get_ref().metadata() {
            Ok(meta) => meta.len(),
            Err(e) => {
                debug!("Cannot stat {}: {}", self.path.display(), e);
                return;
            }
        };
        if len >= self.position {
            return;
        }

        warn!(
            "{} was truncated ({} < {}), restarting from the beginning",
            self.path.display(),
            len,
            self.position
        );
        self.partial.clear();
        match reader.seek(SeekFrom::Start(0)) {
            Ok(_) => self.position = 0,
            Err(e) => {
                warn!("Cannot rewind {}: {}", self.path.display(), e);
                self.reader = None;
            }
        }
    }

    /// One attempt at producing a complete line
    fn poll_line(&mut self) -> Option<String> {
        if !self.open() {
            return None;
        }
        self.check_truncation();
        let reader = self.reader.as_mut()?;

        let mut chunk = Vec::new();
        match reader.read_until(b'\n', &mut chunk) {
            Ok(0) => None,
            Ok(n) => {
                self.position += n as u64;
                self.partial.extend_from_slice(&chunk);
                if !self.partial.ends_with(b"\n") {
                    return None;
                }
                let bytes = std::mem::take(&mut self.partial);
                Some(String::from_utf8_lossy(&bytes).trim().to_string())
            }
            Err(e) => {
                warn!("Read error on {}: {}", self.path.display(), e);
                None
            }
        }
    }
}

impl Iterator for TailLines {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            if let Some(line) = self.poll_line() {
                debug!("Read line: {}", line);
                return Some(line);
            }
            std::thread::sleep(self.poll_interval);
        }
    }
}
