use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use softphone_files::{TailLines, default_log_path};

/// Print lines appended to the softphone log, forever.
///
/// Blocks the calling thread; only a write error on stdout ends it.
pub fn tail_command(path: Option<PathBuf>, from_end: bool, poll_interval: Duration) -> Result<()> {
    let path = path
        .or_else(default_log_path)
        .context("No log path given and no home directory to find ~/.twinkle/twinkle.log")?;

    let mut lines = TailLines::new(&path).poll_interval(poll_interval);
    if from_end {
        lines = lines.from_end();
    }

    let stdout = std::io::stdout();
    for line in lines {
        let mut out = stdout.lock();
        writeln!(out, "{line}").context("Failed to write to stdout")?;
        out.flush()?;
    }
    Ok(())
}
