use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::engine::EngineConfig;
use crate::error::EngineError;

/// How the softphone's standard streams are connected
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Through a pseudo-terminal, as an interactive user would run it
    #[default]
    Pty,
    /// Plain stdin/stdout pipes
    Pipes,
}

/// Streams of a freshly spawned process
pub struct ProcessIo {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

enum ChildHandle {
    Pty {
        child: Box<dyn Child + Send + Sync>,
        // Keeps the PTY open for the lifetime of the child
        _master: Box<dyn MasterPty + Send>,
    },
    Piped(std::process::Child),
}

/// The supervised softphone process
pub struct ControlledProcess {
    child: ChildHandle,
    pid: Option<u32>,
    command: String,
    exited: bool,
}

impl ControlledProcess {
    /// Spawn the configured command and return its streams
    pub fn spawn(config: &EngineConfig) -> Result<(Self, ProcessIo), EngineError> {
        info!(
            "Spawning softphone: {} with args: {:?} ({:?})",
            config.command, config.args, config.transport
        );
        let spawned = match config.transport {
            Transport::Pty => Self::spawn_pty(config),
            Transport::Pipes => Self::spawn_piped(config),
        };
        if let Err(e) = &spawned {
            error!("Failed to spawn softphone '{}': {}", config.command, e);
        }
        spawned
    }

    fn spawn_pty(config: &EngineConfig) -> Result<(Self, ProcessIo), EngineError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| EngineError::spawn(&config.command, e))?;

        let mut cmd = CommandBuilder::new(&config.command);
        cmd.args(&config.args);
        if let Some(dir) = &config.working_dir {
            cmd.cwd(dir);
        }

        // Keep line editing plain so output stays free of cursor sequences
        cmd.env("TERM", "dumb");
        for key in ["PATH", "HOME", "USER"] {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| EngineError::spawn(&config.command, e))?;
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| EngineError::spawn(&config.command, e))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| EngineError::spawn(&config.command, e))?;

        let pid = child.process_id();
        info!("Softphone started with PID: {:?}", pid);

        Ok((
            Self {
                child: ChildHandle::Pty {
                    child,
                    _master: pair.master,
                },
                pid,
                command: config.command.clone(),
                exited: false,
            },
            ProcessIo { reader, writer },
        ))
    }

    fn spawn_piped(config: &EngineConfig) -> Result<(Self, ProcessIo), EngineError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| EngineError::spawn(&config.command, e))?;

        let writer = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::spawn(&config.command, "stdin not captured"))?;
        let reader = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::spawn(&config.command, "stdout not captured"))?;

        if let Some(stderr) = child.stderr.take() {
            std::thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    debug!(target: "softphone_control::stderr", "{}", line);
                }
            });
        }

        let pid = Some(child.id());
        info!("Softphone started with PID: {:?}", pid);

        Ok((
            Self {
                child: ChildHandle::Piped(child),
                pid,
                command: config.command.clone(),
                exited: false,
            },
            ProcessIo {
                reader: Box::new(reader),
                writer: Box::new(writer),
            },
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns true while the child has not been observed to exit
    pub fn is_running(&mut self) -> bool {
        if self.exited {
            return false;
        }
        let status = match &mut self.child {
            ChildHandle::Pty { child, .. } => child.try_wait().map(|s| s.map(|s| s.exit_code())),
            ChildHandle::Piped(child) => child
                .try_wait()
                .map(|s| s.map(|s| s.code().unwrap_or(-1) as u32)),
        };
        match status {
            Ok(None) => true,
            Ok(Some(code)) => {
                info!("Softphone '{}' exited with status: {}", self.command, code);
                self.exited = true;
                false
            }
            Err(e) => {
                warn!("Failed to poll softphone status: {}", e);
                true
            }
        }
    }

    /// Ask the process to stop (SIGTERM on Unix)
    pub fn terminate(&mut self) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Some(pid) = self.pid {
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    debug!("SIGTERM to {} failed: {}", pid, e);
                }
                return;
            }
        }
        self.kill();
    }

    /// Force the process down
    pub fn kill(&mut self) {
        let result = match &mut self.child {
            ChildHandle::Pty { child, .. } => child.kill(),
            ChildHandle::Piped(child) => child.kill(),
        };
        if let Err(e) = result {
            debug!("Kill of softphone failed: {}", e);
        }
    }

    /// Terminate, wait up to `grace` for the exit, then kill.
    ///
    /// Blocks the calling thread.
    pub fn shutdown(mut self, grace: Duration) {
        if !self.is_running() {
            return;
        }
        self.terminate();

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if !self.is_running() {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        warn!("Softphone did not exit within {:?}, killing it", grace);
        self.kill();
        let _ = match &mut self.child {
            ChildHandle::Pty { child, .. } => child.wait().map(|_| ()),
            ChildHandle::Piped(child) => child.wait().map(|_| ()),
        };
        self.exited = true;
    }
}

impl Drop for ControlledProcess {
    fn drop(&mut self) {
        if !self.exited && self.is_running() {
            self.kill();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn piped(command: &str, args: &[&str]) -> EngineConfig {
        EngineConfig {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            transport: Transport::Pipes,
            ..Default::default()
        }
    }

    #[test]
    fn test_spawn_missing_binary_fails() {
        let result = ControlledProcess::spawn(&piped("/nonexistent/softphone", &[]));
        assert!(matches!(result, Err(EngineError::Spawn { .. })));
    }

    #[test]
    fn test_piped_process_streams() {
        let (mut process, mut io) =
            ControlledProcess::spawn(&piped("sh", &["-c", "read line; echo \"got $line\""]))
                .unwrap();
        assert!(process.pid().is_some());

        io.writer.write_all(b"hello\n").unwrap();
        io.writer.flush().unwrap();

        let mut output = String::new();
        io.reader.read_to_string(&mut output).unwrap();
        assert_eq!(output.trim(), "got hello");

        process.shutdown(Duration::from_millis(500));
    }

    #[test]
    fn test_shutdown_terminates_running_process() {
        let (mut process, _io) = ControlledProcess::spawn(&piped("sleep", &["30"])).unwrap();
        assert!(process.is_running());
        let started = Instant::now();
        process.shutdown(Duration::from_millis(500));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
