//! Supervisor
//!
//! Owns the softphone process and the single inbound loop that reads lines,
//! classifies them and feeds the state machine. Commands may be sent from
//! any thread concurrently with the loop; both sides mutate state through
//! one lock, one mutation at a time.
//!
//! ## Locking
//!
//! - `command_gate` serialises commands: admission, the write and the
//!   optimistic effect happen as one unit. The machine lock is never held
//!   across the write, so a slow or stuck process input cannot stall the
//!   inbound loop.
//! - Notifications are queued while the machine lock is held, so the queue
//!   is in mutation order. Whichever thread finds nobody delivering drains
//!   it; a handler that calls back into the engine only enqueues.

use std::collections::{BTreeMap, VecDeque};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use crate::classifier::classify;
use crate::command::{CommandDispatcher, CommandIntent};
use crate::error::{DispatchError, EngineError};
use crate::handler::{CallEventHandler, HandlerRegistry, Notification};
use crate::line_channel::{LineChannel, LineSignal, RawLine};
use crate::machine::CallStateMachine;
use crate::process::{ControlledProcess, Transport};
use crate::state::{DomainEvent, EngineSnapshot, ProcessStatus};

/// Configuration for spawning and supervising a softphone
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub env: BTreeMap<String, String>,
    pub transport: Transport,
    pub rows: u16,
    pub cols: u16,
    /// How long a read waits before the loop checks on shutdown and health
    pub idle_timeout_ms: u64,
    /// Output marking the softphone as ready; `None` means ready at once
    pub ready_banner: Option<String>,
    /// Time the process gets to exit after SIGTERM before it is killed
    pub shutdown_grace_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: "twinkle".to_string(),
            args: vec!["-c".to_string()],
            working_dir: None,
            env: BTreeMap::new(),
            transport: Transport::Pty,
            rows: 24,
            cols: 80,
            idle_timeout_ms: 100,
            ready_banner: Some("Twinkle".to_string()),
            shutdown_grace_ms: 500,
        }
    }
}

impl EngineConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// State shared between the engine handle and its inbound loop
struct Shared {
    machine: Mutex<CallStateMachine>,
    command_gate: Mutex<()>,
    dispatcher: CommandDispatcher,
    handlers: HandlerRegistry,
    pending: Mutex<VecDeque<Notification>>,
    delivering: AtomicBool,
    ended: AtomicBool,
    process: Mutex<Option<ControlledProcess>>,
    alive: AtomicBool,
    pid: Option<u32>,
    ready: watch::Sender<bool>,
    ready_banner: Option<String>,
    cancel: CancellationToken,
    shutdown_grace: Duration,
}

impl Shared {
    fn machine(&self) -> MutexGuard<'_, CallStateMachine> {
        self.machine.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<Notification>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` on the machine and queue what it reports before unlocking
    fn mutate<F>(&self, f: F)
    where
        F: FnOnce(&mut CallStateMachine) -> Vec<Notification>,
    {
        {
            let mut machine = self.machine();
            let notifications = f(&mut machine);
            if !notifications.is_empty() {
                self.pending().extend(notifications);
            }
        }
        self.deliver();
    }

    /// Drain queued notifications to the handlers unless another thread is
    /// already doing so
    fn deliver(&self) {
        loop {
            if self
                .delivering
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }
            loop {
                let batch: Vec<Notification> = self.pending().drain(..).collect();
                if batch.is_empty() {
                    break;
                }
                self.handlers.dispatch(&batch);
            }
            self.delivering.store(false, Ordering::SeqCst);
            // Picks up anything queued between the last drain and the store
            if self.pending().is_empty() {
                return;
            }
        }
    }

    /// Send a command and apply its optimistic effect.
    ///
    /// Events from the inbound loop may be applied between admission and
    /// the effect; the machine re-checks the phase when applying.
    fn dispatch(&self, intent: CommandIntent) -> Result<(), DispatchError> {
        let _gate = self.command_gate.lock().unwrap_or_else(|e| e.into_inner());

        let admitted = self.machine().admit(&intent);
        if let Err(notice) = admitted {
            self.pending().push_back(Notification::Notice(notice));
            self.deliver();
            return Ok(());
        }

        self.dispatcher.send(&intent)?;
        self.mutate(|machine| machine.apply_command(&intent));
        Ok(())
    }

    fn apply_event(&self, event: &DomainEvent) {
        self.mutate(|machine| machine.apply_event(event));
    }

    /// Apply `StreamEnded` once, whether the loop or `quit` gets there first
    fn finish_stream(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        self.alive.store(false, Ordering::SeqCst);
        self.apply_event(&DomainEvent::StreamEnded);
    }

    fn handle_line(&self, line: RawLine) {
        if !*self.ready.borrow() {
            if let Some(banner) = &self.ready_banner {
                if line.text.contains(banner.as_str()) {
                    info!("Softphone ready");
                    self.ready.send_replace(true);
                }
            }
        }

        let event = std::panic::catch_unwind(|| classify(&line)).unwrap_or_else(|_| {
            error!("Classifier panicked on line: {:?}", line.text);
            DomainEvent::Unrecognized(line.clone())
        });
        debug!("EVENT: {} <- {:?}", event.name(), line.text);
        self.apply_event(&event);
    }

    /// Health check run whenever the stream goes quiet
    fn process_exited(&self) -> bool {
        let mut process = self.process.lock().unwrap_or_else(|e| e.into_inner());
        match process.as_mut() {
            Some(p) => !p.is_running(),
            None => false,
        }
    }

    async fn on_stream_ended(&self) {
        warn!("Softphone output ended; shutting down");
        self.dispatcher.send_best_effort(&CommandIntent::quit());
        self.dispatcher.close();
        self.finish_stream();
        self.release_process().await;
    }

    async fn release_process(&self) {
        let process = self
            .process
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(process) = process {
            let grace = self.shutdown_grace;
            if let Err(e) = tokio::task::spawn_blocking(move || process.shutdown(grace)).await {
                warn!("Process shutdown task failed: {}", e);
            }
        }
    }
}

async fn run_inbound(shared: Arc<Shared>, mut channel: LineChannel) {
    info!("Inbound loop started");
    loop {
        let signal = tokio::select! {
            _ = shared.cancel.cancelled() => {
                debug!("Inbound loop cancelled");
                break;
            }
            signal = channel.next() => signal,
        };

        match signal {
            Some(LineSignal::Line(line)) => shared.handle_line(line),
            Some(LineSignal::Timeout) => {
                trace!("No output within idle timeout");
                shared.apply_event(&DomainEvent::StreamTimeout);
                if shared.process_exited() {
                    shared.on_stream_ended().await;
                    break;
                }
            }
            Some(LineSignal::Ended) | None => {
                shared.on_stream_ended().await;
                break;
            }
        }
    }
    info!("Inbound loop stopped");
}

/// Handle to a supervised softphone
pub struct Engine {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
    quit_started: AtomicBool,
}

impl Engine {
    /// Spawn the configured softphone and start supervising it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(
        config: EngineConfig,
        handlers: Vec<Arc<dyn CallEventHandler>>,
    ) -> Result<Self, EngineError> {
        let (process, io) = ControlledProcess::spawn(&config)?;
        Ok(Self::start(io.reader, io.writer, Some(process), &config, handlers))
    }

    /// Run the engine over existing streams instead of a spawned process.
    ///
    /// Process settings in `config` are ignored. Must be called from within
    /// a Tokio runtime.
    pub fn attach<R, W>(
        reader: R,
        writer: W,
        config: EngineConfig,
        handlers: Vec<Arc<dyn CallEventHandler>>,
    ) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        Self::start(Box::new(reader), Box::new(writer), None, &config, handlers)
    }

    fn start(
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        process: Option<ControlledProcess>,
        config: &EngineConfig,
        handlers: Vec<Arc<dyn CallEventHandler>>,
    ) -> Self {
        let pid = process.as_ref().and_then(|p| p.pid());
        let (ready, _) = watch::channel(config.ready_banner.is_none());

        let shared = Arc::new(Shared {
            machine: Mutex::new(CallStateMachine::new()),
            command_gate: Mutex::new(()),
            dispatcher: CommandDispatcher::new(writer),
            handlers: HandlerRegistry::new(handlers),
            pending: Mutex::new(VecDeque::new()),
            delivering: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            process: Mutex::new(process),
            alive: AtomicBool::new(true),
            pid,
            ready,
            ready_banner: config.ready_banner.clone(),
            cancel: CancellationToken::new(),
            shutdown_grace: config.shutdown_grace(),
        });

        let channel = LineChannel::spawn(reader, config.idle_timeout());
        let span = info_span!("engine", pid = ?pid);
        let task = tokio::spawn(run_inbound(shared.clone(), channel).instrument(span));

        Self {
            shared,
            task: Mutex::new(Some(task)),
            quit_started: AtomicBool::new(false),
        }
    }

    /// Consistent copy of call, registration and process state
    pub fn current_state(&self) -> EngineSnapshot {
        let machine = self.shared.machine();
        EngineSnapshot {
            call: machine.call().clone(),
            registration: machine.registration().clone(),
            process: ProcessStatus {
                alive: self.shared.alive.load(Ordering::SeqCst),
                ready: *self.shared.ready.borrow(),
                pid: self.shared.pid,
            },
        }
    }

    /// Register a handler; it sees everything from now on
    pub fn add_handler(&self, handler: Arc<dyn CallEventHandler>) {
        self.shared.handlers.add(handler);
    }

    /// Wait until the start-up banner was seen
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.shared.ready.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|ready| *ready))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Returns true while the inbound loop is running
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Send any command
    pub fn send(&self, intent: CommandIntent) -> Result<(), DispatchError> {
        self.shared.dispatch(intent)
    }

    pub fn call(&self, number: &str) -> Result<(), DispatchError> {
        self.send(CommandIntent::call(number))
    }

    pub fn answer(&self) -> Result<(), DispatchError> {
        self.send(CommandIntent::answer())
    }

    pub fn bye(&self) -> Result<(), DispatchError> {
        self.send(CommandIntent::bye())
    }

    pub fn mute(&self) -> Result<(), DispatchError> {
        self.send(CommandIntent::mute())
    }

    pub fn un_mute(&self) -> Result<(), DispatchError> {
        self.send(CommandIntent::un_mute())
    }

    pub fn dtmf(&self, digits: &str) -> Result<(), DispatchError> {
        self.send(CommandIntent::dtmf(digits))
    }

    pub fn hold(&self) -> Result<(), DispatchError> {
        self.send(CommandIntent::hold())
    }

    pub fn un_hold(&self) -> Result<(), DispatchError> {
        self.send(CommandIntent::un_hold())
    }

    pub fn register(&self) -> Result<(), DispatchError> {
        self.send(CommandIntent::register())
    }

    pub fn deregister(&self) -> Result<(), DispatchError> {
        self.send(CommandIntent::deregister())
    }

    pub fn set_line(&self, line: u8) -> Result<(), DispatchError> {
        self.send(CommandIntent::set_line(line))
    }

    pub fn dnd(&self, on: bool) -> Result<(), DispatchError> {
        self.send(CommandIntent::dnd(on))
    }

    pub fn user(&self, profile: Option<&str>) -> Result<(), DispatchError> {
        self.send(CommandIntent::user(profile))
    }

    pub fn presence(&self, online: bool) -> Result<(), DispatchError> {
        self.send(CommandIntent::presence(online))
    }

    pub fn auto_answer(&self, on: bool) -> Result<(), DispatchError> {
        self.send(CommandIntent::auto_answer(on))
    }

    pub fn help(&self) -> Result<(), DispatchError> {
        self.send(CommandIntent::help())
    }

    /// Send `quit`, stop the inbound loop and release the process.
    ///
    /// Leaves the state as after end of stream: idle and unregistered.
    /// Only the first call does anything.
    pub async fn quit(&self) {
        if self.quit_started.swap(true, Ordering::SeqCst) {
            debug!("Quit already requested");
            return;
        }
        info!("Quitting softphone");

        if self.shared.dispatcher.is_open() {
            if let Err(e) = self.shared.dispatch(CommandIntent::quit()) {
                debug!("Quit command not delivered: {}", e);
            }
        }
        self.shared.dispatcher.close();
        self.shared.cancel.cancel();

        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Inbound loop task failed: {}", e);
            }
        }

        self.shared.finish_stream();
        self.shared.release_process().await;
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
        self.shared.dispatcher.close();
        // ControlledProcess kills the child when dropped
        let process = self
            .shared
            .process
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(process);
    }
}
