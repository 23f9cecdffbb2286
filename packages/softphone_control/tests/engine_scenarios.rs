use std::io::{self, Read, Write};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use softphone_control::handler::{CallEventHandler, CallTransition, Notice};
use softphone_control::{CallPhase, DispatchError, Engine, EngineConfig, RegistrationState};

// --- Scripted process streams ---

/// Process output fed line by line from the test; EOF once the sender drops
struct ScriptedOutput {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl Read for ScriptedOutput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(chunk) => self.pending = chunk,
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

/// Process input captured for assertions
#[derive(Clone, Default)]
struct CapturedInput(Arc<Mutex<Vec<u8>>>);

impl Write for CapturedInput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Process input that accepts nothing until the test releases it once
struct StuckInput {
    release: mpsc::Receiver<()>,
    released: bool,
    inner: CapturedInput,
}

impl Write for StuckInput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.released {
            let _ = self.release.recv();
            self.released = true;
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct Harness {
    engine: Arc<Engine>,
    output: Option<mpsc::Sender<Vec<u8>>>,
    input: CapturedInput,
}

impl Harness {
    fn new(handlers: Vec<Arc<dyn CallEventHandler>>) -> Self {
        let input = CapturedInput::default();
        Self::start(handlers, input.clone(), input)
    }

    /// Harness whose process input blocks until the returned sender fires
    fn with_stuck_input(handlers: Vec<Arc<dyn CallEventHandler>>) -> (Self, mpsc::Sender<()>) {
        let (release, gate) = mpsc::channel();
        let input = CapturedInput::default();
        let writer = StuckInput {
            release: gate,
            released: false,
            inner: input.clone(),
        };
        (Self::start(handlers, writer, input), release)
    }

    fn start<W>(handlers: Vec<Arc<dyn CallEventHandler>>, writer: W, input: CapturedInput) -> Self
    where
        W: Write + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let engine = Engine::attach(
            ScriptedOutput {
                rx,
                pending: Vec::new(),
            },
            writer,
            EngineConfig::default(),
            handlers,
        );
        Self {
            engine: Arc::new(engine),
            output: Some(tx),
            input,
        }
    }

    fn emit(&self, line: &str) {
        if let Some(tx) = &self.output {
            tx.send(format!("{line}\n").into_bytes()).unwrap();
        }
    }

    fn close_output(&mut self) {
        self.output.take();
    }

    fn sent(&self) -> Vec<String> {
        String::from_utf8(self.input.0.lock().unwrap().clone())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[derive(Default)]
struct Recorder {
    transitions: Mutex<Vec<CallTransition>>,
    registrations: Mutex<Vec<RegistrationState>>,
    notices: Mutex<Vec<Notice>>,
}

impl CallEventHandler for Recorder {
    fn on_call_progress(&self, transition: &CallTransition) {
        self.transitions.lock().unwrap().push(transition.clone());
    }

    fn on_registration(&self, state: &RegistrationState) {
        self.registrations.lock().unwrap().push(state.clone());
    }

    fn on_notice(&self, notice: &Notice) {
        self.notices.lock().unwrap().push(notice.clone());
    }
}

impl Recorder {
    fn stream_ended_count(&self) -> usize {
        self.notices
            .lock()
            .unwrap()
            .iter()
            .filter(|n| **n == Notice::StreamEnded)
            .count()
    }
}

struct Panicky;

/// Answers every incoming call from inside the callback
#[derive(Default)]
struct AutoAnswer {
    engine: OnceLock<Arc<Engine>>,
}

impl CallEventHandler for AutoAnswer {
    fn on_call_progress(&self, transition: &CallTransition) {
        if transition.to == CallPhase::Ringing {
            if let Some(engine) = self.engine.get() {
                engine.answer().unwrap();
            }
        }
    }
}

impl CallEventHandler for Panicky {
    fn on_call_progress(&self, _transition: &CallTransition) {
        panic!("handler bug");
    }
}

// --- Scenarios ---

#[tokio::test]
async fn test_registering_line_updates_registration() {
    let recorder = Arc::new(Recorder::default());
    let h = Harness::new(vec![recorder.clone()]);

    h.emit("registering phone sip:1001@pbx");

    assert!(eventually(|| h.engine.current_state().registration.registered).await);
    let registration = h.engine.current_state().registration;
    assert_eq!(registration.endpoint.as_deref(), Some("sip:1001@pbx"));
    assert_eq!(recorder.registrations.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_dial_then_ringing_then_bye() {
    let recorder = Arc::new(Recorder::default());
    let h = Harness::new(vec![recorder.clone()]);

    h.engine.call("010326").unwrap();
    assert_eq!(h.sent(), vec!["call 010326"]);
    let call = h.engine.current_state().call;
    assert_eq!(call.phase, CallPhase::Dialing);
    assert_eq!(call.peer_number.as_deref(), Some("010326"));

    h.emit("call trying 010326");
    assert!(eventually(|| h.engine.current_state().call.phase == CallPhase::Ringing).await);

    h.emit("Bye");
    assert!(eventually(|| h.engine.current_state().call.phase == CallPhase::Idle).await);
    assert_eq!(h.engine.current_state().call.peer_number, None);

    let to_idle = recorder
        .transitions
        .lock()
        .unwrap()
        .iter()
        .filter(|t| t.to == CallPhase::Idle)
        .count();
    assert_eq!(to_idle, 1);
}

#[tokio::test]
async fn test_end_of_stream_stops_loop_and_quit_is_idempotent() {
    let recorder = Arc::new(Recorder::default());
    let mut h = Harness::new(vec![recorder.clone()]);

    h.engine.call("010326").unwrap();
    h.close_output();

    assert!(eventually(|| !h.engine.is_running()).await);
    let snapshot = h.engine.current_state();
    assert!(!snapshot.process.alive);
    assert_eq!(snapshot.call.phase, CallPhase::Idle);
    assert!(
        recorder
            .notices
            .lock()
            .unwrap()
            .contains(&Notice::StreamEnded)
    );

    h.engine.quit().await;
    h.engine.quit().await;

    let quits = h.sent().iter().filter(|l| *l == "quit").count();
    assert_eq!(quits, 1);
    assert_eq!(h.engine.answer(), Err(DispatchError::ProcessClosed));
}

#[tokio::test]
async fn test_quit_mid_call_resets_state() {
    let recorder = Arc::new(Recorder::default());
    let h = Harness::new(vec![recorder.clone()]);

    h.engine.register().unwrap();
    h.engine.call("010326").unwrap();
    h.emit("Line 1: far end answered call.");
    assert!(eventually(|| h.engine.current_state().call.phase == CallPhase::Active).await);
    assert!(h.engine.current_state().registration.registered);

    h.engine.quit().await;

    let snapshot = h.engine.current_state();
    assert_eq!(snapshot.call.phase, CallPhase::Idle);
    assert_eq!(snapshot.call.peer_number, None);
    assert!(!snapshot.registration.registered);
    assert!(!snapshot.process.alive);
    assert!(!h.engine.is_running());

    assert_eq!(recorder.stream_ended_count(), 1);
    assert_eq!(
        recorder.transitions.lock().unwrap().last().map(|t| t.to),
        Some(CallPhase::Idle)
    );

    h.engine.quit().await;
    assert_eq!(recorder.stream_ended_count(), 1);
    assert_eq!(h.sent(), vec!["register", "call 010326", "quit"]);
}

#[tokio::test]
async fn test_stuck_input_does_not_stall_output_handling() {
    let (h, release) = Harness::with_stuck_input(Vec::new());

    let engine = h.engine.clone();
    let dialing = tokio::task::spawn_blocking(move || engine.call("010326"));

    h.emit("registering phone sip:1001@pbx");
    assert!(eventually(|| h.engine.current_state().registration.registered).await);
    assert_eq!(h.engine.current_state().call.phase, CallPhase::Idle);

    release.send(()).unwrap();
    dialing.await.unwrap().unwrap();

    assert_eq!(h.engine.current_state().call.phase, CallPhase::Dialing);
    assert_eq!(h.sent(), vec!["call 010326"]);
}

#[tokio::test]
async fn test_handler_may_command_engine_and_order_is_kept() {
    let auto_answer = Arc::new(AutoAnswer::default());
    let recorder = Arc::new(Recorder::default());
    let h = Harness::new(vec![auto_answer.clone(), recorder.clone()]);
    assert!(auto_answer.engine.set(h.engine.clone()).is_ok());

    h.emit("call 0212");

    assert!(eventually(|| h.engine.current_state().call.phase == CallPhase::Active).await);
    assert!(eventually(|| recorder.transitions.lock().unwrap().len() == 2).await);
    assert_eq!(h.sent(), vec!["answer"]);

    // Every handler hears transitions in the order they were applied
    let transitions = recorder.transitions.lock().unwrap();
    let phases: Vec<_> = transitions.iter().map(|t| (t.from, t.to)).collect();
    assert_eq!(
        phases,
        vec![
            (CallPhase::Idle, CallPhase::Ringing),
            (CallPhase::Ringing, CallPhase::Active),
        ]
    );
}

#[tokio::test]
async fn test_mute_without_call_is_not_sent() {
    let recorder = Arc::new(Recorder::default());
    let h = Harness::new(vec![recorder.clone()]);

    assert!(h.engine.mute().is_ok());

    assert!(h.sent().is_empty());
    assert!(!h.engine.current_state().call.muted);
    assert!(matches!(
        recorder.notices.lock().unwrap().as_slice(),
        [Notice::Rejected { .. }]
    ));
}

#[tokio::test]
async fn test_mute_during_call_is_sent() {
    let h = Harness::new(Vec::new());

    h.engine.call("010326").unwrap();
    h.engine.mute().unwrap();
    h.engine.un_mute().unwrap();

    assert_eq!(h.sent(), vec!["call 010326", "mute -s on", "mute -s off"]);
    assert!(!h.engine.current_state().call.muted);
}

#[tokio::test]
async fn test_panicking_handler_does_not_stop_engine() {
    let recorder = Arc::new(Recorder::default());
    let h = Harness::new(vec![Arc::new(Panicky), recorder.clone()]);

    h.engine.call("010326").unwrap();
    h.emit("Line 1: far end answered call.");

    assert!(eventually(|| h.engine.current_state().call.phase == CallPhase::Active).await);
    assert!(h.engine.is_running());
    assert_eq!(recorder.transitions.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_handler_added_later_sees_events() {
    let h = Harness::new(Vec::new());
    let recorder = Arc::new(Recorder::default());
    h.engine.add_handler(recorder.clone());

    h.emit("Registration failed: 403 Forbidden");
    h.emit("something unexpected");

    assert!(eventually(|| !recorder.notices.lock().unwrap().is_empty()).await);
    assert!(matches!(
        recorder.notices.lock().unwrap().as_slice(),
        [Notice::Unrecognized(line)] if line.text == "something unexpected"
    ));
}

#[tokio::test]
async fn test_ready_after_banner() {
    let h = Harness::new(Vec::new());

    assert!(!h.engine.wait_ready(Duration::from_millis(50)).await);
    assert!(!h.engine.current_state().process.ready);

    h.emit("Twinkle 1.10.2");
    assert!(h.engine.wait_ready(Duration::from_secs(3)).await);
    assert!(h.engine.current_state().process.ready);
}

#[tokio::test]
async fn test_duplicate_lines_are_applied_once() {
    let recorder = Arc::new(Recorder::default());
    let h = Harness::new(vec![recorder.clone()]);

    h.emit("registering phone sip:1001@pbx");
    h.emit("registering phone sip:1001@pbx");
    h.emit("Registration failed");

    assert!(eventually(|| recorder.registrations.lock().unwrap().len() == 2).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.registrations.lock().unwrap().len(), 2);
}

#[cfg(unix)]
#[tokio::test]
async fn test_supervises_real_process_over_pipes() {
    use softphone_control::Transport;

    let script = r#"echo "Twinkle test build"
while read cmd; do
  case "$cmd" in
    call*) echo "call trying ${cmd#call }" ;;
    bye) echo "Bye" ;;
    quit) exit 0 ;;
  esac
done"#;

    let config = EngineConfig {
        command: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        transport: Transport::Pipes,
        ..Default::default()
    };
    let engine = Engine::spawn(config, Vec::new()).unwrap();

    assert!(engine.wait_ready(Duration::from_secs(5)).await);
    assert!(engine.current_state().process.pid.is_some());

    engine.call("010326").unwrap();
    assert!(eventually(|| engine.current_state().call.phase == CallPhase::Ringing).await);

    engine.bye().unwrap();
    assert!(eventually(|| engine.current_state().call.phase == CallPhase::Idle).await);

    engine.quit().await;
    assert!(!engine.current_state().process.alive);
    assert!(!engine.is_running());
}

#[cfg(unix)]
#[tokio::test]
async fn test_exit_detected_while_output_stays_open() {
    use softphone_control::Transport;

    // The background sleep keeps stdout open after the shell exits
    let recorder = Arc::new(Recorder::default());
    let config = EngineConfig {
        command: "sh".to_string(),
        args: vec![
            "-c".to_string(),
            r#"echo "Twinkle test build"; sleep 5 & exit 0"#.to_string(),
        ],
        transport: Transport::Pipes,
        ..Default::default()
    };
    let engine = Engine::spawn(config, vec![recorder.clone()]).unwrap();

    assert!(engine.wait_ready(Duration::from_secs(5)).await);
    assert!(eventually(|| !engine.is_running()).await);

    let snapshot = engine.current_state();
    assert!(!snapshot.process.alive);
    assert_eq!(snapshot.call.phase, CallPhase::Idle);
    assert!(
        recorder
            .notices
            .lock()
            .unwrap()
            .contains(&Notice::StreamEnded)
    );
    assert_eq!(engine.call("010326"), Err(DispatchError::ProcessClosed));

    engine.quit().await;
}
