//! Application callbacks.
//!
//! Handlers are capability sets: implement only the categories you care
//! about, every method defaults to a no-op.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};

use tracing::{error, info, warn};

use crate::command::CommandKind;
use crate::line_channel::RawLine;
use crate::state::{CallPhase, CallState, RegistrationState};

/// What caused a call transition
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransitionCause {
    /// A command we sent (optimistic)
    Command(CommandKind),
    /// A classified output line, by event name
    Event(&'static str),
    /// The process output closed
    StreamEnded,
}

/// An accepted change of the call state
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallTransition {
    pub from: CallPhase,
    pub to: CallPhase,
    pub cause: TransitionCause,
    /// State after the transition
    pub state: CallState,
}

/// Informational and error conditions
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notice {
    /// A line matched no classification rule
    Unrecognized(RawLine),
    /// An event or command arrived in a phase where it means nothing
    UnexpectedInContext { input: String, phase: CallPhase },
    /// A command was refused and not sent
    Rejected { command: CommandKind, reason: String },
    /// The softphone output closed
    StreamEnded,
}

/// Callbacks fired by the engine, one method per event category.
///
/// Notifications arrive in the order the state changed, one at a time,
/// on whichever thread is delivering (the inbound loop or a thread that
/// sent a command). A handler may send commands back to the engine; their
/// notifications are delivered after the current one returns.
pub trait CallEventHandler: Send + Sync {
    /// Call progress: dialing, ringing, answered, held, ended, mute changes
    fn on_call_progress(&self, _transition: &CallTransition) {}

    /// Registration changed
    fn on_registration(&self, _state: &RegistrationState) {}

    /// Errors, warnings and unrecognized output
    fn on_notice(&self, _notice: &Notice) {}
}

/// Something a handler should hear about
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    CallProgress(CallTransition),
    Registration(RegistrationState),
    Notice(Notice),
}

/// Ordered set of handlers
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<Vec<Arc<dyn CallEventHandler>>>,
}

impl HandlerRegistry {
    pub fn new(handlers: Vec<Arc<dyn CallEventHandler>>) -> Self {
        Self {
            handlers: RwLock::new(handlers),
        }
    }

    pub fn add(&self, handler: Arc<dyn CallEventHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver notifications to every handler, in registration order.
    ///
    /// A panicking handler is logged and skipped; the rest still run.
    pub fn dispatch(&self, notifications: &[Notification]) {
        if notifications.is_empty() {
            return;
        }
        // Clone the list so handlers may register further handlers
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for notification in notifications {
            for handler in &handlers {
                let result = catch_unwind(AssertUnwindSafe(|| match notification {
                    Notification::CallProgress(t) => handler.on_call_progress(t),
                    Notification::Registration(r) => handler.on_registration(r),
                    Notification::Notice(n) => handler.on_notice(n),
                }));
                if result.is_err() {
                    error!("Handler panicked while handling {:?}", notification);
                }
            }
        }
    }
}

/// Logs call progress the way a bare console driver would
pub struct LoggingHandler;

impl CallEventHandler for LoggingHandler {
    fn on_call_progress(&self, transition: &CallTransition) {
        match transition.to {
            CallPhase::Dialing | CallPhase::Ringing if transition.from != transition.to => {
                match &transition.state.peer_number {
                    Some(number) => info!("Calling to {}", number),
                    None => info!("Trying to call"),
                }
            }
            CallPhase::Idle => info!("Bye"),
            to => info!("Call {:?} -> {:?}", transition.from, to),
        }
    }

    fn on_registration(&self, state: &RegistrationState) {
        match (state.registered, state.endpoint.as_deref()) {
            (true, Some(endpoint)) => info!("Registered as {}", endpoint),
            (true, None) => info!("Registered"),
            (false, _) => info!("Not registered"),
        }
    }

    fn on_notice(&self, notice: &Notice) {
        match notice {
            Notice::Unrecognized(line) => info!("Softphone: {}", line.text),
            Notice::UnexpectedInContext { input, phase } => {
                warn!("Ignoring {} while {:?}", input, phase)
            }
            Notice::Rejected { command, reason } => warn!("Rejected {:?}: {}", command, reason),
            Notice::StreamEnded => warn!("Softphone output closed"),
        }
    }
}
