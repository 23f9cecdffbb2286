//! Call State Machine
//!
//! Single source of truth for call and registration status. Commands are
//! applied optimistically when they are written; classified output events
//! then confirm or correct the state.
//!
//! The softphone's text stream is not guaranteed to be complete, so any
//! input that has no meaning in the current phase is ignored with a warning
//! instead of failing. Jumping from `Dialing` straight to `Idle` on a
//! hang-up line is valid.

use tracing::{debug, warn};

use crate::command::{CommandIntent, CommandKind};
use crate::handler::{CallTransition, Notice, Notification, TransitionCause};
use crate::state::{CallPhase, CallState, DomainEvent, RegistrationState};

#[derive(Debug, Default)]
pub struct CallStateMachine {
    call: CallState,
    registration: RegistrationState,
}

impl CallStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call(&self) -> &CallState {
        &self.call
    }

    pub fn registration(&self) -> &RegistrationState {
        &self.registration
    }

    /// Check whether a command may be sent at all.
    ///
    /// Mute and unmute are refused while no call exists.
    pub fn admit(&self, intent: &CommandIntent) -> Result<(), Notice> {
        match intent.kind {
            CommandKind::Mute | CommandKind::UnMute if !self.call.phase.in_call() => {
                warn!("Refusing {:?}: no call in progress", intent.kind);
                Err(Notice::Rejected {
                    command: intent.kind,
                    reason: "no call in progress".to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Apply the optimistic effect of a command that was just written
    pub fn apply_command(&mut self, intent: &CommandIntent) -> Vec<Notification> {
        let cause = TransitionCause::Command(intent.kind);
        let phase = self.call.phase;

        match intent.kind {
            CommandKind::Call => {
                if phase != CallPhase::Idle {
                    return vec![self.unexpected(&intent.text)];
                }
                self.call.peer_number = intent.payload.clone().filter(|n| !n.is_empty());
                self.call.muted = false;
                vec![self.transition(CallPhase::Dialing, cause)]
            }
            CommandKind::Answer => match phase {
                CallPhase::Dialing | CallPhase::Ringing => {
                    vec![self.transition(CallPhase::Active, cause)]
                }
                _ => vec![self.unexpected(&intent.text)],
            },
            CommandKind::Hold => match phase {
                CallPhase::Active => vec![self.transition(CallPhase::Held, cause)],
                _ => vec![self.unexpected(&intent.text)],
            },
            CommandKind::UnHold => match phase {
                CallPhase::Held => vec![self.transition(CallPhase::Active, cause)],
                _ => vec![self.unexpected(&intent.text)],
            },
            CommandKind::Bye => match phase {
                CallPhase::Idle | CallPhase::Terminating => vec![self.unexpected(&intent.text)],
                _ => vec![self.transition(CallPhase::Terminating, cause)],
            },
            CommandKind::Mute | CommandKind::UnMute => {
                if !phase.in_call() {
                    return vec![self.unexpected(&intent.text)];
                }
                let muted = intent.kind == CommandKind::Mute;
                if self.call.muted == muted {
                    return Vec::new();
                }
                self.call.muted = muted;
                debug!("Mute set to {} while {:?}", muted, phase);
                vec![Notification::CallProgress(CallTransition {
                    from: phase,
                    to: phase,
                    cause,
                    state: self.call.clone(),
                })]
            }
            CommandKind::Register => self.set_registration(true, None),
            CommandKind::Deregister => self.set_registration(false, None),
            _ => Vec::new(),
        }
    }

    /// Apply a classified event
    pub fn apply_event(&mut self, event: &DomainEvent) -> Vec<Notification> {
        let cause = TransitionCause::Event(event.name());
        let phase = self.call.phase;

        match event {
            DomainEvent::Trying => match phase {
                CallPhase::Dialing => vec![self.transition(CallPhase::Ringing, cause)],
                CallPhase::Ringing => Vec::new(),
                _ => vec![self.unexpected(event.name())],
            },
            DomainEvent::Ringing { number } => match phase {
                CallPhase::Idle | CallPhase::Dialing => {
                    if self.call.peer_number.is_none() {
                        self.call.peer_number = Some(number.clone());
                    }
                    vec![self.transition(CallPhase::Ringing, cause)]
                }
                CallPhase::Ringing => {
                    if self.call.peer_number.is_none() {
                        self.call.peer_number = Some(number.clone());
                    }
                    Vec::new()
                }
                _ => vec![self.unexpected(event.name())],
            },
            DomainEvent::Answered => match phase {
                CallPhase::Dialing | CallPhase::Ringing => {
                    vec![self.transition(CallPhase::Active, cause)]
                }
                _ => vec![self.unexpected(event.name())],
            },
            DomainEvent::Ended => {
                if phase.in_call() {
                    vec![self.transition(CallPhase::Idle, cause)]
                } else {
                    vec![self.unexpected(event.name())]
                }
            }
            DomainEvent::Registering { endpoint } => {
                self.set_registration(true, endpoint.clone())
            }
            DomainEvent::RegistrationFailed => self.set_registration(false, None),
            DomainEvent::StreamTimeout => Vec::new(),
            DomainEvent::StreamEnded => self.reset(),
            DomainEvent::Unrecognized(line) => {
                vec![Notification::Notice(Notice::Unrecognized(line.clone()))]
            }
        }
    }

    /// The process is gone: no call and no registration can survive it
    pub fn reset(&mut self) -> Vec<Notification> {
        let mut notifications = Vec::new();
        if self.call.phase.in_call() {
            notifications.push(self.transition(CallPhase::Idle, TransitionCause::StreamEnded));
        }
        notifications.extend(self.set_registration(false, None));
        notifications.push(Notification::Notice(Notice::StreamEnded));
        notifications
    }

    fn transition(&mut self, to: CallPhase, cause: TransitionCause) -> Notification {
        let from = self.call.phase;
        self.call.phase = to;
        if to == CallPhase::Idle {
            self.call.peer_number = None;
            self.call.muted = false;
        }
        debug!("Call state changed: {:?} -> {:?} ({:?})", from, to, cause);
        Notification::CallProgress(CallTransition {
            from,
            to,
            cause,
            state: self.call.clone(),
        })
    }

    fn set_registration(&mut self, registered: bool, endpoint: Option<String>) -> Vec<Notification> {
        let next = RegistrationState {
            registered,
            endpoint: if registered {
                endpoint.or_else(|| self.registration.endpoint.clone())
            } else {
                None
            },
        };
        if next == self.registration {
            return Vec::new();
        }
        debug!(
            "Registration changed: {:?} -> {:?}",
            self.registration, next
        );
        self.registration = next;
        vec![Notification::Registration(self.registration.clone())]
    }

    fn unexpected(&self, input: &str) -> Notification {
        warn!(
            "Unrecognized-in-context: {} while {:?}",
            input, self.call.phase
        );
        Notification::Notice(Notice::UnexpectedInContext {
            input: input.to_string(),
            phase: self.call.phase,
        })
    }
}
