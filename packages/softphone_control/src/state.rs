//! Softphone State Types
//!
//! Defines the call and registration state tracked for a controlled
//! softphone, plus the classified events that drive it.

use serde::{Deserialize, Serialize};

use crate::line_channel::RawLine;

/// Phase of the (single) call handled by the softphone
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    /// No call in progress
    #[default]
    Idle,

    /// `call` was sent, nothing heard back yet
    Dialing,

    /// The far end is ringing, or an incoming call is waiting to be answered
    Ringing,

    /// Call connected
    Active,

    /// Call connected and put on hold locally
    Held,

    /// `bye` was sent, waiting for the softphone to confirm
    Terminating,
}

impl CallPhase {
    /// Returns true if a call exists in any form
    pub fn in_call(&self) -> bool {
        !matches!(self, CallPhase::Idle)
    }

    /// Returns true if media is flowing (mute is meaningful)
    pub fn is_connected(&self) -> bool {
        matches!(self, CallPhase::Active | CallPhase::Held)
    }
}

/// Call status as last observed or optimistically assumed
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallState {
    pub phase: CallPhase,
    /// Only meaningful while the phase is `Active` or `Held`
    pub muted: bool,
    pub peer_number: Option<String>,
}

/// SIP registration status, independent of the call
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistrationState {
    pub registered: bool,
    pub endpoint: Option<String>,
}

/// Liveness of the controlled process
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessStatus {
    pub alive: bool,
    /// True once the start-up banner has been seen
    pub ready: bool,
    pub pid: Option<u32>,
}

/// Consistent copy of everything the engine tracks
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineSnapshot {
    pub call: CallState,
    pub registration: RegistrationState,
    pub process: ProcessStatus,
}

/// Typed interpretation of one output line (or of a stream condition)
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DomainEvent {
    /// The call is being set up but no number could be read from the line
    Trying,

    /// The call is ringing; carries the number read from the line
    Ringing { number: String },

    /// The far end picked up
    Answered,

    /// The call is over
    Ended,

    /// The phone is registering at the given endpoint
    Registering { endpoint: Option<String> },

    RegistrationFailed,

    /// No output within the idle timeout
    StreamTimeout,

    /// The process output closed
    StreamEnded,

    /// Nothing matched; the line is kept for observers
    Unrecognized(RawLine),
}

impl DomainEvent {
    /// Short stable name, used in logs and notices
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::Trying => "trying",
            DomainEvent::Ringing { .. } => "ringing",
            DomainEvent::Answered => "answered",
            DomainEvent::Ended => "ended",
            DomainEvent::Registering { .. } => "registering",
            DomainEvent::RegistrationFailed => "registration_failed",
            DomainEvent::StreamTimeout => "stream_timeout",
            DomainEvent::StreamEnded => "stream_ended",
            DomainEvent::Unrecognized(_) => "unrecognized",
        }
    }
}
