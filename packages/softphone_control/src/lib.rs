//! Process-control engine for text-protocol softphones.
//!
//! Drives a command-line SIP client (Twinkle by default) as a child process:
//! commands go to its stdin, its output is read line by line, classified into
//! call events and folded into an authoritative call state. Applications
//! observe progress through [`CallEventHandler`] callbacks or by polling
//! [`Engine::current_state`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use softphone_control::{Engine, EngineConfig, LoggingHandler};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::spawn(EngineConfig::default(), vec![Arc::new(LoggingHandler)])?;
//! engine.wait_ready(Duration::from_secs(5)).await;
//! engine.call("010326")?;
//! engine.quit().await;
//! # Ok(())
//! # }
//! ```

pub mod classifier;
pub mod command;
pub mod engine;
pub mod error;
pub mod handler;
pub mod line_channel;
pub mod machine;
pub mod process;
pub mod state;

pub use classifier::{classify, classify_text};
pub use command::{CommandDispatcher, CommandIntent, CommandKind};
pub use engine::{Engine, EngineConfig};
pub use error::{DispatchError, EngineError};
pub use handler::{CallEventHandler, CallTransition, LoggingHandler, Notice, TransitionCause};
pub use line_channel::{LineChannel, LineSignal, RawLine};
pub use machine::CallStateMachine;
pub use process::Transport;
pub use state::{CallPhase, CallState, DomainEvent, EngineSnapshot, ProcessStatus, RegistrationState};
