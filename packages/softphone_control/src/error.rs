use thiserror::Error;

/// Errors raised while bringing an engine up
#[derive(Debug, Error)]
pub enum EngineError {
    /// The softphone process could not be started
    #[error("failed to spawn '{command}': {reason}")]
    Spawn { command: String, reason: String },

    /// Setting up the process streams failed
    #[error("process I/O setup failed: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub(crate) fn spawn(command: &str, reason: impl ToString) -> Self {
        EngineError::Spawn {
            command: command.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Errors raised when writing a command to the softphone
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The process input is closed; the command was not written
    #[error("softphone process is closed")]
    ProcessClosed,
}
