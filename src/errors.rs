use thiserror::Error;

use crate::transport::UserHandle;

/// Errors returned by the registration API while the bot is being set up.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SetupError {
    #[error("failed to register command {0}, which is already registered before")]
    DuplicateCommand(String),
    #[error("invalid command name {0:?}: names must be non-empty, without whitespace or a leading '/'")]
    InvalidCommandName(String),
    #[error("on message handler is already registered")]
    MessageHandlerRegistered,
    #[error("on offline handler is already registered")]
    OfflineHandlerRegistered,
}

/// Malformed command text.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("command text is empty")]
    Empty,
    #[error("command text does not start with '/': {0}")]
    MissingMarker(String),
    #[error("command name is empty")]
    EmptyName,
}

/// Failures while executing a classified command. These never leave the
/// dispatcher; they are logged against the message that caused them.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("command not found: {0}")]
    CommandNotFound(String),
    #[error("user({sender}) not allowed to run command({command})")]
    NotAllowed { command: String, sender: UserHandle },
    #[error("failed to check permission with is_allowed(command: {command})")]
    Permission {
        command: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to run command({command})")]
    Execution {
        command: String,
        #[source]
        source: anyhow::Error,
    },
}

impl DispatchError {
    /// Short machine-readable kind, used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::CommandNotFound(_) => "command_not_found",
            DispatchError::NotAllowed { .. } => "not_allowed",
            DispatchError::Permission { .. } => "permission_check_failed",
            DispatchError::Execution { .. } => "execution_failed",
        }
    }
}

/// Startup failures. Any of these aborts `run` before a message is served.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to login")]
    Login(#[source] anyhow::Error),
    #[error("failed to get robot user")]
    CurrentUser(#[source] anyhow::Error),
    #[error("failed to list friends")]
    Friends(#[source] anyhow::Error),
    #[error("transport stopped serving")]
    Serve(#[source] anyhow::Error),
}
