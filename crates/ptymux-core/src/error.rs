use std::time::Duration;

use thiserror::Error;

/// Errors raised by the pty process handle.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    Open(String),

    #[error("failed to spawn child: {0}")]
    Spawn(String),

    /// The child exited or the descriptors were torn down.
    #[error("pty closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons a session could not be brought to `Ready`.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("no executable found among candidates: {}", .0.join(", "))]
    ExecutableNotFound(Vec<String>),

    #[error("required environment variable not set: {0}")]
    MissingEnvironment(String),

    #[error("child exited during startup (exit code {code:?})")]
    ExitedEarly { code: Option<u32> },

    #[error("spawn failed: {0}")]
    Spawn(#[from] PtyError),

    #[error("session limit reached ({0})")]
    CapacityExceeded(usize),
}

/// Failures of a single `send`.
#[derive(Debug, Error)]
pub enum SendError {
    /// Another request is already in flight on this session.
    #[error("session busy")]
    Busy,

    /// No framed response before the deadline; the child is still alive.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The child exited, was killed, or the session is being stopped.
    #[error("process died")]
    ProcessDied,

    #[error("session not found: {0}")]
    NotFound(String),
}

impl SendError {
    /// Whether a caller may simply retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SendError::Busy | SendError::Timeout(_))
    }
}

impl From<PtyError> for SendError {
    fn from(_: PtyError) -> Self {
        // Any write-path failure means the child can no longer take input.
        SendError::ProcessDied
    }
}

/// A framer or sanitizer rule that does not compile.
#[derive(Debug, Error)]
#[error("invalid pattern {pattern:?}: {source}")]
pub struct PatternError {
    pub pattern: String,
    #[source]
    pub source: regex::Error,
}

pub type StartupResult<T> = Result<T, StartupError>;
pub type SendResult<T> = Result<T, SendError>;
