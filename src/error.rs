//! Error types shared by the reactor, sessions, and pipelines.

use std::io;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the reactor.
///
/// Session-level failures reach application code through the pipeline's
/// exception event; everything else is returned directly to the caller.
#[derive(Debug, Error)]
pub enum Error {
    /// A bound, size, name, or payload type was rejected at call time.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The event loop is not (or no longer) running.
    #[error("event loop is not running")]
    NotRunning,

    /// `start()` was called on a loop that already left `NotStarted`.
    #[error("event loop already started")]
    AlreadyStarted,

    /// The session closed before the operation could complete.
    #[error("session is closed")]
    SessionClosed,

    /// A promise was dropped without being completed.
    #[error("promise dropped before completion")]
    Abandoned,

    /// Waiting on a completion exceeded its deadline.
    #[error("timed out waiting for completion")]
    TimedOut,

    /// A scheduled task or handler panicked on the loop thread.
    #[error("panicked: {0}")]
    Panicked(String),

    /// A decoder rejected malformed input.
    #[error("decode failed: {0}")]
    Decode(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// True for errors that mean the peer went away rather than misbehaved.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Error::Io(e) if matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            )
        )
    }
}

/// Render a panic payload for logging.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
