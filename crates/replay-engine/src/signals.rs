//! Control-flow signals and the run error taxonomy.
//!
//! A run is one replay of the whole conversation. Anything that cuts a run
//! short is either a [`Signal`] — a deliberate steering decision raised by a
//! callback or mapped from an error by the exception processor — or a plain
//! [`RunError`] that the iteration controller hands to the exception
//! processor for classification.

use thiserror::Error;

/// Steering decisions the iteration controller acts on directly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Signal {
    /// The target is judged to have crashed; log this run's transcript.
    #[error("crash detected: {0}")]
    LogCrash(String),

    /// The run produced nothing meaningful; skip to the next seed.
    #[error("run aborted: {0}")]
    Abort(String),

    /// Transient trouble; re-run the same seed immediately.
    #[error("retry requested: {0}")]
    Retry(String),

    /// Stop the campaign after logging this run.
    #[error("halting after logging: {0}")]
    LogAndHalt(String),

    /// Stop the campaign after logging the previous run.
    #[error("halting after logging previous run: {0}")]
    LogLastAndHalt(String),

    /// Stop the campaign immediately.
    #[error("halting: {0}")]
    Halt(String),
}

/// Everything that can go wrong inside one run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Signal(#[from] Signal),

    /// The target closed the connection (zero-length read).
    #[error("target closed the connection")]
    ConnectionClosed,

    #[error("mutator unavailable: {0}")]
    MutatorUnavailable(String),

    #[error("tls handshake failed: {0}")]
    Tls(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Configuration problems surfaced while opening the target socket.
    #[error("{0}")]
    Setup(String),
}

impl RunError {
    /// The signal inside this error, if it is one.
    pub fn as_signal(&self) -> Option<&Signal> {
        match self {
            RunError::Signal(s) => Some(s),
            _ => None,
        }
    }
}
