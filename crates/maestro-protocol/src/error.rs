// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// The failure taxonomy surfaced in `error` events and in `done{aborted}`.
///
/// Admission failures (`Validation`, `NotFound`, `Busy`, `AtCapacity`) are
/// rejected before an execution exists.  The rest occur mid-flight and are
/// either recoverable (the execution continues) or terminal (the execution
/// ends with `done{aborted:true}` unless noted otherwise).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("session {0} already has a running execution")]
    Busy(String),

    #[error("execution registry at capacity ({0} live)")]
    AtCapacity(usize),

    #[error("CLI exited without emitting a result: {0}")]
    CliFailed(String),

    #[error("persistent unparsable CLI output: {0}")]
    ProtocolError(String),

    #[error("CLI produced no event within the idle timeout")]
    Stalled,

    #[error("execution exceeded its time-to-live")]
    TimedOut,

    #[error("subscriber queue overflowed")]
    Lagged,

    #[error("sub-agent failed: {0}")]
    SubAgentFailure(String),

    #[error("compaction failed: {0}")]
    CompactionFailed(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl ErrorKind {
    /// True when the error moves the execution to a terminal state.
    ///
    /// `Lagged` is terminal only for the overflowing subscriber, not for the
    /// execution, so it reports `false` here.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ErrorKind::ProtocolError(_) | ErrorKind::Stalled | ErrorKind::TimedOut
        )
    }

    /// The value `done.aborted` carries when this error terminates a stream.
    pub fn aborted_flag(&self) -> bool {
        match self {
            // CLI died on its own; the stream ends normally with the error
            // surfaced beforehand.
            ErrorKind::CliFailed(_) => false,
            ErrorKind::ProtocolError(_)
            | ErrorKind::Stalled
            | ErrorKind::TimedOut
            | ErrorKind::Lagged => true,
            _ => false,
        }
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(e: std::io::Error) -> Self {
        ErrorKind::Io(e.to_string())
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification_matches_taxonomy() {
        assert!(ErrorKind::Stalled.is_terminal());
        assert!(ErrorKind::TimedOut.is_terminal());
        assert!(ErrorKind::ProtocolError("x".into()).is_terminal());
        assert!(!ErrorKind::CliFailed("x".into()).is_terminal());
        assert!(!ErrorKind::Lagged.is_terminal());
        assert!(!ErrorKind::SubAgentFailure("x".into()).is_terminal());
        assert!(!ErrorKind::Io("x".into()).is_terminal());
    }

    #[test]
    fn aborted_flag_matches_taxonomy() {
        assert!(!ErrorKind::CliFailed("x".into()).aborted_flag());
        assert!(ErrorKind::ProtocolError("x".into()).aborted_flag());
        assert!(ErrorKind::Stalled.aborted_flag());
        assert!(ErrorKind::TimedOut.aborted_flag());
        assert!(ErrorKind::Lagged.aborted_flag());
    }

    #[test]
    fn io_error_converts() {
        let e: ErrorKind = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert!(matches!(e, ErrorKind::Io(_)));
    }
}
