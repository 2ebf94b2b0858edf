//! Typed session errors.
//!
//! The turn loop dispatches on these variants: a start timeout and an
//! over-long utterance are recovered within the session, everything
//! else terminates it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// The peer hung up or the inbound track ended.
    #[error("peer disconnected")]
    Disconnected,

    /// No speech began within `utterance_start_timeout`.
    #[error("timed out waiting for speech to start")]
    StartTimeout,

    /// A whole detection call exceeded `utterance_timeout`.
    #[error("utterance detection timed out")]
    DetectionTimeout,

    /// The user spoke past the per-turn cap.
    #[error("utterance exceeded {limit:.1} sec")]
    UtteranceTooLong { limit: f64 },

    /// Playback did not drain within `frame duration + 5 s`.
    #[error("playback did not drain within {timeout:.1} sec")]
    SendTimeout { timeout: f64 },

    /// The session reached a state only the user can reset.
    #[error("session reset required: {0}")]
    UserReset(String),

    /// An external collaborator (STT, LLM, TTS, …) failed or timed out.
    #[error("external service failure: {0}")]
    External(#[source] anyhow::Error),

    /// Anything else. Logged with its chain and surfaced as `internal`.
    #[error("unexpected failure: {0}")]
    Unexpected(#[source] anyhow::Error),
}

impl SessionError {
    pub fn external(err: impl Into<anyhow::Error>) -> Self {
        SessionError::External(err.into())
    }

    pub fn unexpected(err: impl Into<anyhow::Error>) -> Self {
        SessionError::Unexpected(err.into())
    }

    /// Whether the turn loop may continue after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SessionError::StartTimeout | SessionError::UtteranceTooLong { .. }
        )
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_variants() {
        assert!(SessionError::StartTimeout.is_recoverable());
        assert!(SessionError::UtteranceTooLong { limit: 20.0 }.is_recoverable());
        assert!(!SessionError::Disconnected.is_recoverable());
        assert!(!SessionError::SendTimeout { timeout: 6.0 }.is_recoverable());
        assert!(!SessionError::UserReset("x".into()).is_recoverable());
    }
}
