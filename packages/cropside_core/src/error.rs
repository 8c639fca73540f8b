//! Error types for the coordination core.
//!
//! Registry errors surface synchronously to the calling operation; signaling
//! errors degrade to fallback options rather than tearing the session down.
//! Per-recipient delivery failures are not errors at all; they are logged
//! and counted by the broadcast engine.

use thiserror::Error;

/// Errors raised by [`crate::registry::SessionRegistry`] operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("session {0} already exists")]
    DuplicateSession(String),

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("session {0} is closed")]
    SessionClosed(String),

    #[error("recommendation {id} already recorded in session {session_id}")]
    DuplicateRecommendation { session_id: String, id: String },
}

impl RegistryError {
    /// Stable machine-readable code carried in wire error frames.
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::DuplicateSession(_) => "duplicate-session",
            RegistryError::SessionNotFound(_) => "session-not-found",
            RegistryError::SessionClosed(_) => "session-closed",
            RegistryError::DuplicateRecommendation { .. } => "duplicate-recommendation",
        }
    }
}

/// Errors raised by [`crate::signaling::SignalingCoordinator`] operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    /// Sender or target is not a current participant of an Active session.
    #[error("peer {user_id} unavailable in session {session_id}")]
    PeerUnavailable {
        session_id: String,
        user_id: String,
    },

    #[error("negotiation with {peer} timed out after {timeout_secs}s")]
    NegotiationTimeout { peer: String, timeout_secs: u64 },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl SignalingError {
    pub fn code(&self) -> &'static str {
        match self {
            SignalingError::PeerUnavailable { .. } => "peer-unavailable",
            SignalingError::NegotiationTimeout { .. } => "negotiation-timeout",
            SignalingError::Registry(e) => e.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_error_codes_are_stable() {
        assert_eq!(
            RegistryError::DuplicateSession("s".into()).code(),
            "duplicate-session"
        );
        assert_eq!(
            RegistryError::SessionNotFound("s".into()).code(),
            "session-not-found"
        );
        assert_eq!(
            RegistryError::SessionClosed("s".into()).code(),
            "session-closed"
        );
    }

    #[test]
    fn signaling_error_wraps_registry_code() {
        let err = SignalingError::from(RegistryError::SessionClosed("s".into()));
        assert_eq!(err.code(), "session-closed");
    }
}
