//! Error types for the relay core.

use thiserror::Error;

/// Why an identity verifier refused a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthFailure {
    /// Token was signed with an algorithm outside the allow-list
    #[error("token signed with an untrusted algorithm")]
    UntrustedAlgorithm,

    /// Token `exp` claim is in the past
    #[error("token expired")]
    Expired,

    /// Token could not be parsed or its signature did not verify
    #[error("malformed token")]
    Malformed,

    /// Token subject does not resolve to a known user
    #[error("token subject does not match any user")]
    UnknownSubject,
}

/// Terminal failure of a connection attempt.
///
/// None of these leave anything behind in the registry, and none are retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// No `Authorization` cookie on the upgrade request
    #[error("missing credential")]
    MissingCredential,

    #[error("untrusted signing algorithm")]
    UntrustedAlgorithm,

    #[error("credential expired")]
    Expired,

    #[error("malformed credential")]
    Malformed,

    #[error("unknown subject")]
    UnknownSubject,

    /// Transport upgrade did not complete
    #[error("transport upgrade failed: {0}")]
    UpgradeFailed(String),
}

impl AdmissionError {
    /// Create a new upgrade failure.
    pub fn upgrade_failed(msg: impl Into<String>) -> Self {
        Self::UpgradeFailed(msg.into())
    }

    /// Stable machine-readable code for rejection bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingCredential => "missing_credential",
            Self::UntrustedAlgorithm => "untrusted_algorithm",
            Self::Expired => "token_expired",
            Self::Malformed => "malformed_token",
            Self::UnknownSubject => "unknown_subject",
            Self::UpgradeFailed(_) => "upgrade_failed",
        }
    }
}

impl From<AuthFailure> for AdmissionError {
    fn from(failure: AuthFailure) -> Self {
        match failure {
            AuthFailure::UntrustedAlgorithm => Self::UntrustedAlgorithm,
            AuthFailure::Expired => Self::Expired,
            AuthFailure::Malformed => Self::Malformed,
            AuthFailure::UnknownSubject => Self::UnknownSubject,
        }
    }
}

/// Failure to hand a frame to one recipient.
///
/// Local to the broadcaster: the recipient is dropped, the broadcast carries on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Recipient did not accept the frame within the send timeout
    #[error("send timed out")]
    Timeout,

    /// Recipient transport is closed
    #[error("connection closed")]
    Closed,
}

/// End of an active connection's receive loop.
///
/// Treated as normal termination, never surfaced as a fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReceiveError {
    /// Peer sent a close frame
    #[error("closed by peer")]
    Closed,

    /// Read failed at the transport layer
    #[error("transport error: {0}")]
    Transport(String),
}

impl ReceiveError {
    /// Create a new transport read error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failure_maps_to_admission_error() {
        assert_eq!(
            AdmissionError::from(AuthFailure::UntrustedAlgorithm),
            AdmissionError::UntrustedAlgorithm
        );
        assert_eq!(AdmissionError::from(AuthFailure::Expired), AdmissionError::Expired);
        assert_eq!(AdmissionError::from(AuthFailure::Malformed), AdmissionError::Malformed);
        assert_eq!(
            AdmissionError::from(AuthFailure::UnknownSubject),
            AdmissionError::UnknownSubject
        );
    }

    #[test]
    fn test_admission_error_codes() {
        assert_eq!(AdmissionError::MissingCredential.code(), "missing_credential");
        assert_eq!(AdmissionError::Expired.code(), "token_expired");
        assert_eq!(
            AdmissionError::upgrade_failed("handshake").code(),
            "upgrade_failed"
        );
    }

    #[test]
    fn test_upgrade_failed_display() {
        let err = AdmissionError::upgrade_failed("missing Sec-WebSocket-Key");
        assert_eq!(
            err.to_string(),
            "transport upgrade failed: missing Sec-WebSocket-Key"
        );
    }
}
