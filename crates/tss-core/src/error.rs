//! Error types for threshold session coordination

use thiserror::Error;

use crate::envelope::EnvelopeError;

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while coordinating a key generation or signing session
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Invalid session or client configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid party ID
    #[error("Invalid party ID: {0}")]
    InvalidPartyId(usize),

    /// Join code failed to authenticate for this party
    #[error("Invalid checksum")]
    InvalidChecksum,

    /// The session's join password was missing or wrong
    #[error("TSS_INVALID_PASSWORD: invalid password")]
    InvalidPassword,

    /// The signing session already has `m` participants
    #[error("TSS_MAX_PARTICIPANTS_REACHED: max participants reached")]
    MaxParticipantsReached,

    /// The round (or the whole session) is already closed on the coordinator
    #[error("TSS_ROUND_ALREADY_DONE: round already done")]
    RoundAlreadyDone,

    /// Another participant holds the requested party slot
    #[error("TSS_PARTY_TAKEN: party {0} already joined")]
    PartyTaken(usize),

    /// A completed session has nothing left to export
    #[error("Cannot export a completed session")]
    SessionCompleted,

    /// Envelope could not be opened. The reason is kept for diagnostics only.
    #[error("Decryption failed")]
    Decryption(#[source] EnvelopeError),

    /// Network/transport fault
    #[error("Transport error: {0}")]
    Transport(String),

    /// Coordinator rejected a request with an unmapped status
    #[error("Coordinator error ({status} {code}): {message}")]
    Coordinator {
        status: u16,
        code: String,
        message: String,
    },

    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Message or artifact verification failed
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Key derivation error
    #[error("Key derivation error: {0}")]
    Derivation(String),

    /// The round engine rejected its inputs
    #[error("Engine error: {0}")]
    Engine(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Coordinator error code carried by protocol integrity errors
    pub fn code(&self) -> Option<&str> {
        match self {
            Error::InvalidChecksum => Some(crate::coordinator::codes::INVALID_CHECKSUM),
            Error::InvalidPassword => Some(crate::coordinator::codes::INVALID_PASSWORD),
            Error::MaxParticipantsReached => Some(crate::coordinator::codes::MAX_PARTICIPANTS_REACHED),
            Error::RoundAlreadyDone => Some(crate::coordinator::codes::ROUND_ALREADY_DONE),
            Error::PartyTaken(_) => Some(crate::coordinator::codes::PARTY_TAKEN),
            Error::Coordinator { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }

    /// Whether retrying the same request later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transport(_) => true,
            Error::Coordinator { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<EnvelopeError> for Error {
    fn from(e: EnvelopeError) -> Self {
        Error::Decryption(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_errors_carry_codes() {
        assert_eq!(Error::RoundAlreadyDone.code(), Some("TSS_ROUND_ALREADY_DONE"));
        assert_eq!(Error::InvalidPassword.code(), Some("TSS_INVALID_PASSWORD"));
        assert!(Error::RoundAlreadyDone.to_string().contains("TSS_ROUND_ALREADY_DONE"));
        assert_eq!(Error::InvalidChecksum.to_string(), "Invalid checksum");
        assert_eq!(Error::InvalidChecksum.code(), Some("TSS_INVALID_CHECKSUM"));
        assert_eq!(Error::SessionCompleted.code(), None);
    }

    #[test]
    fn test_decryption_errors_look_alike() {
        let wrong_key = Error::from(EnvelopeError::KeyMismatch);
        let corrupted = Error::from(EnvelopeError::Authentication);
        assert_eq!(wrong_key.to_string(), corrupted.to_string());
    }

    #[test]
    fn test_transient() {
        assert!(Error::Transport("reset".into()).is_transient());
        assert!(!Error::RoundAlreadyDone.is_transient());
        let upstream = Error::Coordinator {
            status: 502,
            code: "BAD_GATEWAY".into(),
            message: String::new(),
        };
        assert!(upstream.is_transient());
    }
}
