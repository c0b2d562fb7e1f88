//! Deterministic session identifiers

use sha2::{Digest, Sha256};

/// Key-generation id: `hex(SHA256(SHA256(seed)))`
///
/// The initiator can recompute it from its own key material; nobody else can
/// guess it without that key.
pub fn keygen_session_id(seed: &[u8]) -> String {
    hex::encode(Sha256::digest(Sha256::digest(seed)))
}

/// Default signing id: `hex(SHA256(message_hash))`
///
/// With `message_hash = SHA256(message)` this is the double hash of the
/// message, so the id is bound to the message content rather than to the
/// digest the parties sign.
pub fn sign_session_id(message_hash: &[u8; 32]) -> String {
    hex::encode(Sha256::digest(message_hash))
}

pub fn message_hash(message: &[u8]) -> [u8; 32] {
    Sha256::digest(message).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_id_is_double_hash_of_message() {
        let message = b"Hello, world!";
        let hash = message_hash(message);
        assert_eq!(
            sign_session_id(&hash),
            hex::encode(Sha256::digest(Sha256::digest(message)))
        );
    }

    #[test]
    fn test_keygen_id_shape() {
        let id = keygen_session_id(&[9u8; 32]);
        assert_eq!(id.len(), 64);
        assert_eq!(id, keygen_session_id(&[9u8; 32]));
        assert_ne!(id, keygen_session_id(&[8u8; 32]));
    }
}
