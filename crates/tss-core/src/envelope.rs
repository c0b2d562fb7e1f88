//! Authenticated public-key encryption over secp256k1
//!
//! Seals secret material (key share backups, join codes) so that only the
//! holder of the recipient key can read it, even though the coordinator
//! stores the ciphertext.
//!
//! Wire layout: `version || key_tag || ephemeral_pub || nonce || ciphertext`,
//! where `key_tag` is the first four bytes of SHA-256 over the recipient's
//! compressed public key and the AEAD binds the whole header.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use k256::{ecdh, elliptic_curve::sec1::ToEncodedPoint, PublicKey, SecretKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

const VERSION: u8 = 1;
const TAG_LEN: usize = 4;
const POINT_LEN: usize = 33;
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = 1 + TAG_LEN + POINT_LEN;
const MIN_LEN: usize = HEADER_LEN + NONCE_LEN + 16;

/// Why an envelope failed to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    /// Sealed for a different recipient key
    #[error("envelope addressed to another key")]
    KeyMismatch,
    /// Truncated or structurally invalid
    #[error("malformed envelope")]
    Malformed,
    /// Authentication tag did not verify
    #[error("envelope authentication failed")]
    Authentication,
}

/// Seal `plaintext` so only the owner of `recipient` can open it
pub fn seal(plaintext: &[u8], recipient: &PublicKey) -> crate::Result<Vec<u8>> {
    let ephemeral = ecdh::EphemeralSecret::random(&mut OsRng);
    let ephemeral_pub = compressed(&ephemeral.public_key());
    let recipient_pub = compressed(recipient);
    let shared = ephemeral.diffie_hellman(recipient);

    let mut out = Vec::with_capacity(MIN_LEN + plaintext.len());
    out.push(VERSION);
    out.extend_from_slice(&key_tag(recipient));
    out.extend_from_slice(&ephemeral_pub);

    let cipher = cipher_for(shared.raw_secret_bytes(), &ephemeral_pub, &recipient_pub);
    let nonce: [u8; NONCE_LEN] = rand::random();
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &out,
            },
        )
        .map_err(|_| crate::Error::Crypto("envelope encryption failed".into()))?;

    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open an envelope with this party's key pair
pub fn open(envelope: &[u8], secret: &SecretKey, public: &PublicKey) -> crate::Result<Vec<u8>> {
    open_raw(envelope, secret, public).map_err(crate::Error::from)
}

fn open_raw(
    envelope: &[u8],
    secret: &SecretKey,
    public: &PublicKey,
) -> std::result::Result<Vec<u8>, EnvelopeError> {
    if envelope.len() < MIN_LEN || envelope[0] != VERSION {
        return Err(EnvelopeError::Malformed);
    }
    if secret.public_key() != *public || envelope[1..1 + TAG_LEN] != key_tag(public) {
        return Err(EnvelopeError::KeyMismatch);
    }

    let (header, rest) = envelope.split_at(HEADER_LEN);
    let ephemeral_bytes = &header[1 + TAG_LEN..];
    let ephemeral =
        PublicKey::from_sec1_bytes(ephemeral_bytes).map_err(|_| EnvelopeError::Malformed)?;
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let shared = ecdh::diffie_hellman(secret.to_nonzero_scalar(), ephemeral.as_affine());
    let cipher = cipher_for(shared.raw_secret_bytes(), ephemeral_bytes, &compressed(public));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: header,
            },
        )
        .map_err(|_| EnvelopeError::Authentication)
}

/// Short identifier of the key an envelope is addressed to
pub fn key_tag(public: &PublicKey) -> [u8; TAG_LEN] {
    let digest = Sha256::digest(compressed(public));
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&digest[..TAG_LEN]);
    tag
}

fn cipher_for(shared_x: &[u8], ephemeral_pub: &[u8], recipient_pub: &[u8]) -> ChaCha20Poly1305 {
    let okm = Sha512::new()
        .chain_update(b"tss-envelope-v1")
        .chain_update(shared_x)
        .chain_update(ephemeral_pub)
        .chain_update(recipient_pub)
        .finalize();
    ChaCha20Poly1305::new(Key::from_slice(&okm[..32]))
}

fn compressed(public: &PublicKey) -> Vec<u8> {
    public.to_encoded_point(true).as_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> (SecretKey, PublicKey) {
        let secret = SecretKey::random(&mut OsRng);
        let public = secret.public_key();
        (secret, public)
    }

    #[test]
    fn test_seal_open() {
        let (secret, public) = keypair();
        let sealed = seal(b"share:0a0b", &public).unwrap();
        assert_eq!(open(&sealed, &secret, &public).unwrap(), b"share:0a0b");
    }

    #[test]
    fn test_sealing_is_salted() {
        let (_, public) = keypair();
        assert_ne!(seal(b"same", &public).unwrap(), seal(b"same", &public).unwrap());
    }

    #[test]
    fn test_wrong_key_is_key_mismatch() {
        let (_, public) = keypair();
        let (other_secret, other_public) = keypair();
        let sealed = seal(b"secret", &public).unwrap();

        assert_eq!(
            open_raw(&sealed, &other_secret, &other_public),
            Err(EnvelopeError::KeyMismatch)
        );
        assert!(matches!(
            open(&sealed, &other_secret, &other_public),
            Err(crate::Error::Decryption(_))
        ));
    }

    #[test]
    fn test_tampering_is_authentication_failure() {
        let (secret, public) = keypair();
        let mut sealed = seal(b"secret", &public).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        assert_eq!(
            open_raw(&sealed, &secret, &public),
            Err(EnvelopeError::Authentication)
        );
    }

    #[test]
    fn test_truncated_is_malformed() {
        let (secret, public) = keypair();
        let sealed = seal(b"secret", &public).unwrap();
        assert_eq!(
            open_raw(&sealed[..10], &secret, &public),
            Err(EnvelopeError::Malformed)
        );
    }
}
