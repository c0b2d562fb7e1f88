//! Join-code codec
//!
//! A join code is a sealed invitation: the session routing data and the
//! invitee's party id, followed by a 4-byte checksum, sealed to the invitee's
//! auth public key. Decoding fails with [`Error::InvalidChecksum`] for any
//! problem (wrong recipient, tampering, bad checksum, wrong embedded key) so
//! no network call happens with a bad code.
//!
//! The payload also carries an invitation: the initiator's signature over the
//! session id and the invited party id. The coordinator checks it against the
//! invite key registered at creation before it fills the slot.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature as EcdsaSignature, SigningKey, VerifyingKey};
use k256::{elliptic_curve::sec1::ToEncodedPoint, PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::envelope;
use crate::party::PartyKey;
use crate::types::{Chain, Network, PartyId};
use crate::{Error, Result};

const CHECKSUM_LEN: usize = 4;

/// Text encoding of a join code
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinCodeEncoding {
    #[default]
    Hex,
    Base64,
}

#[derive(Debug, Clone, Default)]
pub struct JoinCodeOptions {
    pub encoding: JoinCodeEncoding,
}

/// Decoded contents of a join code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub id: String,
    pub party_id: PartyId,
    pub chain: Chain,
    pub network: Network,
    pub m: usize,
    pub n: usize,
    /// Invitee auth public key, compressed hex
    pub party_pub_key: String,
    /// Initiator signature binding this party id to the session, hex
    pub invitation: String,
    /// Free-form payload, usually the session password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
}

/// Seal `payload` to `recipient` and render it
pub fn encode(
    payload: &JoinPayload,
    recipient: &PublicKey,
    encoding: JoinCodeEncoding,
) -> Result<String> {
    let mut plaintext = serde_json::to_vec(payload)?;
    let sum = checksum(&plaintext);
    plaintext.extend_from_slice(&sum);

    let sealed = envelope::seal(&plaintext, recipient)?;
    Ok(match encoding {
        JoinCodeEncoding::Hex => hex::encode(sealed),
        JoinCodeEncoding::Base64 => STANDARD.encode(sealed),
    })
}

/// Open and validate a code addressed to `key`
pub fn decode(code: &str, encoding: JoinCodeEncoding, key: &PartyKey) -> Result<JoinPayload> {
    let sealed = match encoding {
        JoinCodeEncoding::Hex => hex::decode(code.trim()).map_err(|_| Error::InvalidChecksum)?,
        JoinCodeEncoding::Base64 => STANDARD
            .decode(code.trim())
            .map_err(|_| Error::InvalidChecksum)?,
    };

    let own_public = key.auth_public_key();
    let plaintext = envelope::open(&sealed, key.auth_secret_key(), &own_public)
        .map_err(|_| Error::InvalidChecksum)?;
    if plaintext.len() <= CHECKSUM_LEN {
        return Err(Error::InvalidChecksum);
    }

    let (body, sum) = plaintext.split_at(plaintext.len() - CHECKSUM_LEN);
    if !bool::from(checksum(body)[..].ct_eq(sum)) {
        return Err(Error::InvalidChecksum);
    }

    let payload: JoinPayload = serde_json::from_slice(body).map_err(|_| Error::InvalidChecksum)?;
    if payload.party_pub_key != encode_key(&own_public) || payload.party_id >= payload.n {
        return Err(Error::InvalidChecksum);
    }
    Ok(payload)
}

const INVITATION_DOMAIN: &[u8] = b"tss-join-invitation";

fn invitation_message(id: &str, party_id: PartyId) -> Vec<u8> {
    let mut message = INVITATION_DOMAIN.to_vec();
    message.extend_from_slice(id.as_bytes());
    message.extend_from_slice(&(party_id as u64).to_be_bytes());
    message
}

/// Sign the invitation of `party_id` into session `id`
pub fn sign_invitation(key: &SecretKey, id: &str, party_id: PartyId) -> String {
    let signature: EcdsaSignature = SigningKey::from(key).sign(&invitation_message(id, party_id));
    hex::encode(signature.to_bytes())
}

/// Check an invitation against the initiator's compressed hex invite key
pub fn verify_invitation(invite_key: &str, id: &str, party_id: PartyId, invitation: &str) -> bool {
    let (Ok(key), Ok(signature)) = (hex::decode(invite_key), hex::decode(invitation)) else {
        return false;
    };
    let (Ok(key), Ok(signature)) = (
        VerifyingKey::from_sec1_bytes(&key),
        EcdsaSignature::from_slice(&signature),
    ) else {
        return false;
    };
    key.verify(&invitation_message(id, party_id), &signature).is_ok()
}

/// Compressed hex form of a public key
pub fn encode_key(key: &PublicKey) -> String {
    hex::encode(key.to_encoded_point(true).as_bytes())
}

fn checksum(body: &[u8]) -> [u8; CHECKSUM_LEN] {
    let digest = Sha256::digest(Sha256::digest(body));
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&digest[..CHECKSUM_LEN]);
    out
}
