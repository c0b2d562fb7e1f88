//! Signing round messages

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::PartyId;

/// Round 0 message: start announcement with a pairwise encryption key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignHello {
    pub party_id: PartyId,
    pub enc_key: String,
}

/// Round 1 message: commitment to the nonce point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignRound1Message {
    /// Sender party ID
    pub party_id: PartyId,
    /// SHA-256 of the compressed K_i
    pub nonce_commitment: String,
}

/// Round 2 message: nonce point opening and sealed nonce shares
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignRound2Message {
    /// Sender party ID
    pub party_id: PartyId,
    /// K_i = k_i * G
    pub nonce_point: String,
    /// k_i sealed to each co-signer
    pub nonces: BTreeMap<PartyId, String>,
}

/// Round 3 message: partial signature
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignPartialMessage {
    /// Sender party ID
    pub party_id: PartyId,
    /// Sigma share
    pub sigma_share: String,
}
