//! Key-generation round messages

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::PartyId;

/// Round 0 message: join announcement with a pairwise encryption key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyGenHello {
    pub party_id: PartyId,
    /// X25519 public key, hex
    pub enc_key: String,
}

/// Round 1 message: commitment to secret polynomial
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyGenRound1Message {
    /// Sender party ID
    pub party_id: PartyId,
    /// Commitments to polynomial coefficients (Feldman VSS)
    pub commitments: Vec<String>,
    /// SHA-256 of this party's chain code contribution
    pub chain_code_commitment: String,
}

/// Round 2 message: secret shares, one sealed payload per recipient
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyGenRound2Message {
    /// Sender party ID
    pub party_id: PartyId,
    /// Encrypted secret share keyed by receiver
    pub shares: BTreeMap<PartyId, String>,
}

/// Round 3 message: public share and chain code reveal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyGenRound3Message {
    /// Sender party ID
    pub party_id: PartyId,
    /// Public key share verification
    pub public_share: String,
    pub chain_code_seed: String,
}
