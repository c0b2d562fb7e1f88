//! Core types shared by key generation and signing sessions

use std::fmt;
use std::str::FromStr;

use k256::{ecdsa, elliptic_curve::sec1::ToEncodedPoint, PublicKey};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::hd::ExtendedPublicKey;
use crate::{Error, Result};

/// Index of a party within a session, in `[0, n)`
pub type PartyId = usize;

/// Number of engine rounds per session, for both roles
pub const ROUNDS: u32 = 4;

/// Which protocol a session runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    KeyGen,
    Sign,
}

impl Role {
    /// Coordinator path segment for this role
    pub fn path(&self) -> &'static str {
        match self {
            Role::KeyGen => "keygen",
            Role::Sign => "sign",
        }
    }

    /// Number of distinct parties whose messages make a round ready
    pub fn quorum(&self, m: usize, n: usize) -> usize {
        match self {
            Role::KeyGen => n,
            Role::Sign => m,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Active,
    Completed,
}

/// ECDSA signature (r, s) with recovery id and the signing public key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    /// R component, hex
    pub r: String,
    /// S component (low-s), hex
    pub s: String,
    /// Recovery ID (0 or 1)
    pub v: u8,
    /// Compressed public key at the signing derivation path, hex
    pub pub_key: String,
}

impl Signature {
    /// Build from a k256 signature and the key it verifies under
    pub fn from_ecdsa(signature: &ecdsa::Signature, v: u8, public_key: &PublicKey) -> Self {
        let (r, s) = signature.split_bytes();
        Self {
            r: hex::encode(r),
            s: hex::encode(s),
            v,
            pub_key: hex::encode(public_key.to_encoded_point(true).as_bytes()),
        }
    }

    /// Parse back into a k256 signature
    pub fn to_ecdsa(&self) -> Result<ecdsa::Signature> {
        let bytes = self.to_bytes()?;
        ecdsa::Signature::from_slice(&bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }

    /// Convert to DER format
    pub fn to_der(&self) -> Result<Vec<u8>> {
        Ok(self.to_ecdsa()?.to_der().as_bytes().to_vec())
    }

    /// Convert to bytes (r || s)
    pub fn to_bytes(&self) -> Result<[u8; 64]> {
        let mut bytes = [0u8; 64];
        hex::decode_to_slice(&self.r, &mut bytes[..32])
            .map_err(|e| Error::Deserialization(format!("signature r: {e}")))?;
        hex::decode_to_slice(&self.s, &mut bytes[32..])
            .map_err(|e| Error::Deserialization(format!("signature s: {e}")))?;
        Ok(bytes)
    }
}

/// Key chain held by a party after key generation
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct KeyChain {
    /// This party's secret share, hex
    pub private_key_share: String,

    /// Shared public key (33 bytes) followed by chain code (32 bytes), hex
    #[zeroize(skip)]
    pub common_key_chain: String,
}

impl fmt::Debug for KeyChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyChain")
            .field("common_key_chain", &self.common_key_chain)
            .finish_non_exhaustive()
    }
}

impl PartialEq for KeyChain {
    fn eq(&self, other: &Self) -> bool {
        self.common_key_chain == other.common_key_chain
            && self.private_key_share == other.private_key_share
    }
}

impl KeyChain {
    /// Root extended public key described by the common key chain
    pub fn root(&self) -> Result<ExtendedPublicKey> {
        ExtendedPublicKey::from_common_key_chain(&self.common_key_chain)
    }

    /// Shared public key (compressed)
    pub fn public_key(&self) -> Result<PublicKey> {
        Ok(self.root()?.public_key)
    }

    /// Public key at a non-hardened derivation path such as `m/0/0`
    pub fn derive_public_key(&self, path: &str) -> Result<PublicKey> {
        let (child, _) = self.root()?.derive_path(path)?;
        Ok(child.public_key)
    }
}

/// Final output of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum Artifact {
    KeyChain(KeyChain),
    Signature(Signature),
}

impl Artifact {
    pub fn key_chain(&self) -> Option<&KeyChain> {
        match self {
            Artifact::KeyChain(k) => Some(k),
            Artifact::Signature(_) => None,
        }
    }

    pub fn signature(&self) -> Option<&Signature> {
        match self {
            Artifact::Signature(s) => Some(s),
            Artifact::KeyChain(_) => None,
        }
    }
}

/// Chains with a known BIP44 coin type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Btc,
    Bch,
    Doge,
    Ltc,
    Eth,
    Matic,
    Arb,
    Base,
    Op,
    Xrp,
}

impl Chain {
    /// BIP44 coin type on mainnet
    pub fn coin_type(&self) -> u32 {
        match self {
            Chain::Btc => 0,
            Chain::Ltc => 2,
            Chain::Doge => 3,
            Chain::Eth | Chain::Matic | Chain::Arb | Chain::Base | Chain::Op => 60,
            Chain::Xrp => 144,
            Chain::Bch => 145,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Btc => "btc",
            Chain::Bch => "bch",
            Chain::Doge => "doge",
            Chain::Ltc => "ltc",
            Chain::Eth => "eth",
            Chain::Matic => "matic",
            Chain::Arb => "arb",
            Chain::Base => "base",
            Chain::Op => "op",
            Chain::Xrp => "xrp",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chain {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "btc" => Ok(Chain::Btc),
            "bch" => Ok(Chain::Bch),
            "doge" => Ok(Chain::Doge),
            "ltc" => Ok(Chain::Ltc),
            "eth" => Ok(Chain::Eth),
            "matic" => Ok(Chain::Matic),
            "arb" => Ok(Chain::Arb),
            "base" => Ok(Chain::Base),
            "op" => Ok(Chain::Op),
            "xrp" => Ok(Chain::Xrp),
            other => Err(Error::InvalidConfig(format!("Unsupported chain: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Livenet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn is_mainnet(&self) -> bool {
        matches!(self, Network::Livenet)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Livenet => "livenet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "livenet" | "mainnet" => Ok(Network::Livenet),
            "testnet" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(Error::InvalidConfig(format!("Unsupported network: {other}"))),
        }
    }
}

/// Session metadata recorded alongside a finished key chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMetadata {
    pub id: String,
    pub m: usize,
    pub n: usize,
    pub party_id: PartyId,
}

/// A party's threshold key: its key chain plus the session it came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TssKey {
    pub keychain: KeyChain,
    pub metadata: KeyMetadata,
    pub chain: Chain,
    pub network: Network,
}

impl TssKey {
    /// Base58check `xpub` of the common key chain
    pub fn xpub(&self, network: Network) -> Result<String> {
        Ok(self.keychain.root()?.to_base58(network))
    }
}
