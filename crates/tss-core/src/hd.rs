//! BIP32 hierarchical deterministic keys
//!
//! Only what a coordination client needs: the party's own extended private
//! key (to obtain per-chain seeds, the auth key and the backup key) and
//! non-hardened public derivation over the common key chain produced by key
//! generation.

use std::str::FromStr;

use derivation_path::{ChildIndex, DerivationPath};
use hmac::{Hmac, Mac};
use k256::{
    elliptic_curve::{sec1::ToEncodedPoint, PrimeField},
    FieldBytes, NonZeroScalar, ProjectivePoint, PublicKey, Scalar, SecretKey,
};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

use crate::types::{Chain, Network};
use crate::{Error, Result};

type HmacSha512 = Hmac<Sha512>;

const HARDENED: u32 = 0x8000_0000;

const XPRV_MAINNET: [u8; 4] = [0x04, 0x88, 0xAD, 0xE4];
const XPRV_TESTNET: [u8; 4] = [0x04, 0x35, 0x83, 0x94];
const XPUB_MAINNET: [u8; 4] = [0x04, 0x88, 0xB2, 0x1E];
const XPUB_TESTNET: [u8; 4] = [0x04, 0x35, 0x87, 0xCF];

/// Account path for a chain: `m/44'/{coin}'/0'`, coin 1 off mainnet
pub fn derivation_path_for(chain: Chain, network: Network) -> String {
    let coin = if network.is_mainnet() {
        chain.coin_type()
    } else {
        1
    };
    format!("m/44'/{coin}'/0'")
}

/// Extended private key
#[derive(Clone)]
pub struct ExtendedPrivateKey {
    pub secret_key: SecretKey,
    pub chain_code: [u8; 32],
    pub depth: u8,
    pub parent_fingerprint: [u8; 4],
    pub child_number: u32,
}

impl ExtendedPrivateKey {
    /// Master key from a BIP32 seed
    pub fn from_seed(seed: &[u8]) -> Result<Self> {
        let mut mac = HmacSha512::new_from_slice(b"Bitcoin seed")
            .map_err(|e| Error::Derivation(e.to_string()))?;
        mac.update(seed);
        let digest = finalize(mac);

        let secret_key = SecretKey::from_slice(&digest[..32])
            .map_err(|_| Error::Derivation("Seed yields an invalid master key".into()))?;
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&digest[32..]);

        Ok(Self {
            secret_key,
            chain_code,
            depth: 0,
            parent_fingerprint: [0; 4],
            child_number: 0,
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.secret_key.public_key()
    }

    pub fn to_extended_public(&self) -> ExtendedPublicKey {
        ExtendedPublicKey {
            public_key: self.public_key(),
            chain_code: self.chain_code,
            depth: self.depth,
            parent_fingerprint: self.parent_fingerprint,
            child_number: self.child_number,
        }
    }

    /// Derive one child; `index` carries the hardened bit
    pub fn derive_child(&self, index: u32) -> Result<Self> {
        let mut mac = HmacSha512::new_from_slice(&self.chain_code)
            .map_err(|e| Error::Derivation(e.to_string()))?;
        if index & HARDENED != 0 {
            mac.update(&[0u8]);
            mac.update(&self.secret_key.to_bytes());
        } else {
            mac.update(&compressed(&self.public_key()));
        }
        mac.update(&index.to_be_bytes());
        let digest = finalize(mac);

        let tweak = parse_tweak(&digest[..32])?;
        let child = tweak + *self.secret_key.to_nonzero_scalar();
        let child = Option::<NonZeroScalar>::from(NonZeroScalar::new(child))
            .ok_or_else(|| Error::Derivation(format!("Child {index} is invalid")))?;

        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&digest[32..]);

        Ok(Self {
            secret_key: SecretKey::from(child),
            chain_code,
            depth: self.depth.saturating_add(1),
            parent_fingerprint: fingerprint(&self.public_key()),
            child_number: index,
        })
    }

    /// Derive along a path such as `m/44'/0'/0'`
    pub fn derive_path(&self, path: &str) -> Result<Self> {
        parse_path(path)?
            .into_iter()
            .try_fold(self.clone(), |key, index| key.derive_child(index))
    }

    /// 78-byte BIP32 serialization
    pub fn to_bytes(&self, network: Network) -> Zeroizing<[u8; 78]> {
        let version = if network.is_mainnet() {
            XPRV_MAINNET
        } else {
            XPRV_TESTNET
        };
        let mut key = [0u8; 33];
        key[1..].copy_from_slice(&self.secret_key.to_bytes());
        let out = serialize(
            version,
            self.depth,
            self.parent_fingerprint,
            self.child_number,
            &self.chain_code,
            &key,
        );
        key.fill(0);
        out
    }
}

/// Extended public key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedPublicKey {
    pub public_key: PublicKey,
    pub chain_code: [u8; 32],
    pub depth: u8,
    pub parent_fingerprint: [u8; 4],
    pub child_number: u32,
}

impl ExtendedPublicKey {
    /// Root key from a hex common key chain (`pubkey33 || chaincode32`)
    pub fn from_common_key_chain(common_key_chain: &str) -> Result<Self> {
        let bytes = hex::decode(common_key_chain)
            .map_err(|e| Error::Deserialization(format!("common key chain: {e}")))?;
        if bytes.len() != 65 {
            return Err(Error::Deserialization(format!(
                "common key chain must be 65 bytes, got {}",
                bytes.len()
            )));
        }
        let public_key = PublicKey::from_sec1_bytes(&bytes[..33])
            .map_err(|_| Error::Deserialization("common key chain: invalid public key".into()))?;
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&bytes[33..]);

        Ok(Self {
            public_key,
            chain_code,
            depth: 0,
            parent_fingerprint: [0; 4],
            child_number: 0,
        })
    }

    /// Hex `pubkey33 || chaincode32`
    pub fn to_common_key_chain(&self) -> String {
        let mut bytes = compressed(&self.public_key);
        bytes.extend_from_slice(&self.chain_code);
        hex::encode(bytes)
    }

    /// Derive one non-hardened child, returning it with the scalar tweak applied
    pub fn derive_child(&self, index: u32) -> Result<(Self, Scalar)> {
        if index & HARDENED != 0 {
            return Err(Error::Derivation(
                "Hardened derivation needs the private key".into(),
            ));
        }

        let mut mac = HmacSha512::new_from_slice(&self.chain_code)
            .map_err(|e| Error::Derivation(e.to_string()))?;
        mac.update(&compressed(&self.public_key));
        mac.update(&index.to_be_bytes());
        let digest = mac.finalize().into_bytes();

        let tweak = parse_tweak(&digest[..32])?;
        let point = ProjectivePoint::GENERATOR * tweak + self.public_key.to_projective();
        let public_key = PublicKey::from_affine(point.to_affine())
            .map_err(|_| Error::Derivation(format!("Child {index} is the identity")))?;

        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&digest[32..]);

        let child = Self {
            public_key,
            chain_code,
            depth: self.depth.saturating_add(1),
            parent_fingerprint: fingerprint(&self.public_key),
            child_number: index,
        };
        Ok((child, tweak))
    }

    /// Derive along a non-hardened path, returning the accumulated tweak
    pub fn derive_path(&self, path: &str) -> Result<(Self, Scalar)> {
        parse_path(path)?.into_iter().try_fold(
            (self.clone(), Scalar::ZERO),
            |(key, total), index| {
                let (child, tweak) = key.derive_child(index)?;
                Ok((child, total + tweak))
            },
        )
    }

    /// Base58check `xpub` / `tpub`
    pub fn to_base58(&self, network: Network) -> String {
        let version = if network.is_mainnet() {
            XPUB_MAINNET
        } else {
            XPUB_TESTNET
        };
        let mut key = [0u8; 33];
        key.copy_from_slice(&compressed(&self.public_key));
        let bytes = serialize(
            version,
            self.depth,
            self.parent_fingerprint,
            self.child_number,
            &self.chain_code,
            &key,
        );
        bs58::encode(&bytes[..]).with_check().into_string()
    }
}

/// Parse a BIP32 path into raw child numbers
pub fn parse_path(path: &str) -> Result<Vec<u32>> {
    let parsed = DerivationPath::from_str(path)
        .map_err(|e| Error::Derivation(format!("Invalid path {path}: {e:?}")))?;
    Ok(parsed
        .path()
        .iter()
        .map(|index| match index {
            ChildIndex::Normal(i) => *i,
            ChildIndex::Hardened(i) => *i | HARDENED,
        })
        .collect())
}

fn finalize(mac: HmacSha512) -> Zeroizing<[u8; 64]> {
    let mut out = Zeroizing::new([0u8; 64]);
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

fn parse_tweak(bytes: &[u8]) -> Result<Scalar> {
    Option::<Scalar>::from(Scalar::from_repr(*FieldBytes::from_slice(bytes)))
        .ok_or_else(|| Error::Derivation("Derived tweak out of range".into()))
}

fn compressed(public_key: &PublicKey) -> Vec<u8> {
    public_key.to_encoded_point(true).as_bytes().to_vec()
}

fn fingerprint(public_key: &PublicKey) -> [u8; 4] {
    let hash = Ripemd160::digest(Sha256::digest(compressed(public_key)));
    let mut out = [0u8; 4];
    out.copy_from_slice(&hash[..4]);
    out
}

fn serialize(
    version: [u8; 4],
    depth: u8,
    parent_fingerprint: [u8; 4],
    child_number: u32,
    chain_code: &[u8; 32],
    key: &[u8; 33],
) -> Zeroizing<[u8; 78]> {
    let mut out = Zeroizing::new([0u8; 78]);
    out[..4].copy_from_slice(&version);
    out[4] = depth;
    out[5..9].copy_from_slice(&parent_fingerprint);
    out[9..13].copy_from_slice(&child_number.to_be_bytes());
    out[13..45].copy_from_slice(chain_code);
    out[45..].copy_from_slice(key);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // BIP32 test vector 1
    const SEED: &str = "000102030405060708090a0b0c0d0e0f";

    fn master() -> ExtendedPrivateKey {
        ExtendedPrivateKey::from_seed(&hex::decode(SEED).unwrap()).unwrap()
    }

    #[test]
    fn test_master_matches_vector() {
        let xpub = master().to_extended_public().to_base58(Network::Livenet);
        assert_eq!(
            xpub,
            "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8"
        );
    }

    #[test]
    fn test_hardened_then_normal_matches_vector() {
        let child = master().derive_path("m/0'/1").unwrap();
        assert_eq!(
            child.to_extended_public().to_base58(Network::Livenet),
            "xpub6ASuArnXKPbfEwhqN6e3mwBcDTgzisQN1wXN9BJcM47sSikHjJf3UFHKkNAWbWMiGj7Wf5uMash7SyYq527Hqck2AxYysAA7xmALppuCkwQ"
        );
    }

    #[test]
    fn test_public_derivation_matches_private() {
        let account = master().derive_path("m/44'/0'/0'").unwrap();
        let xpub = account.to_extended_public();

        let (child_pub, tweak) = xpub.derive_path("m/0/5").unwrap();
        let child_prv = account.derive_path("m/0/5").unwrap();

        assert_eq!(child_pub.public_key, child_prv.public_key());
        let expected = *account.secret_key.to_nonzero_scalar() + tweak;
        assert_eq!(expected, *child_prv.secret_key.to_nonzero_scalar());
    }

    #[test]
    fn test_public_derivation_rejects_hardened() {
        let xpub = master().to_extended_public();
        assert!(matches!(xpub.derive_path("m/0'"), Err(Error::Derivation(_))));
    }

    #[test]
    fn test_common_key_chain_roundtrip() {
        let xpub = master().to_extended_public();
        let encoded = xpub.to_common_key_chain();
        assert_eq!(encoded.len(), 130);
        assert_eq!(ExtendedPublicKey::from_common_key_chain(&encoded).unwrap(), xpub);
        assert!(ExtendedPublicKey::from_common_key_chain("02ab").is_err());
    }

    #[test]
    fn test_derivation_path_for() {
        assert_eq!(derivation_path_for(Chain::Btc, Network::Livenet), "m/44'/0'/0'");
        assert_eq!(derivation_path_for(Chain::Eth, Network::Livenet), "m/44'/60'/0'");
        assert_eq!(derivation_path_for(Chain::Eth, Network::Testnet), "m/44'/1'/0'");
    }

    #[test]
    fn test_xprv_serialization_layout() {
        let bytes = master().derive_child(HARDENED).unwrap().to_bytes(Network::Livenet);
        assert_eq!(&bytes[..4], &XPRV_MAINNET);
        assert_eq!(bytes[4], 1);
        assert_eq!(&bytes[9..13], &HARDENED.to_be_bytes());
        assert_eq!(bytes[45], 0);
    }
}
