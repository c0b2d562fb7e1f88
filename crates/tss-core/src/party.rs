//! A party's own key material
//!
//! Everything a party needs locally is derived from one BIP32 master key:
//! the per-chain account key (key-generation seed and share backup key) and
//! an auth key whose public half is handed to initiators so they can seal
//! join codes to it.

use k256::{elliptic_curve::sec1::ToEncodedPoint, PublicKey, SecretKey};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::hd::{derivation_path_for, ExtendedPrivateKey};
use crate::types::{Chain, Network};
use crate::Result;

/// Path of the auth key below the master key
pub const AUTH_KEY_PATH: &str = "m/1'/0";

/// A party's master key and the auth key derived from it
#[derive(Clone)]
pub struct PartyKey {
    master: ExtendedPrivateKey,
    auth: ExtendedPrivateKey,
}

impl PartyKey {
    pub fn from_seed(seed: &[u8]) -> Result<Self> {
        Self::from_master(ExtendedPrivateKey::from_seed(seed)?)
    }

    pub fn from_master(master: ExtendedPrivateKey) -> Result<Self> {
        let auth = master.derive_path(AUTH_KEY_PATH)?;
        Ok(Self { master, auth })
    }

    /// Fresh 32-byte seed from the OS RNG
    pub fn random_seed() -> Zeroizing<[u8; 32]> {
        let mut seed = Zeroizing::new([0u8; 32]);
        rand::rngs::OsRng.fill_bytes(&mut seed[..]);
        seed
    }

    pub fn master(&self) -> &ExtendedPrivateKey {
        &self.master
    }

    /// Account key at `derivation_path_for(chain, network)`
    pub fn chain_key(&self, chain: Chain, network: Network) -> Result<ExtendedPrivateKey> {
        self.master.derive_path(&derivation_path_for(chain, network))
    }

    /// Seed for key generation: SHA-256 of the 78-byte chain key
    pub fn keygen_seed(&self, chain: Chain, network: Network) -> Result<Zeroizing<[u8; 32]>> {
        let chain_key = self.chain_key(chain, network)?;
        let serialized = chain_key.to_bytes(network);
        let mut seed = Zeroizing::new([0u8; 32]);
        seed.copy_from_slice(&Sha256::digest(&serialized[..]));
        Ok(seed)
    }

    /// Public key that encrypted share backups are sealed to
    pub fn backup_public_key(&self, chain: Chain, network: Network) -> Result<PublicKey> {
        Ok(self.chain_key(chain, network)?.public_key())
    }

    pub fn auth_secret_key(&self) -> &SecretKey {
        &self.auth.secret_key
    }

    /// Public key invitees share with the initiator to receive a join code
    pub fn auth_public_key(&self) -> PublicKey {
        self.auth.public_key()
    }

    /// Stable identifier the coordinator stores in this party's slot
    pub fn participant_id(&self) -> String {
        let encoded = self.auth_public_key().to_encoded_point(true);
        hex::encode(Sha256::digest(encoded.as_bytes()))
    }
}

impl std::fmt::Debug for PartyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartyKey")
            .field("participant_id", &self.participant_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_deterministic() {
        let a = PartyKey::from_seed(&[1u8; 32]).unwrap();
        let b = PartyKey::from_seed(&[1u8; 32]).unwrap();
        let c = PartyKey::from_seed(&[2u8; 32]).unwrap();

        assert_eq!(a.participant_id(), b.participant_id());
        assert_ne!(a.participant_id(), c.participant_id());
        assert_eq!(
            *a.keygen_seed(Chain::Btc, Network::Livenet).unwrap(),
            *b.keygen_seed(Chain::Btc, Network::Livenet).unwrap()
        );
    }

    #[test]
    fn test_seed_depends_on_chain_and_network() {
        let key = PartyKey::from_seed(&[3u8; 32]).unwrap();
        let btc = key.keygen_seed(Chain::Btc, Network::Livenet).unwrap();
        let eth = key.keygen_seed(Chain::Eth, Network::Livenet).unwrap();
        let tbtc = key.keygen_seed(Chain::Btc, Network::Testnet).unwrap();
        assert_ne!(*btc, *eth);
        assert_ne!(*btc, *tbtc);
    }

    #[test]
    fn test_auth_key_differs_from_backup_key() {
        let key = PartyKey::from_seed(&[4u8; 32]).unwrap();
        let backup = key.backup_public_key(Chain::Btc, Network::Livenet).unwrap();
        assert_ne!(backup, key.auth_public_key());
        assert_eq!(key.auth_secret_key().public_key(), key.auth_public_key());
    }

    #[test]
    fn test_debug_hides_keys() {
        let key = PartyKey::from_seed(&[5u8; 32]).unwrap();
        let debug = format!("{key:?}");
        assert!(debug.contains(&key.participant_id()));
        assert!(!debug.contains(&hex::encode(key.auth_secret_key().to_bytes())));
    }
}
