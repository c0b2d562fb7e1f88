//! Round engine boundary
//!
//! The coordination layer never does threshold math itself. It hands the
//! previous round's messages to an [`Engine`] together with the opaque state
//! the engine returned last time, and gets back the next state plus either a
//! round message to broadcast or the final artifact.
//!
//! `process_round` takes only immutable inputs. Every random value a session
//! needs is drawn in `begin`, so re-running a round from the same state yields
//! the same output.

use std::collections::BTreeMap;
use std::fmt;

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use k256::{
    elliptic_curve::{
        bigint::U256,
        ops::Reduce,
        sec1::{FromEncodedPoint, ToEncodedPoint},
    },
    AffinePoint, ProjectivePoint, Scalar,
};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::types::{Artifact, KeyChain, PartyId, Role};
use crate::{keygen, sign, Error, Result};

/// Messages of one round, keyed by sender
pub type RoundInputs = BTreeMap<PartyId, Vec<u8>>;

/// Engine-owned secret state, opaque to the coordination layer
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct EngineState(Vec<u8>);

impl EngineState {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EngineState({} bytes)", self.0.len())
    }
}

/// Inputs for a key-generation session
pub struct KeyGenSetup {
    pub session_id: String,
    pub party_id: PartyId,
    pub m: usize,
    pub n: usize,
    /// Party seed; engine randomness for this session derives from it
    pub seed: Zeroizing<[u8; 32]>,
}

/// Inputs for a signing session
pub struct SignSetup {
    pub session_id: String,
    pub party_id: PartyId,
    pub m: usize,
    pub n: usize,
    pub key_chain: KeyChain,
    pub message_hash: [u8; 32],
    pub derivation_path: String,
}

pub enum EngineSetup {
    KeyGen(KeyGenSetup),
    Sign(SignSetup),
}

impl EngineSetup {
    pub fn role(&self) -> Role {
        match self {
            EngineSetup::KeyGen(_) => Role::KeyGen,
            EngineSetup::Sign(_) => Role::Sign,
        }
    }
}

/// Result of [`Engine::begin`]: initial state and the round-0 message
pub struct Begun {
    pub state: EngineState,
    pub message: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum RoundOutput {
    Message(Vec<u8>),
    Artifact(Artifact),
}

/// Result of [`Engine::process_round`]
#[derive(Debug, Clone)]
pub struct Processed {
    pub state: EngineState,
    pub output: RoundOutput,
}

/// Threshold protocol engine driven by the round state machine
pub trait Engine: Send + Sync {
    /// Prepare a session and produce this party's round-0 message
    fn begin(&self, setup: &EngineSetup) -> Result<Begun>;

    /// Consume the messages of round `round - 1` and advance
    fn process_round(
        &self,
        role: Role,
        round: u32,
        state: &EngineState,
        inputs: &RoundInputs,
    ) -> Result<Processed>;
}

/// Reference engine backing both roles
///
/// Produces verifiable secp256k1 keys and ECDSA signatures so that the
/// coordination layer can be exercised end to end. Signing reconstructs the
/// nonce among co-signers, so it offers no threshold security against them.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedEngine;

impl Engine for SimulatedEngine {
    fn begin(&self, setup: &EngineSetup) -> Result<Begun> {
        match setup {
            EngineSetup::KeyGen(setup) => keygen::dkg::begin(setup),
            EngineSetup::Sign(setup) => sign::dsg::begin(setup),
        }
    }

    fn process_round(
        &self,
        role: Role,
        round: u32,
        state: &EngineState,
        inputs: &RoundInputs,
    ) -> Result<Processed> {
        match role {
            Role::KeyGen => keygen::dkg::process_round(round, state, inputs),
            Role::Sign => sign::dsg::process_round(round, state, inputs),
        }
    }
}

pub(crate) fn encode_state<T: Serialize>(state: &T) -> Result<EngineState> {
    Ok(EngineState::new(serde_json::to_vec(state)?))
}

pub(crate) fn decode_state<T: DeserializeOwned>(state: &EngineState) -> Result<T> {
    serde_json::from_slice(state.as_bytes())
        .map_err(|e| Error::Engine(format!("corrupt engine state: {e}")))
}

/// Decode every input as a round message, checking the sender field
pub(crate) fn decode_inputs<T, F>(inputs: &RoundInputs, sender: F) -> Result<BTreeMap<PartyId, T>>
where
    T: DeserializeOwned,
    F: Fn(&T) -> PartyId,
{
    let mut out = BTreeMap::new();
    for (party_id, bytes) in inputs {
        let message: T = serde_json::from_slice(bytes)
            .map_err(|e| Error::Engine(format!("bad message from party {party_id}: {e}")))?;
        if sender(&message) != *party_id {
            return Err(Error::Engine(format!(
                "message posted by party {party_id} claims another sender"
            )));
        }
        out.insert(*party_id, message);
    }
    Ok(out)
}

pub(crate) fn scalar_to_hex(scalar: &Scalar) -> String {
    hex::encode(scalar.to_bytes())
}

pub(crate) fn scalar_from_hex(value: &str) -> Result<Scalar> {
    let bytes = Zeroizing::new(
        hex::decode(value).map_err(|e| Error::Deserialization(format!("scalar: {e}")))?,
    );
    scalar_from_bytes(&bytes)
}

pub(crate) fn scalar_from_bytes(bytes: &[u8]) -> Result<Scalar> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::Deserialization("Invalid scalar length".into()))?;
    Ok(<Scalar as Reduce<U256>>::reduce_bytes(&array.into()))
}

pub(crate) fn point_to_hex(point: &ProjectivePoint) -> String {
    hex::encode(point.to_affine().to_encoded_point(true).as_bytes())
}

pub(crate) fn point_from_hex(value: &str) -> Result<ProjectivePoint> {
    let bytes = hex::decode(value).map_err(|e| Error::Deserialization(format!("point: {e}")))?;
    let encoded = k256::EncodedPoint::from_bytes(&bytes)
        .map_err(|e| Error::VerificationFailed(e.to_string()))?;
    let affine = Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
        .ok_or_else(|| Error::VerificationFailed("Invalid curve point".into()))?;
    Ok(ProjectivePoint::from(affine))
}

/// Routing of a point-to-point payload inside a session
pub(crate) struct Channel<'a> {
    pub session_id: &'a str,
    pub round: u32,
    pub from: PartyId,
    pub to: PartyId,
}

impl Channel<'_> {
    fn cipher(&self, secret: &StaticSecret, peer: &X25519PublicKey) -> ChaCha20Poly1305 {
        let shared = secret.diffie_hellman(peer);
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(
            &Sha256::new()
                .chain_update(b"tss-pairwise")
                .chain_update(self.session_id.as_bytes())
                .chain_update(shared.as_bytes())
                .finalize(),
        );
        ChaCha20Poly1305::new(Key::from_slice(&key[..]))
    }

    fn nonce(&self) -> [u8; 12] {
        let digest = Sha256::new()
            .chain_update(self.round.to_be_bytes())
            .chain_update((self.from as u64).to_be_bytes())
            .chain_update((self.to as u64).to_be_bytes())
            .finalize();
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&digest[..12]);
        nonce
    }

    fn aad(&self) -> Vec<u8> {
        format!("{}:{}:{}:{}", self.session_id, self.round, self.from, self.to).into_bytes()
    }

    /// Encrypt `plaintext` from `secret`'s owner to `peer`
    pub fn seal(
        &self,
        secret: &StaticSecret,
        peer: &X25519PublicKey,
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        let aad = self.aad();
        self.cipher(secret, peer)
            .encrypt(
                Nonce::from_slice(&self.nonce()),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| Error::Crypto("pairwise encryption failed".into()))
    }

    pub fn open(
        &self,
        secret: &StaticSecret,
        peer: &X25519PublicKey,
        ciphertext: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        let aad = self.aad();
        self.cipher(secret, peer)
            .decrypt(
                Nonce::from_slice(&self.nonce()),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| {
                Error::VerificationFailed(format!(
                    "payload from party {} did not authenticate",
                    self.from
                ))
            })
    }
}

pub(crate) fn x25519_from_hex(value: &str) -> Result<X25519PublicKey> {
    let mut bytes = [0u8; 32];
    hex::decode_to_slice(value, &mut bytes)
        .map_err(|e| Error::Deserialization(format!("encryption key: {e}")))?;
    Ok(X25519PublicKey::from(bytes))
}
