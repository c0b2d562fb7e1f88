//! Simulated signing rounds
//!
//! Co-signers commit to nonce points, open them together with the nonce
//! itself sealed to each other, then each contributes
//! `s_i = k^-1 * r * lambda_i * x_i`. The lowest signer also carries the HD
//! tweak and the message term, so the partials sum to a plain ECDSA `s` for
//! the child key at the requested path.

use std::collections::BTreeMap;

use k256::{
    ecdsa::{self, signature::hazmat::PrehashVerifier, RecoveryId, VerifyingKey},
    elliptic_curve::{bigint::U256, ops::Reduce, point::AffineCoordinates, Field},
    NonZeroScalar, ProjectivePoint, PublicKey, Scalar,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::{SignHello, SignPartialMessage, SignRound1Message, SignRound2Message};
use crate::engine::{
    decode_inputs, decode_state, encode_state, point_from_hex, point_to_hex, scalar_from_bytes,
    scalar_from_hex, scalar_to_hex, x25519_from_hex, Begun, Channel, EngineState, Processed,
    RoundInputs, RoundOutput, SignSetup,
};
use crate::hd::ExtendedPublicKey;
use crate::types::{Artifact, Signature};
use crate::{Error, PartyId, Result};

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct SignState {
    #[zeroize(skip)]
    session_id: String,
    #[zeroize(skip)]
    party_id: PartyId,
    #[zeroize(skip)]
    m: usize,
    #[zeroize(skip)]
    n: usize,
    key_share: String,
    #[zeroize(skip)]
    common_key_chain: String,
    #[zeroize(skip)]
    message_hash: String,
    #[zeroize(skip)]
    derivation_path: String,
    nonce: String,
    enc_secret: String,
    #[serde(default)]
    #[zeroize(skip)]
    signers: Vec<PartyId>,
    #[serde(default)]
    #[zeroize(skip)]
    enc_keys: BTreeMap<PartyId, String>,
    #[serde(default)]
    #[zeroize(skip)]
    nonce_commitments: BTreeMap<PartyId, String>,
    #[serde(default)]
    #[zeroize(skip)]
    r_point: Option<String>,
}

impl SignState {
    fn enc_secret(&self) -> Result<StaticSecret> {
        let mut bytes = Zeroizing::new([0u8; 32]);
        hex::decode_to_slice(&self.enc_secret, bytes.as_mut_slice())
            .map_err(|e| Error::Engine(format!("corrupt encryption key: {e}")))?;
        Ok(StaticSecret::from(*bytes))
    }

    fn peer_key(&self, party_id: PartyId) -> Result<X25519PublicKey> {
        let key = self
            .enc_keys
            .get(&party_id)
            .ok_or_else(|| Error::Engine(format!("no encryption key for party {party_id}")))?;
        x25519_from_hex(key)
    }

    fn message_hash(&self) -> Result<[u8; 32]> {
        let mut hash = [0u8; 32];
        hex::decode_to_slice(&self.message_hash, &mut hash)
            .map_err(|e| Error::Engine(format!("corrupt message hash: {e}")))?;
        Ok(hash)
    }

    /// Child public key at the signing path and the tweak leading to it
    fn child_key(&self) -> Result<(ExtendedPublicKey, Scalar)> {
        ExtendedPublicKey::from_common_key_chain(&self.common_key_chain)?
            .derive_path(&self.derivation_path)
    }

    fn is_leader(&self) -> bool {
        self.signers.first() == Some(&self.party_id)
    }
}

/// Draw this party's nonce and encryption key
pub(crate) fn begin(setup: &SignSetup) -> Result<Begun> {
    if setup.m == 0 || setup.m > setup.n {
        return Err(Error::InvalidConfig(format!(
            "threshold {} out of range for {} parties",
            setup.m, setup.n
        )));
    }
    if setup.party_id >= setup.n {
        return Err(Error::InvalidPartyId(setup.party_id));
    }
    // fail on a bad key chain or path before anything is posted
    ExtendedPublicKey::from_common_key_chain(&setup.key_chain.common_key_chain)?
        .derive_path(&setup.derivation_path)?;
    scalar_from_hex(&setup.key_chain.private_key_share)?;

    let nonce = NonZeroScalar::random(&mut OsRng);
    let enc_secret = StaticSecret::random_from_rng(OsRng);

    let hello = SignHello {
        party_id: setup.party_id,
        enc_key: hex::encode(X25519PublicKey::from(&enc_secret).as_bytes()),
    };

    let state = SignState {
        session_id: setup.session_id.clone(),
        party_id: setup.party_id,
        m: setup.m,
        n: setup.n,
        key_share: setup.key_chain.private_key_share.clone(),
        common_key_chain: setup.key_chain.common_key_chain.clone(),
        message_hash: hex::encode(setup.message_hash),
        derivation_path: setup.derivation_path.clone(),
        nonce: scalar_to_hex(&nonce),
        enc_secret: hex::encode(enc_secret.to_bytes()),
        signers: Vec::new(),
        enc_keys: BTreeMap::new(),
        nonce_commitments: BTreeMap::new(),
        r_point: None,
    };

    Ok(Begun {
        state: encode_state(&state)?,
        message: serde_json::to_vec(&hello)?,
    })
}

#[instrument(skip(state, inputs))]
pub(crate) fn process_round(
    round: u32,
    state: &EngineState,
    inputs: &RoundInputs,
) -> Result<Processed> {
    let mut state: SignState = decode_state(state)?;
    if inputs.len() != state.m || inputs.keys().any(|id| *id >= state.n) {
        return Err(Error::Engine(format!(
            "round {round} needs messages from {} signers, got {}",
            state.m,
            inputs.len()
        )));
    }
    if round > 1 && !inputs.keys().eq(state.signers.iter()) {
        return Err(Error::Engine(format!(
            "round {round} messages come from a different signer set"
        )));
    }

    let output = match round {
        1 => commit_nonce(&mut state, inputs)?,
        2 => open_nonce(&mut state, inputs)?,
        3 => partial_signature(&mut state, inputs)?,
        4 => combine(&state, inputs)?,
        _ => return Err(Error::Engine(format!("signing has no round {round}"))),
    };

    Ok(Processed {
        state: encode_state(&state)?,
        output,
    })
}

fn commit_nonce(state: &mut SignState, inputs: &RoundInputs) -> Result<RoundOutput> {
    debug!("DSG Round 1: Nonce commitment");
    let hellos = decode_inputs::<SignHello, _>(inputs, |m| m.party_id)?;
    if !hellos.contains_key(&state.party_id) {
        return Err(Error::InvalidPartyId(state.party_id));
    }
    for (party_id, hello) in hellos {
        x25519_from_hex(&hello.enc_key)?;
        state.enc_keys.insert(party_id, hello.enc_key);
        state.signers.push(party_id);
    }

    let nonce_point = ProjectivePoint::GENERATOR * scalar_from_hex(&state.nonce)?;
    let message = SignRound1Message {
        party_id: state.party_id,
        nonce_commitment: hash_point(&nonce_point),
    };
    Ok(RoundOutput::Message(serde_json::to_vec(&message)?))
}

fn open_nonce(state: &mut SignState, inputs: &RoundInputs) -> Result<RoundOutput> {
    debug!("DSG Round 2: Nonce opening");
    let messages = decode_inputs::<SignRound1Message, _>(inputs, |m| m.party_id)?;
    for (party_id, message) in messages {
        state.nonce_commitments.insert(party_id, message.nonce_commitment);
    }

    let secret = state.enc_secret()?;
    let nonce = scalar_from_hex(&state.nonce)?;
    let mut nonce_bytes = Zeroizing::new([0u8; 32]);
    nonce_bytes.copy_from_slice(&nonce.to_bytes());

    let mut nonces = BTreeMap::new();
    for to in state.signers.iter().copied().filter(|id| *id != state.party_id) {
        let channel = Channel {
            session_id: &state.session_id,
            round: 2,
            from: state.party_id,
            to,
        };
        let sealed = channel.seal(&secret, &state.peer_key(to)?, &nonce_bytes[..])?;
        nonces.insert(to, hex::encode(sealed));
    }

    let message = SignRound2Message {
        party_id: state.party_id,
        nonce_point: point_to_hex(&(ProjectivePoint::GENERATOR * nonce)),
        nonces,
    };
    Ok(RoundOutput::Message(serde_json::to_vec(&message)?))
}

fn partial_signature(state: &mut SignState, inputs: &RoundInputs) -> Result<RoundOutput> {
    debug!("DSG Round 3: Partial signature");
    let messages = decode_inputs::<SignRound2Message, _>(inputs, |m| m.party_id)?;
    let me = state.party_id;
    let secret = state.enc_secret()?;

    let mut k = scalar_from_hex(&state.nonce)?;
    let mut r_point = ProjectivePoint::GENERATOR * k;
    for (from, message) in messages.iter().filter(|(from, _)| **from != me) {
        let nonce_point = point_from_hex(&message.nonce_point)?;
        if state.nonce_commitments.get(from) != Some(&hash_point(&nonce_point)) {
            return Err(Error::VerificationFailed(format!(
                "Nonce point of party {from} does not match its commitment"
            )));
        }

        let sealed = message
            .nonces
            .get(&me)
            .ok_or_else(|| Error::VerificationFailed(format!("party {from} sent no nonce for us")))?;
        let sealed = hex::decode(sealed)
            .map_err(|e| Error::Deserialization(format!("nonce from party {from}: {e}")))?;
        let channel = Channel {
            session_id: &state.session_id,
            round: 2,
            from: *from,
            to: me,
        };
        let k_j = scalar_from_bytes(&channel.open(&secret, &state.peer_key(*from)?, &sealed)?)?;
        if ProjectivePoint::GENERATOR * k_j != nonce_point {
            return Err(Error::VerificationFailed(format!(
                "Nonce of party {from} does not open its nonce point"
            )));
        }

        k += k_j;
        r_point += nonce_point;
    }

    let k_inv = Option::<Scalar>::from(k.invert())
        .ok_or_else(|| Error::Crypto("Joint nonce is zero".into()))?;
    let r = x_coordinate(&r_point);
    let (_, tweak) = state.child_key()?;

    let lambda = compute_lagrange_coefficient(me, &state.signers)?;
    let mut weighted = lambda * scalar_from_hex(&state.key_share)?;
    let mut s_i = Scalar::ZERO;
    if state.is_leader() {
        weighted += tweak;
        s_i += k_inv * message_scalar(&state.message_hash()?);
    }
    s_i += k_inv * r * weighted;

    state.r_point = Some(point_to_hex(&r_point));
    let message = SignPartialMessage {
        party_id: me,
        sigma_share: scalar_to_hex(&s_i),
    };
    Ok(RoundOutput::Message(serde_json::to_vec(&message)?))
}

fn combine(state: &SignState, inputs: &RoundInputs) -> Result<RoundOutput> {
    debug!("DSG Round 4: Combine");
    let partials = decode_inputs::<SignPartialMessage, _>(inputs, |m| m.party_id)?;

    let mut s = Scalar::ZERO;
    for partial in partials.values() {
        s += scalar_from_hex(&partial.sigma_share)?;
    }

    let r_point = point_from_hex(
        state
            .r_point
            .as_deref()
            .ok_or_else(|| Error::Engine("round 4 before the nonce was agreed".into()))?,
    )?;
    let r = x_coordinate(&r_point);

    let signature = ecdsa::Signature::from_scalars(r.to_bytes(), s.to_bytes())
        .map_err(|e| Error::Crypto(format!("Invalid signature scalars: {e}")))?;
    let signature = signature.normalize_s().unwrap_or(signature);

    let (child, _) = state.child_key()?;
    let message_hash = state.message_hash()?;
    let v = verify_prehash(&child.public_key, &message_hash, &signature)?;
    let signature = Signature::from_ecdsa(&signature, v, &child.public_key);

    info!(
        party_id = state.party_id,
        r = %signature.r,
        s = %signature.s,
        "DSG completed successfully"
    );
    Ok(RoundOutput::Artifact(Artifact::Signature(signature)))
}

/// Verify `signature` over `message_hash` and return its recovery id
pub(crate) fn verify_prehash(
    public_key: &PublicKey,
    message_hash: &[u8; 32],
    signature: &ecdsa::Signature,
) -> Result<u8> {
    let verifying_key = VerifyingKey::from(public_key);
    verifying_key
        .verify_prehash(message_hash, signature)
        .map_err(|_| Error::VerificationFailed("Signature does not verify".into()))?;
    let recovery_id =
        RecoveryId::trial_recovery_from_prehash(&verifying_key, message_hash, signature)
            .map_err(|_| Error::VerificationFailed("Signature is not recoverable".into()))?;
    Ok(recovery_id.to_byte())
}

fn hash_point(point: &ProjectivePoint) -> String {
    hex::encode(Sha256::digest(point_to_hex(point).as_bytes()))
}

/// r = x-coordinate of R mod n
fn x_coordinate(point: &ProjectivePoint) -> Scalar {
    <Scalar as Reduce<U256>>::reduce_bytes(&point.to_affine().x())
}

fn message_scalar(message_hash: &[u8; 32]) -> Scalar {
    <Scalar as Reduce<U256>>::reduce_bytes(&(*message_hash).into())
}

/// Compute Lagrange coefficient for party i
fn compute_lagrange_coefficient(party_id: PartyId, parties: &[PartyId]) -> Result<Scalar> {
    let i = party_id as u64 + 1;
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;

    for &j_id in parties {
        let j = j_id as u64 + 1;
        if j != i {
            numerator *= Scalar::from(j);
            let diff = if j > i {
                Scalar::from(j - i)
            } else {
                -Scalar::from(i - j)
            };
            denominator *= diff;
        }
    }

    let inverse = Option::<Scalar>::from(denominator.invert())
        .ok_or_else(|| Error::Crypto("Duplicate signer index".into()))?;
    Ok(numerator * inverse)
}
