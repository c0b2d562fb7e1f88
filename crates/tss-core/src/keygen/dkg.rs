//! Simulated key generation rounds
//!
//! Feldman-VSS over secp256k1: every party deals a degree `m - 1` polynomial,
//! shares are sealed pairwise, and every party ends with a Shamir share of the
//! joint secret plus the common key chain.
//!
//! | round | consumes           | produces                             |
//! |-------|--------------------|--------------------------------------|
//! | 1     | hellos (round 0)   | coefficient commitments              |
//! | 2     | commitments        | sealed shares for every other party  |
//! | 3     | sealed shares      | public share, chain code reveal      |
//! | 4     | public shares      | key chain artifact                   |

use std::collections::BTreeMap;

use k256::{elliptic_curve::Field, ProjectivePoint, Scalar};
use rand_chacha::ChaCha20Rng;
use rand_core::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::{KeyGenHello, KeyGenRound1Message, KeyGenRound2Message, KeyGenRound3Message};
use crate::engine::{
    decode_inputs, decode_state, encode_state, point_from_hex, point_to_hex, scalar_from_bytes,
    scalar_from_hex, scalar_to_hex, x25519_from_hex, Begun, Channel, EngineState, KeyGenSetup,
    Processed, RoundInputs, RoundOutput,
};
use crate::hd::ExtendedPublicKey;
use crate::types::{Artifact, KeyChain};
use crate::{Error, PartyId, Result};

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct KeyGenState {
    #[zeroize(skip)]
    session_id: String,
    #[zeroize(skip)]
    party_id: PartyId,
    #[zeroize(skip)]
    m: usize,
    #[zeroize(skip)]
    n: usize,
    coefficients: Vec<String>,
    enc_secret: String,
    chain_code_seed: String,
    #[serde(default)]
    #[zeroize(skip)]
    enc_keys: BTreeMap<PartyId, String>,
    #[serde(default)]
    #[zeroize(skip)]
    commitments: BTreeMap<PartyId, Vec<String>>,
    #[serde(default)]
    #[zeroize(skip)]
    chain_code_commitments: BTreeMap<PartyId, String>,
    #[serde(default)]
    secret_share: Option<String>,
}

impl KeyGenState {
    fn coefficients(&self) -> Result<Vec<Scalar>> {
        self.coefficients.iter().map(|c| scalar_from_hex(c)).collect()
    }

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

    fn commitments_of(&self, party_id: PartyId) -> Result<Vec<ProjectivePoint>> {
        self.commitments
            .get(&party_id)
            .ok_or_else(|| Error::Engine(format!("no commitments from party {party_id}")))?
            .iter()
            .map(|c| point_from_hex(c))
            .collect()
    }
}

/// Draw this party's polynomial, encryption key and chain code seed
pub(crate) fn begin(setup: &KeyGenSetup) -> Result<Begun> {
    if setup.m == 0 || setup.m > setup.n {
        return Err(Error::InvalidConfig(format!(
            "threshold {} out of range for {} parties",
            setup.m, setup.n
        )));
    }
    if setup.party_id >= setup.n {
        return Err(Error::InvalidPartyId(setup.party_id));
    }

    let mut rng = session_rng(setup);
    let coefficients = generate_secret_polynomial(setup.m, &mut rng);
    let enc_secret = StaticSecret::random_from_rng(&mut rng);
    let mut chain_code_seed = Zeroizing::new([0u8; 32]);
    rng.fill_bytes(chain_code_seed.as_mut_slice());

    let hello = KeyGenHello {
        party_id: setup.party_id,
        enc_key: hex::encode(X25519PublicKey::from(&enc_secret).as_bytes()),
    };

    let state = KeyGenState {
        session_id: setup.session_id.clone(),
        party_id: setup.party_id,
        m: setup.m,
        n: setup.n,
        coefficients: coefficients.iter().map(scalar_to_hex).collect(),
        enc_secret: hex::encode(enc_secret.to_bytes()),
        chain_code_seed: hex::encode(*chain_code_seed),
        enc_keys: BTreeMap::new(),
        commitments: BTreeMap::new(),
        chain_code_commitments: BTreeMap::new(),
        secret_share: None,
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
    let mut state: KeyGenState = decode_state(state)?;
    if inputs.len() != state.n || inputs.keys().any(|id| *id >= state.n) {
        return Err(Error::Engine(format!(
            "round {round} needs messages from all {} parties, got {}",
            state.n,
            inputs.len()
        )));
    }

    let output = match round {
        1 => commit(&mut state, inputs)?,
        2 => deal(&mut state, inputs)?,
        3 => collect_shares(&mut state, inputs)?,
        4 => finish(&state, inputs)?,
        _ => return Err(Error::Engine(format!("key generation has no round {round}"))),
    };

    Ok(Processed {
        state: encode_state(&state)?,
        output,
    })
}

fn commit(state: &mut KeyGenState, inputs: &RoundInputs) -> Result<RoundOutput> {
    debug!("DKG Round 1: Commitment");
    let hellos = decode_inputs::<KeyGenHello, _>(inputs, |m| m.party_id)?;
    for (party_id, hello) in hellos {
        x25519_from_hex(&hello.enc_key)?;
        state.enc_keys.insert(party_id, hello.enc_key);
    }

    let commitments = state
        .coefficients()?
        .iter()
        .map(|c| point_to_hex(&(ProjectivePoint::GENERATOR * c)))
        .collect();
    let seed = hex::decode(&state.chain_code_seed)
        .map_err(|e| Error::Engine(format!("corrupt chain code seed: {e}")))?;

    let message = KeyGenRound1Message {
        party_id: state.party_id,
        commitments,
        chain_code_commitment: hex::encode(Sha256::digest(&seed)),
    };
    Ok(RoundOutput::Message(serde_json::to_vec(&message)?))
}

fn deal(state: &mut KeyGenState, inputs: &RoundInputs) -> Result<RoundOutput> {
    debug!("DKG Round 2: Secret sharing");
    let messages = decode_inputs::<KeyGenRound1Message, _>(inputs, |m| m.party_id)?;
    for (party_id, message) in messages {
        if message.commitments.len() != state.m {
            return Err(Error::VerificationFailed(format!(
                "party {party_id} committed to {} coefficients, expected {}",
                message.commitments.len(),
                state.m
            )));
        }
        for commitment in &message.commitments {
            point_from_hex(commitment)?;
        }
        state.commitments.insert(party_id, message.commitments);
        state
            .chain_code_commitments
            .insert(party_id, message.chain_code_commitment);
    }

    let coefficients = state.coefficients()?;
    let secret = state.enc_secret()?;
    let mut shares = BTreeMap::new();
    for to in (0..state.n).filter(|id| *id != state.party_id) {
        let mut share = Zeroizing::new([0u8; 32]);
        share.copy_from_slice(&evaluate_polynomial(&coefficients, to as u64 + 1).to_bytes());
        let channel = Channel {
            session_id: &state.session_id,
            round: 2,
            from: state.party_id,
            to,
        };
        let sealed = channel.seal(&secret, &state.peer_key(to)?, &share[..])?;
        shares.insert(to, hex::encode(sealed));
    }

    let message = KeyGenRound2Message {
        party_id: state.party_id,
        shares,
    };
    Ok(RoundOutput::Message(serde_json::to_vec(&message)?))
}

fn collect_shares(state: &mut KeyGenState, inputs: &RoundInputs) -> Result<RoundOutput> {
    debug!("DKG Round 3: Verification");
    let messages = decode_inputs::<KeyGenRound2Message, _>(inputs, |m| m.party_id)?;
    let me = state.party_id;
    let secret = state.enc_secret()?;

    let mut final_secret = evaluate_polynomial(&state.coefficients()?, me as u64 + 1);
    for (from, message) in messages.iter().filter(|(from, _)| **from != me) {
        let sealed = message
            .shares
            .get(&me)
            .ok_or_else(|| Error::VerificationFailed(format!("party {from} sent no share for us")))?;
        let sealed = hex::decode(sealed)
            .map_err(|e| Error::Deserialization(format!("share from party {from}: {e}")))?;
        let channel = Channel {
            session_id: &state.session_id,
            round: 2,
            from: *from,
            to: me,
        };
        let opened = channel.open(&secret, &state.peer_key(*from)?, &sealed)?;
        let share = scalar_from_bytes(&opened)?;

        verify_share(&share, &state.commitments_of(*from)?, me, *from)?;
        final_secret += share;
    }

    let public_share = ProjectivePoint::GENERATOR * final_secret;
    state.secret_share = Some(scalar_to_hex(&final_secret));

    let message = KeyGenRound3Message {
        party_id: me,
        public_share: point_to_hex(&public_share),
        chain_code_seed: state.chain_code_seed.clone(),
    };
    Ok(RoundOutput::Message(serde_json::to_vec(&message)?))
}

fn finish(state: &KeyGenState, inputs: &RoundInputs) -> Result<RoundOutput> {
    debug!("DKG Round 4: Key chain");
    let messages = decode_inputs::<KeyGenRound3Message, _>(inputs, |m| m.party_id)?;

    let mut all_commitments = BTreeMap::new();
    for party_id in 0..state.n {
        all_commitments.insert(party_id, state.commitments_of(party_id)?);
    }
    let public_shares = compute_public_shares(&all_commitments, state.n);

    let mut chain_code_material = Vec::with_capacity(32 * state.n);
    for (party_id, message) in &messages {
        if message.public_share != point_to_hex(&public_shares[*party_id]) {
            return Err(Error::VerificationFailed(format!(
                "Public share of party {party_id} does not match commitments"
            )));
        }
        let seed = hex::decode(&message.chain_code_seed)
            .map_err(|e| Error::Deserialization(format!("chain code seed: {e}")))?;
        let expected = state.chain_code_commitments.get(party_id);
        if expected.map(String::as_str) != Some(hex::encode(Sha256::digest(&seed)).as_str()) {
            return Err(Error::VerificationFailed(format!(
                "Chain code reveal of party {party_id} does not match its commitment"
            )));
        }
        chain_code_material.extend_from_slice(&seed);
    }

    let secret_share = state
        .secret_share
        .as_deref()
        .ok_or_else(|| Error::Engine("round 4 before shares were collected".into()))?;
    let secret = scalar_from_hex(secret_share)?;
    if ProjectivePoint::GENERATOR * secret != public_shares[state.party_id] {
        return Err(Error::VerificationFailed("Own share does not match commitments".into()));
    }

    let public_key = compute_public_key(&all_commitments)?;
    let mut chain_code = [0u8; 32];
    chain_code.copy_from_slice(&Sha256::digest(&chain_code_material));

    let root = ExtendedPublicKey {
        public_key,
        chain_code,
        depth: 0,
        parent_fingerprint: [0; 4],
        child_number: 0,
    };
    let key_chain = KeyChain {
        private_key_share: secret_share.to_string(),
        common_key_chain: root.to_common_key_chain(),
    };

    info!(
        party_id = state.party_id,
        common_key_chain = %key_chain.common_key_chain,
        "DKG completed successfully"
    );
    Ok(RoundOutput::Artifact(Artifact::KeyChain(key_chain)))
}

fn session_rng(setup: &KeyGenSetup) -> ChaCha20Rng {
    let mut seed = [0u8; 32];
    seed.copy_from_slice(
        &Sha256::new()
            .chain_update(b"tss-keygen")
            .chain_update(&setup.seed[..])
            .chain_update(setup.session_id.as_bytes())
            .finalize(),
    );
    let rng = ChaCha20Rng::from_seed(seed);
    seed.zeroize();
    rng
}

/// Generate a random secret polynomial of degree t-1
fn generate_secret_polynomial<R: RngCore + rand_core::CryptoRng>(
    threshold: usize,
    rng: &mut R,
) -> Vec<Scalar> {
    (0..threshold).map(|_| Scalar::random(&mut *rng)).collect()
}

/// Evaluate polynomial at a point
fn evaluate_polynomial(coefficients: &[Scalar], x: u64) -> Scalar {
    let x_scalar = Scalar::from(x);
    let mut result = Scalar::ZERO;
    let mut x_power = Scalar::ONE;

    for coef in coefficients {
        result += *coef * x_power;
        x_power *= x_scalar;
    }

    result
}

/// Verify a share against the dealer's commitments
fn verify_share(
    share: &Scalar,
    commitments: &[ProjectivePoint],
    my_id: PartyId,
    from: PartyId,
) -> Result<()> {
    let expected = ProjectivePoint::GENERATOR * share;
    if expected != evaluate_commitments(commitments, my_id as u64 + 1) {
        return Err(Error::VerificationFailed(format!(
            "Share from party {from} does not match commitment"
        )));
    }
    Ok(())
}

fn evaluate_commitments(commitments: &[ProjectivePoint], x: u64) -> ProjectivePoint {
    let x_scalar = Scalar::from(x);
    let mut x_power = Scalar::ONE;
    let mut acc = ProjectivePoint::IDENTITY;
    for commitment in commitments {
        acc += *commitment * x_power;
        x_power *= x_scalar;
    }
    acc
}

/// Compute the public key from the constant-term commitments
fn compute_public_key(
    all_commitments: &BTreeMap<PartyId, Vec<ProjectivePoint>>,
) -> Result<k256::PublicKey> {
    let mut public_key = ProjectivePoint::IDENTITY;
    for commitments in all_commitments.values() {
        let constant = commitments
            .first()
            .ok_or_else(|| Error::VerificationFailed("Empty commitments".into()))?;
        public_key += constant;
    }
    k256::PublicKey::from_affine(public_key.to_affine())
        .map_err(|_| Error::VerificationFailed("Joint public key is the identity".into()))
}

/// Compute public shares for all parties
fn compute_public_shares(
    all_commitments: &BTreeMap<PartyId, Vec<ProjectivePoint>>,
    n_parties: usize,
) -> Vec<ProjectivePoint> {
    (0..n_parties)
        .map(|party_id| {
            all_commitments
                .values()
                .map(|commitments| evaluate_commitments(commitments, party_id as u64 + 1))
                .fold(ProjectivePoint::IDENTITY, |acc, p| acc + p)
        })
        .collect()
}
