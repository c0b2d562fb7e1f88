//! Session values and their export format
//!
//! A [`Session`] is immutable. Every transition builds a new value, and the
//! subscription loop swaps it into a single cell. Export renders the whole
//! value (engine state included) as one base64 string. The string carries
//! secret material and is meant for the party's own storage only.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::coordinator::SessionMetadata;
use crate::engine::EngineState;
use crate::types::{Artifact, PartyId, Role, SessionStatus, ROUNDS};
use crate::{Error, Result};

/// Export document version
pub const EXPORT_VERSION: u32 = 1;

/// Signing inputs needed to resume or verify a signing session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignParams {
    /// 32-byte digest being signed, hex
    pub message_hash: String,
    /// Non-hardened path below the common key chain
    pub derivation_path: String,
}

impl SignParams {
    pub fn message_hash_bytes(&self) -> Result<[u8; 32]> {
        let mut hash = [0u8; 32];
        hex::decode_to_slice(&self.message_hash, &mut hash)
            .map_err(|e| Error::Deserialization(format!("message hash: {e}")))?;
        Ok(hash)
    }
}

/// One party's view of a key generation or signing session
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    role: Role,
    m: usize,
    n: usize,
    party_id: PartyId,
    round: u32,
    participants: Vec<Option<String>>,
    status: SessionStatus,
    result: Option<Artifact>,
    state: EngineState,
    sign: Option<SignParams>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionDocument {
    version: u32,
    id: String,
    role: Role,
    m: usize,
    n: usize,
    party_id: PartyId,
    round: u32,
    participants: Vec<Option<String>>,
    state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sign: Option<SignParams>,
}

impl Session {
    /// New active session at round 1, with this party seated as `participant`
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        role: Role,
        m: usize,
        n: usize,
        party_id: PartyId,
        participant: String,
        state: EngineState,
        sign: Option<SignParams>,
    ) -> Result<Self> {
        validate_shape(role, m, n, party_id, sign.as_ref()).map_err(Error::InvalidConfig)?;
        if id.is_empty() {
            return Err(Error::InvalidConfig("session id is empty".into()));
        }

        let mut participants = vec![None; n];
        participants[party_id] = Some(participant);
        Ok(Self {
            id,
            role,
            m,
            n,
            party_id,
            round: 1,
            participants,
            status: SessionStatus::Active,
            result: None,
            state,
            sign,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn m(&self) -> usize {
        self.m
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn party_id(&self) -> PartyId {
        self.party_id
    }

    /// Round this party processes next
    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn participants(&self) -> &[Option<String>] {
        &self.participants
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_completed(&self) -> bool {
        self.status == SessionStatus::Completed
    }

    pub fn result(&self) -> Option<&Artifact> {
        self.result.as_ref()
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn sign_params(&self) -> Option<&SignParams> {
        self.sign.as_ref()
    }

    /// Number of messages that make a round ready
    pub fn quorum(&self) -> usize {
        self.role.quorum(self.m, self.n)
    }

    /// Next round with the engine's new state
    pub fn advanced(&self, state: EngineState) -> Result<Self> {
        if self.is_completed() {
            return Err(Error::Internal("cannot advance a completed session".into()));
        }
        if self.round >= ROUNDS {
            return Err(Error::Internal(format!("round {} is the last round", self.round)));
        }
        Ok(Self {
            round: self.round + 1,
            state,
            ..self.clone()
        })
    }

    /// Terminal value holding the final artifact
    pub fn completed(&self, state: EngineState, artifact: Artifact) -> Self {
        Self {
            status: SessionStatus::Completed,
            result: Some(artifact),
            state,
            ..self.clone()
        }
    }

    /// Participant table as reported by the coordinator; this party's own slot
    /// is kept as is
    pub fn with_participants(&self, participants: &[Option<String>]) -> Self {
        let mut merged = self.participants.clone();
        for (slot, remote) in merged.iter_mut().zip(participants) {
            if remote.is_some() {
                slot.clone_from(remote);
            }
        }
        merged[self.party_id].clone_from(&self.participants[self.party_id]);
        Self {
            participants: merged,
            ..self.clone()
        }
    }

    /// Check that the coordinator still has this session with this party seated
    pub fn check_against(&self, metadata: &SessionMetadata) -> Result<()> {
        if metadata.m != self.m || metadata.n != self.n {
            return Err(Error::VerificationFailed(format!(
                "coordinator reports {}-of-{} for a {}-of-{} session",
                metadata.m, metadata.n, self.m, self.n
            )));
        }
        match metadata.participants.get(self.party_id) {
            Some(remote) if *remote == self.participants[self.party_id] => Ok(()),
            _ => Err(Error::InvalidPartyId(self.party_id)),
        }
    }

    /// Serialize to an opaque string; completed sessions have nothing to export
    pub fn export(&self) -> Result<String> {
        if self.is_completed() {
            return Err(Error::SessionCompleted);
        }
        let document = SessionDocument {
            version: EXPORT_VERSION,
            id: self.id.clone(),
            role: self.role,
            m: self.m,
            n: self.n,
            party_id: self.party_id,
            round: self.round,
            participants: self.participants.clone(),
            state: STANDARD.encode(self.state.as_bytes()),
            sign: self.sign.clone(),
        };
        Ok(STANDARD.encode(serde_json::to_vec(&document)?))
    }

    /// Parse an exported string back into an active session
    pub fn import(exported: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(exported.trim())
            .map_err(|e| Error::Deserialization(format!("session encoding: {e}")))?;
        let document: SessionDocument = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Deserialization(format!("session document: {e}")))?;

        if document.version != EXPORT_VERSION {
            return Err(Error::Deserialization(format!(
                "unsupported session version {}",
                document.version
            )));
        }
        validate_shape(
            document.role,
            document.m,
            document.n,
            document.party_id,
            document.sign.as_ref(),
        )
        .map_err(Error::Deserialization)?;
        if document.round == 0 || document.round > ROUNDS {
            return Err(Error::Deserialization(format!("round {} out of range", document.round)));
        }
        if document.participants.len() != document.n {
            return Err(Error::Deserialization("participant table has the wrong size".into()));
        }
        if document.participants[document.party_id].is_none() {
            return Err(Error::Deserialization("own participant slot is empty".into()));
        }
        let state = STANDARD
            .decode(&document.state)
            .map_err(|e| Error::Deserialization(format!("engine state: {e}")))?;

        Ok(Self {
            id: document.id,
            role: document.role,
            m: document.m,
            n: document.n,
            party_id: document.party_id,
            round: document.round,
            participants: document.participants,
            status: SessionStatus::Active,
            result: None,
            state: EngineState::new(state),
            sign: document.sign,
        })
    }
}

fn validate_shape(
    role: Role,
    m: usize,
    n: usize,
    party_id: PartyId,
    sign: Option<&SignParams>,
) -> std::result::Result<(), String> {
    if m == 0 || m > n {
        return Err(format!("invalid threshold {m}-of-{n}"));
    }
    if party_id >= n {
        return Err(format!("party {party_id} out of range for {n} parties"));
    }
    match (role, sign) {
        (Role::Sign, None) => Err("signing session without signing parameters".into()),
        (Role::KeyGen, Some(_)) => Err("key generation session with signing parameters".into()),
        _ => Ok(()),
    }
}
