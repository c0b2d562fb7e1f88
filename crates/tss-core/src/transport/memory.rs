//! In-memory coordinator implementation for testing
//!
//! Honours the same contract as the HTTP coordinator: sessions keyed by role
//! and id, round messages per party, participant slots, password-protected
//! key generation and the completion stores. It also records every request
//! and can be told to fail selected POSTs at the transport level.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use dashmap::{mapref::entry::Entry, DashMap};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{async_trait, Response, Transport};
use crate::coordinator::codes;
use crate::join_code;
use crate::types::{PartyId, Role, Signature, ROUNDS};
use crate::{Error, Result};

/// HTTP method of a recorded request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// One request seen by the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub method: Method,
    pub path: String,
}

struct Fault {
    path_suffix: String,
    remaining: usize,
}

#[derive(Default)]
struct SessionRecord {
    m: usize,
    n: usize,
    password: Option<blake3::Hash>,
    invite_key: Option<String>,
    participants: Vec<Option<String>>,
    rounds: BTreeMap<u32, BTreeMap<PartyId, String>>,
    public_key: Option<String>,
    key_shares: BTreeMap<PartyId, String>,
    signature: Option<Signature>,
}

impl SessionRecord {
    fn new(m: usize, n: usize) -> Self {
        Self {
            m,
            n,
            participants: vec![None; n],
            ..Default::default()
        }
    }

    fn is_completed(&self, role: Role) -> bool {
        match role {
            Role::KeyGen => self.n > 0 && self.key_shares.len() == self.n,
            Role::Sign => self.signature.is_some(),
        }
    }

    fn joined(&self) -> usize {
        self.participants.iter().filter(|p| p.is_some()).count()
    }

    fn messages(&self, round: u32) -> Vec<Value> {
        self.rounds
            .get(&round)
            .map(|messages| {
                messages
                    .iter()
                    .map(|(party_id, payload)| json!({ "partyId": party_id, "payload": payload }))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Fill `party_id`'s slot and record its round-0 message
    fn seat(&mut self, party_id: PartyId, participant: String, message: String) -> Option<Response> {
        if party_id >= self.n {
            return Some(error(400, "TSS_INVALID_PARTY", format!("party {party_id} out of range")));
        }
        match &self.participants[party_id] {
            Some(existing) if *existing == participant => {
                return Some(error(409, codes::ROUND_ALREADY_DONE, "party already joined"));
            }
            Some(_) => {
                return Some(error(409, codes::PARTY_TAKEN, format!("party {party_id} is taken")));
            }
            None => {}
        }
        self.participants[party_id] = Some(participant);
        self.rounds.entry(0).or_default().insert(party_id, message);
        None
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRequest {
    id: String,
    m: usize,
    n: usize,
    party_id: PartyId,
    participant: String,
    message: String,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    invite_key: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinRequest {
    party_id: PartyId,
    participant: String,
    message: String,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    invitation: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoundRequest {
    party_id: PartyId,
    payload: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyGenStoreRequest {
    party_id: PartyId,
    public_key: String,
    encrypted_key_share: String,
}

#[derive(Deserialize)]
struct SignStoreRequest {
    signature: Signature,
}

/// In-memory coordinator shared by all parties of a test
#[derive(Default)]
pub struct MemoryCoordinator {
    sessions: DashMap<(Role, String), SessionRecord>,
    faults: Mutex<Vec<Fault>>,
    requests: Mutex<Vec<RequestRecord>>,
}

impl MemoryCoordinator {
    /// Create a new in-memory coordinator
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` POSTs whose path ends with `path_suffix`
    pub fn fail_posts(&self, path_suffix: impl Into<String>, times: usize) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Fault {
                path_suffix: path_suffix.into(),
                remaining: times,
            });
    }

    /// Every request received so far, in arrival order
    pub fn requests(&self) -> Vec<RequestRecord> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn participants(&self, role: Role, id: &str) -> Option<Vec<Option<String>>> {
        self.sessions
            .get(&(role, id.to_string()))
            .map(|record| record.participants.clone())
    }

    pub fn round_messages(&self, role: Role, id: &str, round: u32) -> BTreeMap<PartyId, String> {
        self.sessions
            .get(&(role, id.to_string()))
            .and_then(|record| record.rounds.get(&round).cloned())
            .unwrap_or_default()
    }

    pub fn public_key(&self, id: &str) -> Option<String> {
        self.sessions
            .get(&(Role::KeyGen, id.to_string()))
            .and_then(|record| record.public_key.clone())
    }

    /// Encrypted key share backups, base64, keyed by party
    pub fn key_shares(&self, id: &str) -> BTreeMap<PartyId, String> {
        self.sessions
            .get(&(Role::KeyGen, id.to_string()))
            .map(|record| record.key_shares.clone())
            .unwrap_or_default()
    }

    pub fn signature(&self, id: &str) -> Option<Signature> {
        self.sessions
            .get(&(Role::Sign, id.to_string()))
            .and_then(|record| record.signature.clone())
    }

    fn record(&self, method: Method, path: &str) {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RequestRecord {
                method,
                path: path.to_string(),
            });
    }

    fn take_fault(&self, path: &str) -> bool {
        let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        let hit = faults
            .iter_mut()
            .find(|fault| fault.remaining > 0 && path.ends_with(&fault.path_suffix));
        match hit {
            Some(fault) => {
                fault.remaining -= 1;
                true
            }
            None => false,
        }
    }

    fn handle_get(&self, role: Role, segments: &[&str]) -> Response {
        match segments {
            [id] => self.metadata(role, id),
            [id, round] => match round.parse::<u32>() {
                Ok(round) => self.fetch_round(role, id, round),
                Err(_) => not_found(),
            },
            _ => not_found(),
        }
    }

    fn handle_post(&self, role: Role, segments: &[&str], body: &Value) -> Response {
        match (role, segments) {
            (_, []) => match parse::<CreateRequest>(body) {
                Ok(request) => self.create(role, request),
                Err(response) => response,
            },
            (Role::KeyGen, [id, "join"]) => match parse::<JoinRequest>(body) {
                Ok(request) => self.join(id, request),
                Err(response) => response,
            },
            (Role::KeyGen, [id, "store"]) => match parse::<KeyGenStoreRequest>(body) {
                Ok(request) => self.store_key(id, request),
                Err(response) => response,
            },
            (Role::Sign, [id, "store"]) => match parse::<SignStoreRequest>(body) {
                Ok(request) => self.store_signature(id, request),
                Err(response) => response,
            },
            (_, [id, round]) => match (round.parse::<u32>(), parse::<RoundRequest>(body)) {
                (Ok(round), Ok(request)) => self.submit(role, id, round, request),
                (Err(_), _) => not_found(),
                (_, Err(response)) => response,
            },
            _ => not_found(),
        }
    }

    fn create(&self, role: Role, request: CreateRequest) -> Response {
        if request.m == 0 || request.m > request.n {
            return error(400, "TSS_INVALID_THRESHOLD", format!("{}-of-{}", request.m, request.n));
        }
        let mut record = match self.sessions.entry((role, request.id.clone())) {
            Entry::Occupied(occupied) => occupied.into_ref(),
            Entry::Vacant(vacant) => {
                let mut record = SessionRecord::new(request.m, request.n);
                record.password = request.password.as_deref().map(|p| blake3::hash(p.as_bytes()));
                record.invite_key = request.invite_key;
                if let Some(response) =
                    record.seat(request.party_id, request.participant, request.message)
                {
                    return response;
                }
                debug!(role = %role, id = %request.id, "session created");
                vacant.insert(record);
                return ok(json!({ "id": request.id }));
            }
        };

        if role == Role::KeyGen || record.is_completed(role) {
            return error(409, codes::ROUND_ALREADY_DONE, "session already exists");
        }
        if record.m != request.m || record.n != request.n {
            return error(400, "TSS_INVALID_THRESHOLD", "threshold does not match session");
        }
        let already_seated = record
            .participants
            .get(request.party_id)
            .map_or(false, |slot| slot.is_some());
        if !already_seated && record.joined() >= record.m {
            return error(403, codes::MAX_PARTICIPANTS_REACHED, "max participants reached");
        }
        match record.seat(request.party_id, request.participant, request.message) {
            Some(response) => response,
            None => ok(json!({ "id": request.id })),
        }
    }

    fn join(&self, id: &str, request: JoinRequest) -> Response {
        let Some(mut record) = self.sessions.get_mut(&(Role::KeyGen, id.to_string())) else {
            return not_found();
        };
        // key generation seats only parties the initiator invited
        let invited = match (&record.invite_key, &request.invitation) {
            (Some(invite_key), Some(invitation)) => {
                join_code::verify_invitation(invite_key, id, request.party_id, invitation)
            }
            _ => false,
        };
        if !invited {
            return error(403, codes::INVALID_CHECKSUM, "invalid invitation");
        }
        if let Some(expected) = record.password {
            let given = request.password.as_deref().map(|p| blake3::hash(p.as_bytes()));
            if given != Some(expected) {
                return error(403, codes::INVALID_PASSWORD, "invalid password");
            }
        }
        if let Some(response) = record.seat(request.party_id, request.participant, request.message) {
            return response;
        }
        ok(json!({ "partyId": request.party_id }))
    }

    fn submit(&self, role: Role, id: &str, round: u32, request: RoundRequest) -> Response {
        let Some(mut record) = self.sessions.get_mut(&(role, id.to_string())) else {
            return not_found();
        };
        if round == 0 || round >= ROUNDS {
            return error(400, "TSS_INVALID_ROUND", format!("round {round} takes no messages"));
        }
        if record.is_completed(role) {
            return error(409, codes::ROUND_ALREADY_DONE, "session already completed");
        }
        if record
            .participants
            .get(request.party_id)
            .map_or(true, |slot| slot.is_none())
        {
            return error(403, "TSS_NOT_PARTICIPANT", format!("party {} has not joined", request.party_id));
        }

        let quorum = role.quorum(record.m, record.n);
        let posted = record.rounds.get(&round);
        if posted.map_or(false, |m| m.contains_key(&request.party_id) || m.len() >= quorum) {
            return error(409, codes::ROUND_ALREADY_DONE, format!("round {round} already done"));
        }
        if record.rounds.get(&(round - 1)).map_or(0, |m| m.len()) < quorum {
            return error(409, "TSS_ROUND_NOT_READY", format!("round {} is still open", round - 1));
        }

        record
            .rounds
            .entry(round)
            .or_default()
            .insert(request.party_id, request.payload);
        ok(json!({}))
    }

    fn store_key(&self, id: &str, request: KeyGenStoreRequest) -> Response {
        let Some(mut record) = self.sessions.get_mut(&(Role::KeyGen, id.to_string())) else {
            return not_found();
        };
        if request.party_id >= record.n || record.participants[request.party_id].is_none() {
            return error(403, "TSS_NOT_PARTICIPANT", format!("party {} has not joined", request.party_id));
        }
        match &record.public_key {
            Some(existing) if *existing != request.public_key => {
                return error(409, "TSS_PUBLIC_KEY_MISMATCH", "public key differs from stored key");
            }
            Some(_) => {}
            None => record.public_key = Some(request.public_key),
        }
        record
            .key_shares
            .insert(request.party_id, request.encrypted_key_share);
        ok(json!({}))
    }

    fn store_signature(&self, id: &str, request: SignStoreRequest) -> Response {
        let Some(mut record) = self.sessions.get_mut(&(Role::Sign, id.to_string())) else {
            return not_found();
        };
        match &record.signature {
            Some(existing) if *existing != request.signature => {
                error(409, "TSS_SIGNATURE_MISMATCH", "a different signature is stored")
            }
            Some(_) => ok(json!({})),
            None => {
                record.signature = Some(request.signature);
                ok(json!({}))
            }
        }
    }

    fn fetch_round(&self, role: Role, id: &str, round: u32) -> Response {
        let Some(record) = self.sessions.get(&(role, id.to_string())) else {
            return not_found();
        };
        let mut body = json!({
            "round": round,
            "messages": record.messages(round),
            "participants": record.participants,
        });
        extend_with_artifacts(&mut body, role, &record);
        ok(body)
    }

    fn metadata(&self, role: Role, id: &str) -> Response {
        let Some(record) = self.sessions.get(&(role, id.to_string())) else {
            return not_found();
        };
        let mut body = json!({
            "id": id,
            "m": record.m,
            "n": record.n,
            "participants": record.participants,
        });
        if role == Role::KeyGen {
            body["hasPassword"] = json!(record.password.is_some());
            body["keyShares"] = record
                .key_shares
                .iter()
                .map(|(party_id, share)| json!({ "partyId": party_id, "encryptedKeyShare": share }))
                .collect();
        }
        extend_with_artifacts(&mut body, role, &record);
        ok(body)
    }
}

fn extend_with_artifacts(body: &mut Value, role: Role, record: &SessionRecord) {
    match role {
        Role::KeyGen => {
            if let Some(public_key) = &record.public_key {
                body["publicKey"] = json!(public_key);
            }
            body["backedUp"] = json!(record.key_shares.keys().collect::<Vec<_>>());
        }
        Role::Sign => {
            if let Some(signature) = &record.signature {
                body["signature"] = json!(signature);
            }
        }
    }
}

/// Split `/v1/tss/{role}/...` into the role and the remaining segments
fn route(path: &str) -> Option<(Role, Vec<&str>)> {
    let path = path.split('?').next().unwrap_or_default();
    let rest = path.strip_prefix("/v1/tss/")?;
    let mut segments = rest.split('/').filter(|s| !s.is_empty());
    let role = match segments.next()? {
        "keygen" => Role::KeyGen,
        "sign" => Role::Sign,
        _ => return None,
    };
    Some((role, segments.collect()))
}

fn parse<T: for<'de> Deserialize<'de>>(body: &Value) -> std::result::Result<T, Response> {
    T::deserialize(body).map_err(|e| error(400, "TSS_BAD_REQUEST", e.to_string()))
}

fn ok(body: Value) -> Response {
    Response::new(200, body)
}

fn not_found() -> Response {
    error(404, "TSS_SESSION_NOT_FOUND", "not found")
}

fn error(status: u16, code: &str, message: impl Into<String>) -> Response {
    Response::new(status, json!({ "code": code, "message": message.into() }))
}

#[async_trait]
impl Transport for MemoryCoordinator {
    async fn get(&self, path: &str) -> Result<Response> {
        self.record(Method::Get, path);
        Ok(match route(path) {
            Some((role, segments)) => self.handle_get(role, &segments),
            None => not_found(),
        })
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Response> {
        self.record(Method::Post, path);
        if self.take_fault(path) {
            debug!(path, "injected transport fault");
            return Err(Error::Transport(format!("injected fault on POST {path}")));
        }
        Ok(match route(path) {
            Some((role, segments)) => self.handle_post(role, &segments, body),
            None => not_found(),
        })
    }
}
