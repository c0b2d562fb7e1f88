//! Typed client for the coordinator contract
//!
//! Wraps a [`Transport`] and maps `{code, message}` error bodies onto
//! [`Error`]. Round fetches carry a random `r` query parameter so no cache
//! between client and coordinator can serve a stale round.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::transport::{Response, Transport};
use crate::types::{PartyId, Role, Signature};
use crate::{Error, Result};

/// Error codes the coordinator returns for protocol integrity failures
pub mod codes {
    pub const INVALID_PASSWORD: &str = "TSS_INVALID_PASSWORD";
    pub const MAX_PARTICIPANTS_REACHED: &str = "TSS_MAX_PARTICIPANTS_REACHED";
    pub const ROUND_ALREADY_DONE: &str = "TSS_ROUND_ALREADY_DONE";
    pub const PARTY_TAKEN: &str = "TSS_PARTY_TAKEN";
    pub const INVALID_CHECKSUM: &str = "TSS_INVALID_CHECKSUM";
}

/// Messages of one round plus whatever the coordinator knows of the outcome
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoundSnapshot {
    pub round: u32,
    pub messages: BTreeMap<PartyId, Vec<u8>>,
    pub participants: Vec<Option<String>>,
    /// Common key chain stored by a finished key generation
    pub public_key: Option<String>,
    /// Parties whose encrypted share backup is stored
    pub backed_up: Vec<PartyId>,
    /// Signature stored by a finished signing session
    pub signature: Option<Signature>,
}

/// A stored encrypted key share
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyShareRecord {
    pub party_id: PartyId,
    /// Base64 envelope
    pub encrypted_key_share: String,
}

/// Coordinator view of a session
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub id: String,
    pub m: usize,
    pub n: usize,
    pub participants: Vec<Option<String>>,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub key_shares: Vec<KeyShareRecord>,
    #[serde(default)]
    pub has_password: bool,
    #[serde(default)]
    pub signature: Option<Signature>,
}

/// Registration of a party in a new or existing session
#[derive(Debug, Clone)]
pub struct Registration<'a> {
    pub id: &'a str,
    pub m: usize,
    pub n: usize,
    pub party_id: PartyId,
    pub participant: &'a str,
    /// Round-0 message
    pub message: &'a [u8],
    pub password: Option<&'a str>,
    /// Key the coordinator checks invitations against (create only)
    pub invite_key: Option<&'a str>,
    /// Invitation carried by the join code (join only)
    pub invitation: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    party_id: PartyId,
    payload: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRound {
    round: u32,
    #[serde(default)]
    messages: Vec<WireMessage>,
    #[serde(default)]
    participants: Vec<Option<String>>,
    #[serde(default)]
    public_key: Option<String>,
    #[serde(default)]
    backed_up: Vec<PartyId>,
    #[serde(default)]
    signature: Option<Signature>,
}

#[derive(Deserialize)]
struct WireError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Coordinator client shared by every session of a party
#[derive(Clone)]
pub struct CoordinatorClient {
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for CoordinatorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorClient").finish_non_exhaustive()
    }
}

impl CoordinatorClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Create a key generation session as its first party
    #[instrument(skip(self, registration), fields(id = %registration.id))]
    pub async fn create_keygen(&self, registration: &Registration<'_>) -> Result<()> {
        let mut body = registration_body(registration);
        body["id"] = json!(registration.id);
        body["m"] = json!(registration.m);
        body["n"] = json!(registration.n);
        self.post(Role::KeyGen.path().to_string(), &body, registration.id, Some(registration.party_id))
            .await?;
        Ok(())
    }

    /// Take a slot in an existing key generation session
    #[instrument(skip(self, registration), fields(id = %registration.id, party_id = registration.party_id))]
    pub async fn join_keygen(&self, registration: &Registration<'_>) -> Result<()> {
        let body = registration_body(registration);
        self.post(
            format!("keygen/{}/join", registration.id),
            &body,
            registration.id,
            Some(registration.party_id),
        )
        .await?;
        Ok(())
    }

    /// Create or join a signing session
    #[instrument(skip(self, registration), fields(id = %registration.id, party_id = registration.party_id))]
    pub async fn start_sign(&self, registration: &Registration<'_>) -> Result<()> {
        let mut body = registration_body(registration);
        body["id"] = json!(registration.id);
        body["m"] = json!(registration.m);
        body["n"] = json!(registration.n);
        self.post(Role::Sign.path().to_string(), &body, registration.id, Some(registration.party_id))
            .await?;
        Ok(())
    }

    /// Fetch the messages posted for `round`
    pub async fn fetch_round(&self, role: Role, id: &str, round: u32) -> Result<RoundSnapshot> {
        let body = self.get(format!("{}/{id}/{round}", role.path()), id).await?;
        let wire: WireRound = serde_json::from_value(body)
            .map_err(|e| Error::Deserialization(format!("round response: {e}")))?;

        let mut messages = BTreeMap::new();
        for message in wire.messages {
            let payload = STANDARD
                .decode(&message.payload)
                .map_err(|e| Error::Deserialization(format!("payload of party {}: {e}", message.party_id)))?;
            messages.insert(message.party_id, payload);
        }
        Ok(RoundSnapshot {
            round: wire.round,
            messages,
            participants: wire.participants,
            public_key: wire.public_key,
            backed_up: wire.backed_up,
            signature: wire.signature,
        })
    }

    /// Post this party's message for `round`
    pub async fn submit_round(
        &self,
        role: Role,
        id: &str,
        round: u32,
        party_id: PartyId,
        payload: &[u8],
    ) -> Result<()> {
        let body = json!({ "partyId": party_id, "payload": STANDARD.encode(payload) });
        self.post(format!("{}/{id}/{round}", role.path()), &body, id, Some(party_id))
            .await?;
        Ok(())
    }

    /// Store the common key chain and this party's sealed share
    pub async fn store_key(
        &self,
        id: &str,
        party_id: PartyId,
        common_key_chain: &str,
        encrypted_key_share: &[u8],
    ) -> Result<()> {
        let body = json!({
            "partyId": party_id,
            "publicKey": common_key_chain,
            "encryptedKeyShare": STANDARD.encode(encrypted_key_share),
        });
        self.post(format!("keygen/{id}/store"), &body, id, Some(party_id))
            .await?;
        Ok(())
    }

    pub async fn store_signature(&self, id: &str, signature: &Signature) -> Result<()> {
        let body = json!({ "signature": signature });
        self.post(format!("sign/{id}/store"), &body, id, None).await?;
        Ok(())
    }

    pub async fn metadata(&self, role: Role, id: &str) -> Result<SessionMetadata> {
        let body = self.get(format!("{}/{id}", role.path()), id).await?;
        serde_json::from_value(body)
            .map_err(|e| Error::Deserialization(format!("session metadata: {e}")))
    }

    async fn get(&self, path: String, id: &str) -> Result<Value> {
        let nonce = hex::encode(rand::random::<[u8; 8]>());
        let path = format!("/v1/tss/{path}?r={nonce}");
        debug!(path = %path, "GET");
        let response = self.transport.get(&path).await?;
        check(response, id, None)
    }

    async fn post(
        &self,
        path: String,
        body: &Value,
        id: &str,
        party_id: Option<PartyId>,
    ) -> Result<Value> {
        let path = format!("/v1/tss/{path}");
        debug!(path = %path, "POST");
        let response = self.transport.post(&path, body).await?;
        check(response, id, party_id)
    }
}

fn registration_body(registration: &Registration<'_>) -> Value {
    let mut body = json!({
        "partyId": registration.party_id,
        "participant": registration.participant,
        "message": STANDARD.encode(registration.message),
    });
    if let Some(password) = registration.password {
        body["password"] = json!(password);
    }
    if let Some(invite_key) = registration.invite_key {
        body["inviteKey"] = json!(invite_key);
    }
    if let Some(invitation) = registration.invitation {
        body["invitation"] = json!(invitation);
    }
    body
}

/// Turn a non-2xx response into the matching error
fn check(response: Response, id: &str, party_id: Option<PartyId>) -> Result<Value> {
    if response.is_success() {
        return Ok(response.body);
    }
    let WireError { code, message } =
        serde_json::from_value(response.body).unwrap_or(WireError {
            code: String::new(),
            message: String::new(),
        });

    Err(match (code.as_str(), party_id) {
        (codes::INVALID_PASSWORD, _) => Error::InvalidPassword,
        (codes::INVALID_CHECKSUM, _) => Error::InvalidChecksum,
        (codes::MAX_PARTICIPANTS_REACHED, _) => Error::MaxParticipantsReached,
        (codes::ROUND_ALREADY_DONE, _) => Error::RoundAlreadyDone,
        (codes::PARTY_TAKEN, Some(party_id)) => Error::PartyTaken(party_id),
        _ if response.status == 404 => Error::SessionNotFound(id.to_string()),
        _ => Error::Coordinator {
            status: response.status,
            code,
            message,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{Method, MemoryCoordinator};

    fn registration<'a>(party_id: PartyId, participant: &'a str) -> Registration<'a> {
        Registration {
            id: "s1",
            m: 2,
            n: 2,
            party_id,
            participant,
            message: b"hello",
            password: None,
            invite_key: None,
            invitation: None,
        }
    }

    #[tokio::test]
    async fn test_round_fetch_decodes_payloads() {
        let memory = Arc::new(MemoryCoordinator::new());
        let client = CoordinatorClient::new(memory.clone());

        client.create_keygen(&registration(0, "p0")).await.unwrap();
        client.join_keygen(&registration(1, "p1")).await.unwrap();
        let snapshot = client.fetch_round(Role::KeyGen, "s1", 0).await.unwrap();

        assert_eq!(snapshot.messages.len(), 2);
        assert_eq!(snapshot.messages[&1], b"hello");
        assert_eq!(snapshot.participants[1].as_deref(), Some("p1"));
        assert!(snapshot.public_key.is_none());
    }

    #[tokio::test]
    async fn test_gets_carry_a_fresh_nonce() {
        let memory = Arc::new(MemoryCoordinator::new());
        let client = CoordinatorClient::new(memory.clone());
        client.create_keygen(&registration(0, "p0")).await.unwrap();

        client.fetch_round(Role::KeyGen, "s1", 0).await.unwrap();
        client.fetch_round(Role::KeyGen, "s1", 0).await.unwrap();

        let gets: Vec<_> = memory
            .requests()
            .into_iter()
            .filter(|r| r.method == Method::Get)
            .map(|r| r.path)
            .collect();
        assert_eq!(gets.len(), 2);
        assert!(gets.iter().all(|p| p.starts_with("/v1/tss/keygen/s1/0?r=")));
        assert_ne!(gets[0], gets[1]);
    }

    #[tokio::test]
    async fn test_error_codes_are_typed() {
        let memory = Arc::new(MemoryCoordinator::new());
        let client = CoordinatorClient::new(memory.clone());
        client.create_keygen(&registration(0, "p0")).await.unwrap();

        let taken = client.join_keygen(&registration(0, "intruder")).await;
        assert!(matches!(taken, Err(Error::PartyTaken(0))));

        let again = client.create_keygen(&registration(0, "p0")).await;
        assert!(matches!(again, Err(Error::RoundAlreadyDone)));

        let missing = client.metadata(Role::Sign, "nope").await;
        assert!(matches!(missing, Err(Error::SessionNotFound(id)) if id == "nope"));
    }

    #[test]
    fn test_unmapped_error_keeps_status() {
        let response = Response::new(500, json!({ "code": "BOOM", "message": "down" }));
        let err = check(response, "s1", None).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.code(), Some("BOOM"));
    }
}
