//! Threshold signing sessions
//!
//! Any `m` holders of a [`TssKey`] start the same signing session: the id is
//! derived from the message hash unless the caller picks one. The first
//! starter creates it, the next ones join, and the coordinator turns away
//! starter `m + 1`. The signature verifies under the public key derived from
//! the common key chain at the requested path.

pub(crate) mod dsg;
mod messages;

pub use messages::*;

use std::sync::Arc;

use k256::{elliptic_curve::sec1::ToEncodedPoint, PublicKey};
use tracing::{debug, info, instrument};

use crate::coordinator::{CoordinatorClient, Registration, RoundSnapshot};
use crate::engine::{Engine, EngineSetup, SignSetup};
use crate::identity::{message_hash, sign_session_id};
use crate::party::PartyKey;
use crate::round::{Finalizer, SessionCore};
use crate::session::{Session, SignParams};
use crate::subscription::{self, SubscribeOptions, Subscription};
use crate::transport::{async_trait, Transport};
use crate::types::{Artifact, Role, Signature, TssKey};
use crate::{Error, Result};

/// Path signed with when the caller gives none
pub const DEFAULT_DERIVATION_PATH: &str = "m/0/0";

/// What a party brings to a signing session
#[derive(Clone)]
pub struct SignContext {
    pub transport: Arc<dyn Transport>,
    pub engine: Arc<dyn Engine>,
    pub party: PartyKey,
    pub key: TssKey,
}

/// Digest to sign and where
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignRequest {
    pub message_hash: [u8; 32],
    pub derivation_path: String,
    /// Session id; defaults to `hex(SHA256(message_hash))`
    pub id: Option<String>,
}

impl SignRequest {
    pub fn new(message_hash: [u8; 32]) -> Self {
        Self {
            message_hash,
            derivation_path: DEFAULT_DERIVATION_PATH.to_string(),
            id: None,
        }
    }

    /// Request over `SHA256(message)`
    pub fn from_message(message: &[u8]) -> Self {
        Self::new(message_hash(message))
    }

    pub fn with_derivation_path(mut self, path: impl Into<String>) -> Self {
        self.derivation_path = path.into();
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn session_id(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| sign_session_id(&self.message_hash))
    }
}

/// One party's signing session
pub struct TssSign {
    client: CoordinatorClient,
    engine: Arc<dyn Engine>,
    party: PartyKey,
    key: TssKey,
    core: Option<Arc<SessionCore>>,
}

impl TssSign {
    pub fn new(context: SignContext) -> Self {
        Self {
            client: CoordinatorClient::new(context.transport),
            engine: context.engine,
            party: context.party,
            key: context.key,
            core: None,
        }
    }

    pub fn id(&self) -> Option<String> {
        self.core.as_ref().map(|core| core.id())
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.core.as_ref().map(|core| core.session())
    }

    /// Create or join the signing session for `request`
    #[instrument(skip_all, fields(party_id = self.key.metadata.party_id))]
    pub async fn start(&mut self, request: SignRequest) -> Result<()> {
        if self.core.is_some() {
            return Err(Error::InvalidConfig("signing session already started".into()));
        }
        let metadata = &self.key.metadata;
        let id = request.session_id();

        let begun = self.engine.begin(&EngineSetup::Sign(SignSetup {
            session_id: id.clone(),
            party_id: metadata.party_id,
            m: metadata.m,
            n: metadata.n,
            key_chain: self.key.keychain.clone(),
            message_hash: request.message_hash,
            derivation_path: request.derivation_path.clone(),
        }))?;
        let session = Session::new(
            id,
            Role::Sign,
            metadata.m,
            metadata.n,
            metadata.party_id,
            self.party.participant_id(),
            begun.state,
            Some(SignParams {
                message_hash: hex::encode(request.message_hash),
                derivation_path: request.derivation_path,
            }),
        )?;

        self.client
            .start_sign(&Registration {
                id: session.id(),
                m: metadata.m,
                n: metadata.n,
                party_id: metadata.party_id,
                participant: &self.party.participant_id(),
                message: &begun.message,
                password: None,
                invite_key: None,
                invitation: None,
            })
            .await?;

        info!(id = %session.id(), "signing session started");
        self.install(session)
    }

    /// Start the polling loop; requires a tokio runtime
    pub fn subscribe(&self, options: SubscribeOptions) -> Result<Subscription> {
        Ok(subscription::spawn(self.core()?.clone(), options))
    }

    pub fn export_session(&self) -> Result<String> {
        self.core()?.session().export()
    }

    /// Resume from [`export_session`](Self::export_session) output
    #[instrument(skip_all)]
    pub async fn restore_session(&mut self, exported: &str) -> Result<()> {
        let session = Session::import(exported)?;
        if session.role() != Role::Sign {
            return Err(Error::Deserialization("not a signing session".into()));
        }
        if session.party_id() != self.key.metadata.party_id {
            return Err(Error::InvalidPartyId(session.party_id()));
        }
        let metadata = self.client.metadata(Role::Sign, session.id()).await?;
        session.check_against(&metadata)?;

        debug!(id = %session.id(), round = session.round(), "signing session restored");
        self.core = None;
        self.install(session)
    }

    pub fn is_complete(&self) -> bool {
        self.session().map_or(false, |s| s.is_completed())
    }

    pub fn signature(&self) -> Option<Signature> {
        self.session()?
            .result()
            .and_then(Artifact::signature)
            .cloned()
    }

    pub fn recoveries(&self) -> usize {
        self.core.as_ref().map_or(0, |core| core.recoveries())
    }

    fn core(&self) -> Result<&Arc<SessionCore>> {
        self.core
            .as_ref()
            .ok_or_else(|| Error::InvalidConfig("no signing session started".into()))
    }

    fn install(&mut self, session: Session) -> Result<()> {
        let params = session
            .sign_params()
            .ok_or_else(|| Error::Internal("signing session without parameters".into()))?;
        let finalizer = SignFinalizer {
            public_key: self.key.keychain.derive_public_key(&params.derivation_path)?,
            message_hash: params.message_hash_bytes()?,
        };
        self.core = Some(Arc::new(SessionCore::new(
            self.client.clone(),
            self.engine.clone(),
            Box::new(finalizer),
            session,
        )));
        Ok(())
    }
}

/// Check `signature` over `message_hash` against `public_key`
///
/// The embedded `pubKey` must be `public_key` itself.
pub fn verify_signature(
    signature: &Signature,
    message_hash: &[u8; 32],
    public_key: &PublicKey,
) -> Result<()> {
    let expected = hex::encode(public_key.to_encoded_point(true).as_bytes());
    if signature.pub_key != expected {
        return Err(Error::VerificationFailed(
            "signature pubKey does not match the derived key".into(),
        ));
    }
    dsg::verify_prehash(public_key, message_hash, &signature.to_ecdsa()?)?;
    Ok(())
}

/// Adopts a signature already stored by the coordinator and stores ours
struct SignFinalizer {
    public_key: PublicKey,
    message_hash: [u8; 32],
}

#[async_trait]
impl Finalizer for SignFinalizer {
    fn remote_artifact(&self, snapshot: &RoundSnapshot) -> Result<Option<Artifact>> {
        match &snapshot.signature {
            Some(signature) => {
                verify_signature(signature, &self.message_hash, &self.public_key)?;
                Ok(Some(Artifact::Signature(signature.clone())))
            }
            None => Ok(None),
        }
    }

    async fn finalize(
        &self,
        client: &CoordinatorClient,
        session: &Session,
        snapshot: &RoundSnapshot,
    ) -> Result<()> {
        let signature = session
            .result()
            .and_then(Artifact::signature)
            .ok_or_else(|| Error::Internal("completed session holds no signature".into()))?;
        if snapshot.signature.as_ref() == Some(signature) {
            return Ok(());
        }
        verify_signature(signature, &self.message_hash, &self.public_key)?;
        client.store_signature(session.id(), signature).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keygen::dkg::tests::run_keygen;

    #[test]
    fn test_default_session_id_is_hash_of_hash() {
        let request = SignRequest::from_message(b"hello");
        assert_eq!(request.derivation_path, DEFAULT_DERIVATION_PATH);
        assert_eq!(request.session_id(), sign_session_id(&message_hash(b"hello")));
        assert_eq!(request.clone().with_id("custom").session_id(), "custom");
    }

    #[test]
    fn test_verify_signature_checks_pub_key() {
        use k256::ecdsa::SigningKey;
        use rand::rngs::OsRng;

        let signing_key = SigningKey::random(&mut OsRng);
        let public = PublicKey::from(signing_key.verifying_key());
        let hash = message_hash(b"payload");
        let (sig, recid) = signing_key.sign_prehash_recoverable(&hash).unwrap();
        let signature = Signature::from_ecdsa(&sig, recid.to_byte(), &public);

        verify_signature(&signature, &hash, &public).unwrap();

        let other = PublicKey::from(SigningKey::random(&mut OsRng).verifying_key());
        assert!(matches!(
            verify_signature(&signature, &hash, &other),
            Err(Error::VerificationFailed(_))
        ));
        assert!(verify_signature(&signature, &message_hash(b"other"), &public).is_err());
    }

    #[test]
    fn test_finalizer_rejects_foreign_remote_signature() {
        let key_chains = run_keygen(2, 3);
        let finalizer = SignFinalizer {
            public_key: key_chains[0].derive_public_key("m/0/0").unwrap(),
            message_hash: [3u8; 32],
        };
        let snapshot = RoundSnapshot {
            signature: Some(Signature {
                r: "01".repeat(32),
                s: "01".repeat(32),
                v: 0,
                pub_key: "02".repeat(33),
            }),
            ..RoundSnapshot::default()
        };
        assert!(finalizer.remote_artifact(&snapshot).is_err());
        assert_eq!(finalizer.remote_artifact(&RoundSnapshot::default()).unwrap(), None);
    }
}
