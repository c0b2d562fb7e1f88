//! Threshold key generation sessions
//!
//! The initiator creates the session with [`TssKeyGen::new_key`] and hands
//! each invitee a join code sealed to the invitee's auth key. Invitees call
//! [`TssKeyGen::join_key`]. Every party then runs [`TssKeyGen::subscribe`]
//! until the loop reports the key chain.
//!
//! On completion each party stores the common key chain together with its
//! own share, sealed to its chain account key, so the share can later be
//! recovered with [`open_key_share`].

pub(crate) mod dkg;
mod messages;

pub use messages::*;

use std::sync::Arc;

use k256::PublicKey;
use tracing::{debug, info, instrument};
use zeroize::Zeroizing;

use crate::coordinator::{CoordinatorClient, Registration, RoundSnapshot};
use crate::engine::{Engine, EngineSetup, KeyGenSetup};
use crate::envelope;
use crate::identity::keygen_session_id;
use crate::join_code::{self, JoinCodeOptions, JoinPayload};
use crate::party::PartyKey;
use crate::round::{Finalizer, SessionCore};
use crate::session::Session;
use crate::subscription::{self, SubscribeOptions, Subscription};
use crate::transport::{async_trait, Transport};
use crate::types::{Artifact, Chain, KeyChain, KeyMetadata, Network, PartyId, Role, TssKey};
use crate::{Error, Result};

/// What a party brings to a key generation session
#[derive(Clone)]
pub struct KeyGenContext {
    pub transport: Arc<dyn Transport>,
    pub engine: Arc<dyn Engine>,
    pub party: PartyKey,
    pub chain: Chain,
    pub network: Network,
}

/// One party's key generation session
pub struct TssKeyGen {
    client: CoordinatorClient,
    engine: Arc<dyn Engine>,
    party: PartyKey,
    chain: Chain,
    network: Network,
    core: Option<Arc<SessionCore>>,
}

impl TssKeyGen {
    pub fn new(context: KeyGenContext) -> Self {
        Self {
            client: CoordinatorClient::new(context.transport),
            engine: context.engine,
            party: context.party,
            chain: context.chain,
            network: context.network,
            core: None,
        }
    }

    /// Session id, once started or joined
    pub fn id(&self) -> Option<String> {
        self.core.as_ref().map(|core| core.id())
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Current session value
    pub fn session(&self) -> Option<Arc<Session>> {
        self.core.as_ref().map(|core| core.session())
    }

    /// Create an `m`-of-`n` session as party 0
    #[instrument(skip(self, password), fields(chain = %self.chain, network = %self.network))]
    pub async fn new_key(&mut self, m: usize, n: usize, password: Option<&str>) -> Result<()> {
        self.ensure_fresh()?;
        let seed = self.party.keygen_seed(self.chain, self.network)?;
        let id = keygen_session_id(&seed[..]);
        let (session, message) = self.begin(id, 0, m, n, seed)?;
        let invite_key = join_code::encode_key(&self.party.auth_public_key());

        self.client
            .create_keygen(&Registration {
                id: session.id(),
                m,
                n,
                party_id: 0,
                participant: &self.party.participant_id(),
                message: &message,
                password,
                invite_key: Some(&invite_key),
                invitation: None,
            })
            .await?;

        info!(id = %session.id(), m, n, "key generation session created");
        self.install(session)
    }

    /// Invitation for `party_id`, sealed to the invitee's auth public key
    ///
    /// `extra` travels inside the code; `join_key` uses it as the password
    /// when the invitee supplies none.
    pub fn create_join_code(
        &self,
        party_id: PartyId,
        party_pub_key: &PublicKey,
        extra: Option<String>,
        opts: &JoinCodeOptions,
    ) -> Result<String> {
        let session = self
            .session()
            .ok_or_else(|| Error::InvalidConfig("no key generation session started".into()))?;
        if session.party_id() != 0 {
            return Err(Error::InvalidConfig("only the initiator creates join codes".into()));
        }
        if party_id == 0 || party_id >= session.n() {
            return Err(Error::InvalidPartyId(party_id));
        }

        let payload = JoinPayload {
            id: session.id().to_string(),
            party_id,
            chain: self.chain,
            network: self.network,
            m: session.m(),
            n: session.n(),
            party_pub_key: join_code::encode_key(party_pub_key),
            invitation: join_code::sign_invitation(
                self.party.auth_secret_key(),
                session.id(),
                party_id,
            ),
            extra,
        };
        join_code::encode(&payload, party_pub_key, opts.encoding)
    }

    /// Decode a join code addressed to this party without joining
    pub fn check_join_code(&self, code: &str, opts: &JoinCodeOptions) -> Result<JoinPayload> {
        join_code::decode(code, opts.encoding, &self.party)
    }

    /// Join the session a code invites this party to
    ///
    /// The chain and network of the invitation replace the context's.
    #[instrument(skip_all)]
    pub async fn join_key(
        &mut self,
        code: &str,
        password: Option<&str>,
        opts: &JoinCodeOptions,
    ) -> Result<()> {
        self.ensure_fresh()?;
        let payload = self.check_join_code(code, opts)?;
        self.chain = payload.chain;
        self.network = payload.network;

        let seed = self.party.keygen_seed(self.chain, self.network)?;
        let (session, message) =
            self.begin(payload.id.clone(), payload.party_id, payload.m, payload.n, seed)?;
        let password = password.or(payload.extra.as_deref());

        self.client
            .join_keygen(&Registration {
                id: session.id(),
                m: payload.m,
                n: payload.n,
                party_id: payload.party_id,
                participant: &self.party.participant_id(),
                message: &message,
                password,
                invite_key: None,
                invitation: Some(&payload.invitation),
            })
            .await?;

        info!(id = %session.id(), party_id = payload.party_id, "joined key generation session");
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
    ///
    /// Uses the context's chain and network for the share backup.
    #[instrument(skip_all)]
    pub async fn restore_session(&mut self, exported: &str) -> Result<()> {
        let session = Session::import(exported)?;
        if session.role() != Role::KeyGen {
            return Err(Error::Deserialization("not a key generation session".into()));
        }
        let own = self.party.participant_id();
        if session.participants().get(session.party_id()).cloned().flatten() != Some(own) {
            return Err(Error::InvalidPartyId(session.party_id()));
        }
        let metadata = self.client.metadata(Role::KeyGen, session.id()).await?;
        session.check_against(&metadata)?;

        debug!(id = %session.id(), round = session.round(), "key generation session restored");
        self.core = None;
        self.install(session)
    }

    pub fn is_complete(&self) -> bool {
        self.session().map_or(false, |s| s.is_completed())
    }

    pub fn key_chain(&self) -> Option<KeyChain> {
        self.session()?
            .result()
            .and_then(Artifact::key_chain)
            .cloned()
    }

    /// Key chain plus the metadata needed to sign with it later
    pub fn tss_key(&self) -> Option<TssKey> {
        let session = self.session()?;
        let keychain = session.result().and_then(Artifact::key_chain)?.clone();
        Some(TssKey {
            keychain,
            metadata: KeyMetadata {
                id: session.id().to_string(),
                m: session.m(),
                n: session.n(),
                party_id: session.party_id(),
            },
            chain: self.chain,
            network: self.network,
        })
    }

    /// Times the loop restored its snapshot after a failed submission
    pub fn recoveries(&self) -> usize {
        self.core.as_ref().map_or(0, |core| core.recoveries())
    }

    fn ensure_fresh(&self) -> Result<()> {
        match self.core {
            Some(_) => Err(Error::InvalidConfig("key generation session already started".into())),
            None => Ok(()),
        }
    }

    fn core(&self) -> Result<&Arc<SessionCore>> {
        self.core
            .as_ref()
            .ok_or_else(|| Error::InvalidConfig("no key generation session started".into()))
    }

    /// Engine setup plus the round-0 message to register with
    fn begin(
        &self,
        id: String,
        party_id: PartyId,
        m: usize,
        n: usize,
        seed: Zeroizing<[u8; 32]>,
    ) -> Result<(Session, Vec<u8>)> {
        let begun = self.engine.begin(&EngineSetup::KeyGen(KeyGenSetup {
            session_id: id.clone(),
            party_id,
            m,
            n,
            seed,
        }))?;
        let session = Session::new(
            id,
            Role::KeyGen,
            m,
            n,
            party_id,
            self.party.participant_id(),
            begun.state,
            None,
        )?;
        Ok((session, begun.message))
    }

    fn install(&mut self, session: Session) -> Result<()> {
        let finalizer = KeyGenFinalizer {
            backup_key: self.party.backup_public_key(self.chain, self.network)?,
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

/// Decrypt a share backup stored by [`TssKeyGen`] on completion
pub fn open_key_share(
    party: &PartyKey,
    chain: Chain,
    network: Network,
    encrypted_key_share: &[u8],
) -> Result<KeyChain> {
    let account = party.chain_key(chain, network)?;
    let plaintext = Zeroizing::new(envelope::open(
        encrypted_key_share,
        &account.secret_key,
        &account.public_key(),
    )?);
    serde_json::from_slice(&plaintext)
        .map_err(|e| Error::Deserialization(format!("key share backup: {e}")))
}

/// Stores the common key chain and the sealed share backup
struct KeyGenFinalizer {
    backup_key: PublicKey,
}

#[async_trait]
impl Finalizer for KeyGenFinalizer {
    fn remote_artifact(&self, _snapshot: &RoundSnapshot) -> Result<Option<Artifact>> {
        // a share cannot be adopted from another party
        Ok(None)
    }

    async fn finalize(
        &self,
        client: &CoordinatorClient,
        session: &Session,
        snapshot: &RoundSnapshot,
    ) -> Result<()> {
        let key_chain = session
            .result()
            .and_then(Artifact::key_chain)
            .ok_or_else(|| Error::Internal("completed session holds no key chain".into()))?;

        if let Some(stored) = &snapshot.public_key {
            if *stored != key_chain.common_key_chain {
                return Err(Error::VerificationFailed(
                    "coordinator holds a different common key chain".into(),
                ));
            }
        }
        if snapshot.backed_up.contains(&session.party_id()) {
            debug!(party_id = session.party_id(), "share backup already stored");
            return Ok(());
        }

        let plaintext = Zeroizing::new(serde_json::to_vec(key_chain)?);
        let sealed = envelope::seal(&plaintext, &self.backup_key)?;
        client
            .store_key(
                session.id(),
                session.party_id(),
                &key_chain.common_key_chain,
                &sealed,
            )
            .await
    }
}
