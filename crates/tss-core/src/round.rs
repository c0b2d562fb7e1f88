//! Round state machine shared by key generation and signing
//!
//! Round `r` consumes the messages posted for round `r - 1`; round 0 holds
//! the join/start messages. One iteration:
//!
//! 1. fetch round `r - 1`
//! 2. once the quorum is present, run the engine (`Ready`, `Processed`)
//! 3. post the output and move to `r + 1` (`Submitted`), or on the final
//!    round commit the artifact (`Artifact`), run the role's completion step
//!    and report `Complete`
//!
//! A snapshot of the session is exported before processing. If the post
//! fails, the snapshot is imported back before the error is reported. A
//! round the coordinator rejected outright is never processed again; the
//! session waits for another device to finish it. After a transient failure
//! the next iteration first looks for its own message in the posted round:
//! a post that reached the coordinator is committed without being re-sent.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::coordinator::{CoordinatorClient, RoundSnapshot};
use crate::engine::{Engine, EngineState, Processed, RoundOutput};
use crate::session::Session;
use crate::subscription::{Events, RoundEvent};
use crate::types::{Artifact, ROUNDS};
use crate::{Error, Result};

/// Role-specific completion behaviour
#[async_trait]
pub(crate) trait Finalizer: Send + Sync {
    /// Artifact already held by the coordinator that this party may adopt
    fn remote_artifact(&self, snapshot: &RoundSnapshot) -> Result<Option<Artifact>>;

    /// Side effect run once the completed session is committed
    async fn finalize(
        &self,
        client: &CoordinatorClient,
        session: &Session,
        snapshot: &RoundSnapshot,
    ) -> Result<()>;
}

/// Outcome of one iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// Round not ready yet, or nothing left to do for it
    Idle,
    Submitted(u32),
    Completed,
}

/// Transition held back while the coordinator's acknowledgement is unknown
struct PendingSubmission {
    round: u32,
    state: EngineState,
    participants: Vec<Option<String>>,
}

/// Current session value plus what the loop needs to advance it
pub(crate) struct SessionCore {
    client: CoordinatorClient,
    engine: Arc<dyn Engine>,
    finalizer: Box<dyn Finalizer>,
    current: Mutex<Arc<Session>>,
    recoveries: AtomicUsize,
    finalized: AtomicBool,
    /// Round whose submission was rejected; 0 when none
    rejected_round: AtomicU32,
    pending: Mutex<Option<PendingSubmission>>,
}

impl SessionCore {
    pub(crate) fn new(
        client: CoordinatorClient,
        engine: Arc<dyn Engine>,
        finalizer: Box<dyn Finalizer>,
        session: Session,
    ) -> Self {
        Self {
            client,
            engine,
            finalizer,
            current: Mutex::new(Arc::new(session)),
            recoveries: AtomicUsize::new(0),
            finalized: AtomicBool::new(false),
            rejected_round: AtomicU32::new(0),
            pending: Mutex::new(None),
        }
    }

    pub(crate) fn session(&self) -> Arc<Session> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn id(&self) -> String {
        self.session().id().to_string()
    }

    /// Times a snapshot was re-imported after a failed submission
    pub(crate) fn recoveries(&self) -> usize {
        self.recoveries.load(Ordering::SeqCst)
    }

    fn replace(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = session.clone();
        session
    }

    fn recover(&self, snapshot: &str) -> Result<()> {
        let restored = Session::import(snapshot)?;
        self.replace(restored);
        let count = self.recoveries.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(recoveries = count, "session restored from snapshot");
        Ok(())
    }

    fn take_pending(&self, round: u32) -> Option<PendingSubmission> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .filter(|pending| pending.round == round)
    }

    /// Commit a submission whose acknowledgement was lost, if the
    /// coordinator holds this party's message for the round
    async fn settle_pending(&self, session: &Session, events: &Events) -> Result<Option<Step>> {
        let round = session.round();
        let Some(pending) = self.take_pending(round) else {
            return Ok(None);
        };
        let posted = match self
            .client
            .fetch_round(session.role(), session.id(), round)
            .await
        {
            Ok(posted) => posted,
            Err(err) => {
                *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(pending);
                return Err(err);
            }
        };
        if !posted.messages.contains_key(&session.party_id()) {
            debug!(round, "previous submission never arrived");
            return Ok(None);
        }

        self.replace(session.advanced(pending.state)?.with_participants(&pending.participants));
        events.emit(RoundEvent::Submitted(round));
        info!(round, "round submission confirmed by the coordinator");
        Ok(Some(Step::Submitted(round)))
    }

    /// Run one iteration of the state machine
    #[instrument(skip_all, fields(id = %self.id()))]
    pub(crate) async fn iterate(&self, events: &Events) -> Result<Step> {
        let session = self.session();
        if session.is_completed() {
            return self.finish(&session, None, events).await;
        }
        if let Some(step) = self.settle_pending(&session, events).await? {
            return Ok(step);
        }

        let round = session.round();
        let snapshot = self
            .client
            .fetch_round(session.role(), session.id(), round - 1)
            .await?;
        if !events.is_active() {
            return Ok(Step::Idle);
        }

        let ready = snapshot.messages.len() >= session.quorum()
            && snapshot.messages.contains_key(&session.party_id());
        if !ready || self.rejected_round.load(Ordering::SeqCst) == round {
            return match self.finalizer.remote_artifact(&snapshot)? {
                Some(artifact) => {
                    self.complete(&session, session.state().clone(), artifact, &snapshot, events)
                        .await
                }
                None => Ok(Step::Idle),
            };
        }

        events.emit(RoundEvent::Ready(round));
        let backup = session.export()?;
        let Processed { state, output } =
            self.engine
                .process_round(session.role(), round, session.state(), &snapshot.messages)?;
        events.emit(RoundEvent::Processed(round));
        debug!(round, "round processed");

        let remote = self.finalizer.remote_artifact(&snapshot)?;
        let message = match (output, remote) {
            (_, Some(artifact)) => {
                debug!(round, "adopting artifact stored by the coordinator");
                return self
                    .complete(&session, state, artifact, &snapshot, events)
                    .await;
            }
            (RoundOutput::Artifact(artifact), None) => {
                return self
                    .complete(&session, state, artifact, &snapshot, events)
                    .await;
            }
            (RoundOutput::Message(message), None) => message,
        };
        if round >= ROUNDS {
            return Err(Error::Engine(format!("round {round} produced no artifact")));
        }
        if !events.is_active() {
            return Ok(Step::Idle);
        }

        let submitted = self
            .client
            .submit_round(session.role(), session.id(), round, session.party_id(), &message)
            .await;
        if let Err(err) = submitted {
            self.recover(&backup)?;
            if err.is_transient() {
                *self.pending.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(PendingSubmission {
                        round,
                        state,
                        participants: snapshot.participants.clone(),
                    });
            } else {
                self.rejected_round.store(round, Ordering::SeqCst);
            }
            return Err(err);
        }

        // the coordinator holds the message now, so the transition stands
        // even if the loop was stopped meanwhile
        self.replace(session.advanced(state)?.with_participants(&snapshot.participants));
        events.emit(RoundEvent::Submitted(round));
        info!(round, "round submitted");
        Ok(Step::Submitted(round))
    }

    async fn complete(
        &self,
        session: &Session,
        state: EngineState,
        artifact: Artifact,
        snapshot: &RoundSnapshot,
        events: &Events,
    ) -> Result<Step> {
        let done = self.replace(session.completed(state, artifact.clone()));
        info!(round = session.round(), "session completed");
        events.emit(RoundEvent::Artifact(artifact));
        self.finish(&done, Some(snapshot), events).await
    }

    /// Run the completion step once, then report `Complete`
    async fn finish(
        &self,
        session: &Session,
        snapshot: Option<&RoundSnapshot>,
        events: &Events,
    ) -> Result<Step> {
        if !self.finalized.load(Ordering::SeqCst) {
            let fetched;
            let snapshot = match snapshot {
                Some(snapshot) => snapshot,
                None => {
                    fetched = self
                        .client
                        .fetch_round(session.role(), session.id(), ROUNDS - 1)
                        .await?;
                    &fetched
                }
            };
            self.finalizer
                .finalize(&self.client, session, snapshot)
                .await?;
            self.finalized.store(true, Ordering::SeqCst);
        }
        events.emit(RoundEvent::Complete);
        Ok(Step::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::Registration;
    use crate::engine::{Begun, RoundInputs};
    use crate::subscription::SubscriptionHandle;
    use crate::transport::memory::Method;
    use crate::transport::{MemoryCoordinator, Response, Transport};
    use crate::types::{Role, Signature};
    use serde_json::Value;
    use tokio::sync::mpsc;

    /// Echo engine: each round's message is the round number, round 4 yields
    /// a fixed signature
    struct EchoEngine;

    impl Engine for EchoEngine {
        fn begin(&self, _: &crate::engine::EngineSetup) -> Result<Begun> {
            Ok(Begun {
                state: EngineState::new(vec![0]),
                message: vec![0],
            })
        }

        fn process_round(
            &self,
            _role: Role,
            round: u32,
            _state: &EngineState,
            inputs: &RoundInputs,
        ) -> Result<Processed> {
            assert!(inputs.values().all(|m| m == &vec![(round - 1) as u8]));
            let output = if round == ROUNDS {
                RoundOutput::Artifact(Artifact::Signature(fixed_signature()))
            } else {
                RoundOutput::Message(vec![round as u8])
            };
            Ok(Processed {
                state: EngineState::new(vec![round as u8]),
                output,
            })
        }
    }

    struct NoopFinalizer;

    #[async_trait]
    impl Finalizer for NoopFinalizer {
        fn remote_artifact(&self, snapshot: &RoundSnapshot) -> Result<Option<Artifact>> {
            Ok(snapshot.signature.clone().map(Artifact::Signature))
        }

        async fn finalize(
            &self,
            client: &CoordinatorClient,
            session: &Session,
            snapshot: &RoundSnapshot,
        ) -> Result<()> {
            if snapshot.signature.is_none() {
                client.store_signature(session.id(), &fixed_signature()).await?;
            }
            Ok(())
        }
    }

    fn fixed_signature() -> Signature {
        Signature {
            r: "01".repeat(32),
            s: "02".repeat(32),
            v: 1,
            pub_key: "03".repeat(33),
        }
    }

    fn events() -> (Events, mpsc::UnboundedReceiver<RoundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Events::new(tx, SubscriptionHandle::new()), rx)
    }

    /// Applies every POST but loses the reply of the first one matching
    /// `path_suffix`
    struct DroppedReply {
        inner: Arc<MemoryCoordinator>,
        path_suffix: &'static str,
        dropped: AtomicBool,
    }

    #[async_trait]
    impl Transport for DroppedReply {
        async fn get(&self, path: &str) -> Result<Response> {
            self.inner.get(path).await
        }

        async fn post(&self, path: &str, body: &Value) -> Result<Response> {
            let response = self.inner.post(path, body).await?;
            if path.ends_with(self.path_suffix) && !self.dropped.swap(true, Ordering::SeqCst) {
                return Err(Error::Transport("connection reset".into()));
            }
            Ok(response)
        }
    }

    async fn core_for(memory: &Arc<MemoryCoordinator>) -> SessionCore {
        core_over(memory.clone()).await
    }

    async fn core_over(transport: Arc<dyn Transport>) -> SessionCore {
        let client = CoordinatorClient::new(transport);
        let session = Session::new(
            "s1".into(),
            Role::Sign,
            1,
            1,
            0,
            "p0".into(),
            EngineState::new(vec![0]),
            Some(crate::session::SignParams {
                message_hash: "00".repeat(32),
                derivation_path: "m/0/0".into(),
            }),
        )
        .unwrap();
        client
            .start_sign(&Registration {
                id: "s1",
                m: 1,
                n: 1,
                party_id: 0,
                participant: "p0",
                message: &[0],
                password: None,
                invite_key: None,
                invitation: None,
            })
            .await
            .unwrap();
        SessionCore::new(client, Arc::new(EchoEngine), Box::new(NoopFinalizer), session)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<RoundEvent>) -> Vec<String> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(match event {
                RoundEvent::Ready(r) => format!("ready{r}"),
                RoundEvent::Processed(r) => format!("processed{r}"),
                RoundEvent::Submitted(r) => format!("submitted{r}"),
                RoundEvent::Artifact(_) => "artifact".into(),
                RoundEvent::Complete => "complete".into(),
                RoundEvent::Error(_) => "error".into(),
            });
        }
        seen
    }

    #[tokio::test]
    async fn test_rounds_run_in_order_to_completion() {
        let memory = Arc::new(MemoryCoordinator::new());
        let core = core_for(&memory).await;
        let (events, mut rx) = events();

        for round in 1..ROUNDS {
            assert_eq!(core.iterate(&events).await.unwrap(), Step::Submitted(round));
        }
        assert_eq!(core.iterate(&events).await.unwrap(), Step::Completed);
        assert!(core.session().is_completed());
        assert_eq!(memory.signature("s1"), Some(fixed_signature()));

        let seen = drain(&mut rx);
        assert_eq!(&seen[..3], ["ready1", "processed1", "submitted1"]);
        assert_eq!(&seen[seen.len() - 4..], ["ready4", "processed4", "artifact", "complete"]);
    }

    #[tokio::test]
    async fn test_failed_submission_restores_snapshot() {
        let memory = Arc::new(MemoryCoordinator::new());
        let core = core_for(&memory).await;
        let (events, mut rx) = events();

        memory.fail_posts("/v1/tss/sign/s1/1", 1);
        let err = core.iterate(&events).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(core.recoveries(), 1);
        assert_eq!(core.session().round(), 1);
        assert_eq!(drain(&mut rx), ["ready1", "processed1"]);

        assert_eq!(core.iterate(&events).await.unwrap(), Step::Submitted(1));
        assert_eq!(core.session().round(), 2);
    }

    #[tokio::test]
    async fn test_lost_reply_is_committed_without_reposting() {
        let memory = Arc::new(MemoryCoordinator::new());
        let core = core_over(Arc::new(DroppedReply {
            inner: memory.clone(),
            path_suffix: "/v1/tss/sign/s1/1",
            dropped: AtomicBool::new(false),
        }))
        .await;
        let (events, mut rx) = events();

        let err = core.iterate(&events).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(core.recoveries(), 1);
        assert_eq!(core.session().round(), 1);
        assert_eq!(memory.round_messages(Role::Sign, "s1", 1).len(), 1);
        drain(&mut rx);

        assert_eq!(core.iterate(&events).await.unwrap(), Step::Submitted(1));
        assert_eq!(drain(&mut rx), ["submitted1"]);
        assert_eq!(core.session().round(), 2);

        for round in 2..ROUNDS {
            assert_eq!(core.iterate(&events).await.unwrap(), Step::Submitted(round));
        }
        assert_eq!(core.iterate(&events).await.unwrap(), Step::Completed);
        let round_1_posts = memory
            .requests()
            .into_iter()
            .filter(|r| r.method == Method::Post && r.path.ends_with("/s1/1"))
            .count();
        assert_eq!(round_1_posts, 1);
    }

    #[tokio::test]
    async fn test_rejected_round_is_not_processed_again() {
        let memory = Arc::new(MemoryCoordinator::new());
        let core = core_for(&memory).await;
        let (events, mut rx) = events();

        let stale = core.session().export().unwrap();
        core.iterate(&events).await.unwrap();
        core.replace(Session::import(&stale).unwrap());
        drain(&mut rx);

        assert!(matches!(core.iterate(&events).await, Err(Error::RoundAlreadyDone)));
        assert_eq!(drain(&mut rx), ["ready1", "processed1"]);

        assert_eq!(core.iterate(&events).await.unwrap(), Step::Idle);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(memory.round_messages(Role::Sign, "s1", 1).len(), 1);
    }

    #[tokio::test]
    async fn test_remote_artifact_is_adopted_without_submitting() {
        let memory = Arc::new(MemoryCoordinator::new());
        let core = core_for(&memory).await;
        let (events, mut rx) = events();

        CoordinatorClient::new(memory.clone())
            .store_signature("s1", &fixed_signature())
            .await
            .unwrap();

        assert_eq!(core.iterate(&events).await.unwrap(), Step::Completed);
        assert_eq!(drain(&mut rx), ["ready1", "processed1", "artifact", "complete"]);
        assert!(memory.round_messages(Role::Sign, "s1", 1).is_empty());
    }
}
