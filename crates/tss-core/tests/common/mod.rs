#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::timeout;
use tss_core::transport::async_trait;
use tss_core::{
    Chain, Error, KeyGenContext, MemoryCoordinator, Network, PartyKey, Response, Result,
    RoundEvent, SignContext, SimulatedEngine, SubscribeOptions, Subscription, Transport, TssKey,
    TssKeyGen, TssSign,
};

pub const PASSWORD: &str = "correct horse";
const DEADLINE: Duration = Duration::from_secs(30);

pub fn party(index: usize) -> PartyKey {
    PartyKey::from_seed(&[index as u8 + 1; 32]).unwrap()
}

pub fn keygen(memory: &Arc<MemoryCoordinator>, index: usize) -> TssKeyGen {
    keygen_with(memory.clone(), index)
}

pub fn keygen_with(transport: Arc<dyn Transport>, index: usize) -> TssKeyGen {
    TssKeyGen::new(KeyGenContext {
        transport,
        engine: Arc::new(SimulatedEngine),
        party: party(index),
        chain: Chain::Btc,
        network: Network::Livenet,
    })
}

pub fn signer(memory: &Arc<MemoryCoordinator>, key: &TssKey) -> TssSign {
    TssSign::new(SignContext {
        transport: memory.clone(),
        engine: Arc::new(SimulatedEngine),
        party: party(key.metadata.party_id),
        key: key.clone(),
    })
}

/// Delivers every POST to the coordinator but reports the first `times`
/// matching ones as failed, as a connection dropped after the write would
pub struct LostReplies {
    inner: Arc<MemoryCoordinator>,
    path_suffix: String,
    remaining: AtomicUsize,
}

impl LostReplies {
    pub fn new(inner: &Arc<MemoryCoordinator>, path_suffix: impl Into<String>, times: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: inner.clone(),
            path_suffix: path_suffix.into(),
            remaining: AtomicUsize::new(times),
        })
    }
}

#[async_trait]
impl Transport for LostReplies {
    async fn get(&self, path: &str) -> Result<Response> {
        self.inner.get(path).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Response> {
        let response = self.inner.post(path, body).await?;
        let lost = path.ends_with(&self.path_suffix)
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if lost {
            return Err(Error::Transport(format!("reply to POST {path} lost")));
        }
        Ok(response)
    }
}

pub fn fast() -> SubscribeOptions {
    SubscribeOptions::default().with_interval(Duration::from_millis(10))
}

/// Options that stop the loop after one successful iteration
pub fn single_step() -> SubscribeOptions {
    fast().with_iter_handler(|handle| handle.unsubscribe())
}

/// Events up to and including `Complete`
pub async fn until_complete(subscription: &mut Subscription) -> Vec<RoundEvent> {
    let mut seen = Vec::new();
    timeout(DEADLINE, async {
        while let Some(event) = subscription.next().await {
            let done = matches!(event, RoundEvent::Complete);
            seen.push(event);
            if done {
                break;
            }
        }
    })
    .await
    .expect("session did not complete in time");
    seen
}

/// Every event until the loop stops
pub async fn drain(subscription: &mut Subscription) -> Vec<RoundEvent> {
    let mut seen = Vec::new();
    timeout(DEADLINE, async {
        while let Some(event) = subscription.next().await {
            seen.push(event);
        }
    })
    .await
    .expect("loop did not stop in time");
    seen
}

/// Short names for event order assertions
pub fn names(events: &[RoundEvent]) -> Vec<String> {
    events
        .iter()
        .map(|event| match event {
            RoundEvent::Ready(round) => format!("ready{round}"),
            RoundEvent::Processed(round) => format!("processed{round}"),
            RoundEvent::Submitted(round) => format!("submitted{round}"),
            RoundEvent::Artifact(_) => "artifact".to_string(),
            RoundEvent::Complete => "complete".to_string(),
            RoundEvent::Error(err) => format!("error:{err}"),
        })
        .collect()
}

/// Create an `m`-of-`n` key generation with every invitee joined
pub async fn joined_keygen(memory: &Arc<MemoryCoordinator>, m: usize, n: usize) -> Vec<TssKeyGen> {
    let mut initiator = keygen(memory, 0);
    initiator.new_key(m, n, Some(PASSWORD)).await.unwrap();

    let mut sessions = Vec::new();
    for index in 1..n {
        let code = initiator
            .create_join_code(
                index,
                &party(index).auth_public_key(),
                Some(PASSWORD.to_string()),
                &Default::default(),
            )
            .unwrap();
        let mut joiner = keygen(memory, index);
        joiner.join_key(&code, None, &Default::default()).await.unwrap();
        sessions.push(joiner);
    }
    sessions.insert(0, initiator);
    sessions
}

/// Drive every session to completion concurrently
pub async fn complete_all<F>(subscribe: F) -> Vec<Vec<RoundEvent>>
where
    F: IntoIterator<Item = Subscription>,
{
    let mut subscriptions: Vec<_> = subscribe.into_iter().collect();
    let mut all = Vec::new();
    for subscription in subscriptions.iter_mut() {
        all.push(until_complete(subscription).await);
    }
    all
}

/// Full key generation; returns each party's key
pub async fn generate_keys(memory: &Arc<MemoryCoordinator>, m: usize, n: usize) -> Vec<TssKey> {
    let sessions = joined_keygen(memory, m, n).await;
    complete_all(sessions.iter().map(|s| s.subscribe(fast()).unwrap())).await;
    sessions.iter().map(|s| s.tss_key().unwrap()).collect()
}
