//! Polling loop driving a session
//!
//! [`subscribe`](crate::keygen::TssKeyGen::subscribe) spawns one tokio task
//! per session. The task ticks at a fixed interval, runs one iteration of the
//! round state machine per tick and reports progress as [`RoundEvent`]s over
//! a channel. Iterations never overlap and iteration errors never end the
//! loop; only [`SubscriptionHandle::unsubscribe`] or completion does.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::round::{SessionCore, Step};
use crate::types::Artifact;
use crate::Error;

/// Default poll interval
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(1000);

/// Progress reported by the loop
#[derive(Debug, Clone)]
pub enum RoundEvent {
    /// Messages for the round are all present
    Ready(u32),
    /// The engine consumed them
    Processed(u32),
    /// This party's output for the round was accepted
    Submitted(u32),
    /// Final key chain or signature
    Artifact(Artifact),
    Complete,
    Error(Error),
}

/// Callback run after every successful iteration
pub type IterHandler = Arc<dyn Fn(&SubscriptionHandle) + Send + Sync>;

#[derive(Clone)]
pub struct SubscribeOptions {
    pub interval: Duration,
    pub iter_handler: Option<IterHandler>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            iter_handler: None,
        }
    }
}

impl std::fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("interval", &self.interval)
            .field("iter_handler", &self.iter_handler.is_some())
            .finish()
    }
}

impl SubscribeOptions {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_iter_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&SubscriptionHandle) + Send + Sync + 'static,
    {
        self.iter_handler = Some(Arc::new(handler));
        self
    }
}

impl From<&ClientConfig> for SubscribeOptions {
    fn from(config: &ClientConfig) -> Self {
        Self::default().with_interval(config.poll_interval())
    }
}

struct Cancellation {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Stops a running subscription; cloneable and safe to use from the handler
#[derive(Clone)]
pub struct SubscriptionHandle {
    inner: Arc<Cancellation>,
}

impl SubscriptionHandle {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Cancellation {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Stop the loop. Calling it again does nothing.
    pub fn unsubscribe(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_active(&self) -> bool {
        !self.inner.cancelled.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Event stream of a running session loop
///
/// Dropping it stops the loop.
pub struct Subscription {
    events: mpsc::UnboundedReceiver<RoundEvent>,
    handle: SubscriptionHandle,
}

impl Subscription {
    /// Next event; `None` once the loop has stopped and the buffer is drained
    pub async fn next(&mut self) -> Option<RoundEvent> {
        self.events.recv().await
    }

    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    pub fn unsubscribe(&self) {
        self.handle.unsubscribe();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.unsubscribe();
    }
}

/// Sender side of the event stream; silent once unsubscribed
pub(crate) struct Events {
    tx: mpsc::UnboundedSender<RoundEvent>,
    handle: SubscriptionHandle,
}

impl Events {
    pub(crate) fn new(tx: mpsc::UnboundedSender<RoundEvent>, handle: SubscriptionHandle) -> Self {
        Self { tx, handle }
    }

    pub(crate) fn emit(&self, event: RoundEvent) {
        if self.handle.is_active() {
            // receiver gone means nobody is listening
            let _ = self.tx.send(event);
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.handle.is_active()
    }
}

/// Start the loop for `core`
pub(crate) fn spawn(core: Arc<SessionCore>, options: SubscribeOptions) -> Subscription {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = SubscriptionHandle::new();
    let events = Events::new(tx, handle.clone());
    tokio::spawn(run(core, options, events));
    Subscription { events: rx, handle }
}

async fn run(core: Arc<SessionCore>, options: SubscribeOptions, events: Events) {
    let handle = events.handle.clone();
    let mut ticker = tokio::time::interval(options.interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let cancelled = handle.inner.notify.notified();
        tokio::pin!(cancelled);
        if !handle.is_active() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut cancelled => break,
        }

        match core.iterate(&events).await {
            Ok(Step::Completed) => {
                run_handler(&options, &handle);
                handle.unsubscribe();
                break;
            }
            Ok(Step::Idle | Step::Submitted(_)) => run_handler(&options, &handle),
            Err(err) => {
                warn!(session = %core.id(), error = %err, "iteration failed");
                events.emit(RoundEvent::Error(err));
            }
        }
    }
    debug!(session = %core.id(), "subscription stopped");
}

fn run_handler(options: &SubscribeOptions, handle: &SubscriptionHandle) {
    if let Some(handler) = &options.iter_handler {
        if handle.is_active() {
            handler(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let handle = SubscriptionHandle::new();
        assert!(handle.is_active());
        handle.unsubscribe();
        handle.unsubscribe();
        assert!(!handle.is_active());
    }

    #[tokio::test]
    async fn test_events_are_dropped_after_unsubscribe() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = SubscriptionHandle::new();
        let events = Events::new(tx, handle.clone());

        events.emit(RoundEvent::Ready(1));
        handle.unsubscribe();
        events.emit(RoundEvent::Processed(1));
        drop(events);

        assert!(matches!(rx.recv().await, Some(RoundEvent::Ready(1))));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_options_from_config() {
        let config = ClientConfig {
            poll_interval_ms: 25,
            ..ClientConfig::default()
        };
        let options = SubscribeOptions::from(&config);
        assert_eq!(options.interval, Duration::from_millis(25));
        assert!(options.iter_handler.is_none());
    }
}
