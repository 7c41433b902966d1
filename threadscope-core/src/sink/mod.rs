//! Fan-out of pipeline increments to subscribers.
//!
//! [`FanoutSink`] assigns every published event a sequence number, keeps it
//! in a bounded replay log, and pushes it into the queue of every subscriber
//! whose scopes match. Publishing never waits: a subscriber whose queue is
//! full is evicted, which closes its connection.
//!
//! Delivery is at-least-once. A client that reconnects with `since = N`
//! receives every retained event after `N`; events it already saw may be
//! delivered again, so clients apply them idempotently by `seq`.
//!
//! While a subscriber is being replayed to, `publish` skips it. The replay
//! then catches up from the log until nothing newer is left and only then
//! switches the subscriber to live delivery, so replayed and live events
//! never interleave.

mod event;
mod replay;
pub mod ws;

pub use event::{ClientFrame, Envelope, Scope, ServerFrame, SinkEvent};
pub use replay::ReplayLog;

use crate::config::SinkConfig;
use crate::error::{Error, Result};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Item in a subscriber's queue.
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(Arc<Envelope>),
    Frame(ServerFrame),
}

impl Outbound {
    pub fn to_json(&self) -> serde_json::Result<String> {
        match self {
            Outbound::Event(envelope) => serde_json::to_string(envelope.as_ref()),
            Outbound::Frame(frame) => serde_json::to_string(frame),
        }
    }
}

struct Subscriber {
    tx: mpsc::Sender<Outbound>,
    scopes: Vec<Scope>,
    last_seen: Instant,
    /// A replay owns the queue; live publishes skip this subscriber
    replaying: bool,
}

impl Subscriber {
    fn wants(&self, event: &SinkEvent) -> bool {
        self.scopes.iter().any(|s| s.matches(event))
    }
}

/// Counters exposed on `/health`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkStats {
    pub subscribers: usize,
    pub published: u64,
    pub evicted: u64,
    pub head: u64,
    pub retained: usize,
}

struct SinkInner {
    subscribers: DashMap<Uuid, Subscriber>,
    replay: Mutex<ReplayLog>,
    head: AtomicU64,
    evicted: AtomicU64,
    backlog: usize,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
}

/// Shared handle to the subscriber registry and replay log.
#[derive(Clone)]
pub struct FanoutSink {
    inner: Arc<SinkInner>,
}

impl FanoutSink {
    pub fn new(config: &SinkConfig) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                subscribers: DashMap::new(),
                replay: Mutex::new(ReplayLog::new(config.replay_capacity)),
                head: AtomicU64::new(0),
                evicted: AtomicU64::new(0),
                backlog: config.max_subscriber_backlog.max(1),
                heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
                heartbeat_timeout: Duration::from_millis(config.heartbeat_timeout_ms),
            }),
        }
    }

    fn replay_log(&self) -> MutexGuard<'_, ReplayLog> {
        // The log is only ever appended to, so a poisoned guard is still usable.
        self.inner
            .replay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sequence number of the most recent event (0 before the first).
    pub fn head(&self) -> u64 {
        self.inner.head.load(Ordering::Acquire)
    }

    /// Publish an event to every matching subscriber; returns its sequence number.
    pub fn publish(&self, event: SinkEvent) -> u64 {
        let envelope = {
            let mut log = self.replay_log();
            let seq = self.inner.head.load(Ordering::Acquire) + 1;
            let envelope = Arc::new(Envelope { seq, event });
            log.push(envelope.clone());
            self.inner.head.store(seq, Ordering::Release);
            envelope
        };

        let mut evict = Vec::new();
        for entry in self.inner.subscribers.iter() {
            if entry.replaying || !entry.wants(&envelope.event) {
                continue;
            }
            if entry
                .tx
                .try_send(Outbound::Event(envelope.clone()))
                .is_err()
            {
                evict.push(*entry.key());
            }
        }
        for id in evict {
            self.evict(id, "queue full");
        }

        tracing::trace!(seq = envelope.seq, event = envelope.event.event_type(), "Published");
        envelope.seq
    }

    /// Register a connection; events for it arrive on the returned receiver.
    pub fn register(&self) -> (Uuid, mpsc::Receiver<Outbound>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.inner.backlog);
        self.inner.subscribers.insert(
            id,
            Subscriber {
                tx,
                scopes: Vec::new(),
                last_seen: Instant::now(),
                replaying: false,
            },
        );
        tracing::debug!(subscriber = %id, "Subscriber registered");
        (id, rx)
    }

    /// Add `scope` for a subscriber and replay retained events after `since`.
    ///
    /// Returns the number of replayed events, including the ones published
    /// while the replay was running.
    pub async fn subscribe(&self, id: Uuid, scope: Scope, since: Option<u64>) -> Result<usize> {
        let (tx, frame, backlog, head) = {
            let log = self.replay_log();
            let mut subscriber = self
                .inner
                .subscribers
                .get_mut(&id)
                .ok_or_else(|| Error::Sink(format!("unknown subscriber {}", id)))?;
            if !subscriber.scopes.contains(&scope) {
                subscriber.scopes.push(scope.clone());
            }
            subscriber.last_seen = Instant::now();

            let head = self.head();
            let (backlog, complete): (Vec<Arc<Envelope>>, bool) = match since {
                Some(since) => (
                    log.since(since)
                        .filter(|e| scope.matches(&e.event))
                        .cloned()
                        .collect(),
                    log.covers(since, head),
                ),
                None => (Vec::new(), true),
            };
            let frame = ServerFrame::Subscribed {
                scope,
                replayed: backlog.len(),
                complete,
                head,
            };

            // Nothing to replay: the frame fits the live path.
            if since.is_none() {
                let tx = subscriber.tx.clone();
                drop(subscriber);
                drop(log);
                return match tx.try_send(Outbound::Frame(frame)) {
                    Ok(()) => Ok(0),
                    Err(_) => {
                        self.evict(id, "queue full");
                        Err(Error::Sink(format!("subscriber {} queue full", id)))
                    }
                };
            }
            subscriber.replaying = true;
            (subscriber.tx.clone(), frame, backlog, head)
        };

        match self.replay(id, &tx, frame, backlog, head).await {
            Ok(replayed) => {
                if replayed > 0 {
                    tracing::debug!(subscriber = %id, replayed, "Replayed events");
                }
                Ok(replayed)
            }
            Err(e) => {
                self.disconnect(id);
                Err(e)
            }
        }
    }

    /// Send the backlog, then catch up on events published meanwhile until
    /// the log has nothing newer, and go live under the replay lock.
    async fn replay(
        &self,
        id: Uuid,
        tx: &mpsc::Sender<Outbound>,
        frame: ServerFrame,
        backlog: Vec<Arc<Envelope>>,
        mut sent_up_to: u64,
    ) -> Result<usize> {
        let gone = || Error::Sink(format!("subscriber {} disconnected", id));
        tx.send(Outbound::Frame(frame)).await.map_err(|_| gone())?;
        let mut replayed = 0;
        let mut batch = backlog;

        loop {
            for envelope in batch {
                tx.send(Outbound::Event(envelope)).await.map_err(|_| gone())?;
                replayed += 1;
            }

            let log = self.replay_log();
            let mut subscriber = self.inner.subscribers.get_mut(&id).ok_or_else(gone)?;
            if !log.covers(sent_up_to, self.head()) {
                drop(subscriber);
                drop(log);
                self.evict(id, "replay overrun");
                return Err(Error::Sink(format!("subscriber {} fell behind during replay", id)));
            }
            let head = self.head();
            batch = log
                .since(sent_up_to)
                .filter(|e| subscriber.wants(&e.event))
                .cloned()
                .collect();
            sent_up_to = head;
            if batch.is_empty() {
                subscriber.replaying = false;
                return Ok(replayed);
            }
        }
    }

    /// Remove a scope; returns whether it was present.
    pub fn unsubscribe(&self, id: Uuid, scope: &Scope) -> bool {
        match self.inner.subscribers.get_mut(&id) {
            Some(mut subscriber) => {
                subscriber.last_seen = Instant::now();
                let before = subscriber.scopes.len();
                subscriber.scopes.retain(|s| s != scope);
                subscriber.scopes.len() != before
            }
            None => false,
        }
    }

    /// Record liveness; returns false for unknown (e.g. evicted) subscribers.
    pub fn heartbeat(&self, id: Uuid) -> bool {
        match self.inner.subscribers.get_mut(&id) {
            Some(mut subscriber) => {
                subscriber.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Send a control frame to one subscriber without waiting.
    pub fn send_frame(&self, id: Uuid, frame: ServerFrame) -> bool {
        let sent = match self.inner.subscribers.get(&id) {
            Some(subscriber) => subscriber.tx.try_send(Outbound::Frame(frame)).is_ok(),
            None => return false,
        };
        if !sent {
            self.evict(id, "queue full");
        }
        sent
    }

    /// Drop a connection that closed on its own.
    pub fn disconnect(&self, id: Uuid) {
        if self.inner.subscribers.remove(&id).is_some() {
            tracing::debug!(subscriber = %id, "Subscriber disconnected");
        }
    }

    fn evict(&self, id: Uuid, reason: &str) {
        if self.inner.subscribers.remove(&id).is_some() {
            self.inner.evicted.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(subscriber = %id, reason, "Subscriber evicted");
        }
    }

    /// Evict subscribers silent for longer than `timeout`.
    pub fn reap_idle(&self, timeout: Duration) -> usize {
        let stale: Vec<Uuid> = self
            .inner
            .subscribers
            .iter()
            .filter(|s| s.last_seen.elapsed() > timeout)
            .map(|s| *s.key())
            .collect();
        for id in &stale {
            self.evict(*id, "heartbeat timeout");
        }
        stale.len()
    }

    /// Run the heartbeat reaper until `shutdown` flips to true.
    pub fn spawn_reaper(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let sink = self.clone();
        let interval = sink.inner.heartbeat_interval.max(Duration::from_millis(10));
        let timeout = sink.inner.heartbeat_timeout;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        sink.reap_idle(timeout);
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Retained events after `since`, across all scopes.
    pub fn replay_since(&self, since: u64) -> Vec<Arc<Envelope>> {
        self.replay_log().since(since).cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    pub fn stats(&self) -> SinkStats {
        let retained = self.replay_log().len();
        let head = self.head();
        SinkStats {
            subscribers: self.inner.subscribers.len(),
            published: head,
            evicted: self.inner.evicted.load(Ordering::Relaxed),
            head,
            retained,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config(backlog: usize, replay: usize) -> SinkConfig {
        SinkConfig {
            max_subscriber_backlog: backlog,
            replay_capacity: replay,
            ..SinkConfig::default()
        }
    }

    fn truncated(project: &str, conversation: &str) -> SinkEvent {
        SinkEvent::FileTruncated {
            path: PathBuf::from(format!("/r/{}/{}.jsonl", project, conversation)),
            project_id: project.to_string(),
            conversation_id: conversation.to_string(),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        items
    }

    fn event_seqs(items: &[Outbound]) -> Vec<u64> {
        items
            .iter()
            .filter_map(|o| match o {
                Outbound::Event(e) => Some(e.seq),
                Outbound::Frame(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_scoped_delivery() {
        let sink = FanoutSink::new(&config(16, 16));
        let (alpha, mut alpha_rx) = sink.register();
        let (conv, mut conv_rx) = sink.register();
        sink.subscribe(
            alpha,
            Scope::Project {
                project_id: "alpha".to_string(),
            },
            None,
        )
        .await
        .unwrap();
        sink.subscribe(
            conv,
            Scope::Conversation {
                conversation_id: "c2".to_string(),
            },
            None,
        )
        .await
        .unwrap();

        assert_eq!(sink.publish(truncated("alpha", "c1")), 1);
        assert_eq!(sink.publish(truncated("beta", "c2")), 2);

        assert_eq!(event_seqs(&drain(&mut alpha_rx)), vec![1]);
        assert_eq!(event_seqs(&drain(&mut conv_rx)), vec![2]);
    }

    #[tokio::test]
    async fn test_reconnect_replays_since() {
        let sink = FanoutSink::new(&config(16, 16));
        for _ in 0..5 {
            sink.publish(truncated("alpha", "c1"));
        }

        let (id, mut rx) = sink.register();
        let replayed = sink.subscribe(id, Scope::All, Some(2)).await.unwrap();
        assert_eq!(replayed, 3);

        let items = drain(&mut rx);
        match &items[0] {
            Outbound::Frame(ServerFrame::Subscribed { complete, head, .. }) => {
                assert!(*complete);
                assert_eq!(*head, 5);
            }
            other => panic!("expected subscribed frame, got {:?}", other),
        }
        assert_eq!(event_seqs(&items), vec![3, 4, 5]);

        sink.publish(truncated("alpha", "c1"));
        assert_eq!(event_seqs(&drain(&mut rx)), vec![6]);
    }

    #[tokio::test]
    async fn test_replay_reports_gap() {
        let sink = FanoutSink::new(&config(16, 2));
        for _ in 0..5 {
            sink.publish(truncated("alpha", "c1"));
        }
        let (id, mut rx) = sink.register();
        assert_eq!(sink.subscribe(id, Scope::All, Some(0)).await.unwrap(), 2);
        match &drain(&mut rx)[0] {
            Outbound::Frame(ServerFrame::Subscribed { complete, .. }) => assert!(!complete),
            other => panic!("expected subscribed frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_full_queue_evicts_only_slow_subscriber() {
        let sink = FanoutSink::new(&config(2, 16));
        let (slow, _slow_rx) = sink.register();
        let (fast, mut fast_rx) = sink.register();
        sink.subscribe(slow, Scope::All, None).await.unwrap();
        sink.subscribe(fast, Scope::All, None).await.unwrap();
        drain(&mut fast_rx);

        for _ in 0..3 {
            sink.publish(truncated("alpha", "c1"));
            drain(&mut fast_rx);
        }

        assert_eq!(sink.subscriber_count(), 1);
        assert!(!sink.heartbeat(slow));
        assert!(sink.heartbeat(fast));
        assert_eq!(sink.stats().evicted, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_reaper() {
        let sink = FanoutSink::new(&config(16, 16));
        let (id, mut rx) = sink.register();
        sink.subscribe(id, Scope::All, None).await.unwrap();
        assert!(sink.unsubscribe(id, &Scope::All));
        assert!(!sink.unsubscribe(id, &Scope::All));
        drain(&mut rx);

        sink.publish(truncated("alpha", "c1"));
        assert!(drain(&mut rx).is_empty());

        assert_eq!(sink.reap_idle(Duration::from_secs(60)), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.reap_idle(Duration::from_millis(5)), 1);
        assert_eq!(sink.subscriber_count(), 0);
        assert!(rx.recv().await.is_none(), "eviction closes the queue");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_publish_during_blocked_replay_is_delivered_after_backlog() {
        let sink = FanoutSink::new(&config(4, 64));
        for _ in 0..10 {
            sink.publish(truncated("alpha", "c1"));
        }
        let (id, mut rx) = sink.register();

        let replaying = sink.clone();
        let task = tokio::spawn(async move { replaying.subscribe(id, Scope::All, Some(0)).await });

        // The replay fills the queue and waits; publish must not evict it.
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, Outbound::Frame(ServerFrame::Subscribed { .. })));
        assert_eq!(sink.publish(truncated("alpha", "c1")), 11);

        let mut seqs = Vec::new();
        while seqs.len() < 11 {
            let item = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("replay stalled")
                .expect("subscriber evicted");
            if let Outbound::Event(e) = item {
                seqs.push(e.seq);
            }
        }
        assert_eq!(seqs, (1..=11).collect::<Vec<u64>>());
        assert_eq!(task.await.unwrap().unwrap(), 11);
        assert_eq!(sink.subscriber_count(), 1);

        sink.publish(truncated("alpha", "c1"));
        assert_eq!(event_seqs(&drain(&mut rx)), vec![12]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_publish_never_overtakes_replay() {
        for _ in 0..50 {
            let sink = FanoutSink::new(&config(128, 128));
            for _ in 0..20 {
                sink.publish(truncated("alpha", "c1"));
            }
            let (id, mut rx) = sink.register();

            let publisher = sink.clone();
            let publishing = tokio::spawn(async move {
                for _ in 0..20 {
                    publisher.publish(truncated("alpha", "c1"));
                    tokio::task::yield_now().await;
                }
            });
            sink.subscribe(id, Scope::All, Some(0)).await.unwrap();
            publishing.await.unwrap();

            // Duplicates are allowed; first deliveries must be gap-free and in order.
            let mut highest = 0;
            for seq in event_seqs(&drain(&mut rx)) {
                if seq <= highest {
                    continue;
                }
                assert_eq!(seq, highest + 1, "event {} arrived out of order", seq);
                highest = seq;
            }
            assert_eq!(highest, 40);
        }
    }

    #[tokio::test]
    async fn test_subscribe_unknown_subscriber() {
        let sink = FanoutSink::new(&config(4, 4));
        assert!(sink.subscribe(Uuid::new_v4(), Scope::All, None).await.is_err());
    }
}
