//! Broadcast hub: one PCM producer, many bounded subscriber queues
//!
//! The hub never blocks on a subscriber. Each chunk is offered to every
//! queue with `try_send`; a full queue is handled by the hub's
//! [`OverflowPolicy`], applied the same way to every subscriber.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::audio::{AudioFormat, AudioSource};
use crate::constants::DEFAULT_QUEUE_CAPACITY;
use crate::error::HubError;

/// Identifies one subscriber for the lifetime of the hub
pub type SubscriberId = u64;

/// What the hub does when a subscriber's queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the new chunk for that subscriber only and count it
    DropNewest,
    /// Remove the subscriber after `after` consecutive full deliveries
    Evict { after: u32 },
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        OverflowPolicy::DropNewest
    }
}

/// Hub lifecycle. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HubState {
    Idle,
    Running,
    Stopped,
}

/// Hub settings
#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    /// Pending chunks per subscriber
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::default(),
        }
    }
}

/// Per-subscriber delivery counters
#[derive(Debug, Default)]
pub struct SubscriberStats {
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl SubscriberStats {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Receiving end of one subscriber queue
pub struct SubscriberHandle {
    id: SubscriberId,
    rx: mpsc::Receiver<Bytes>,
    stats: Arc<SubscriberStats>,
}

impl SubscriberHandle {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn stats(&self) -> &Arc<SubscriberStats> {
        &self.stats
    }

    /// Next chunk, or `None` once the hub closed this queue
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Next chunk if one is already queued
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}

/// Snapshot of one subscriber for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct SubscriberSummary {
    pub id: SubscriberId,
    pub queued: usize,
    pub delivered: u64,
    pub dropped: u64,
}

/// Snapshot of the hub for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub state: HubState,
    pub format: AudioFormat,
    pub chunks_published: u64,
    pub subscribers: Vec<SubscriberSummary>,
}

struct Slot {
    id: SubscriberId,
    tx: mpsc::Sender<Bytes>,
    stats: Arc<SubscriberStats>,
    consecutive_full: u32,
}

struct Inner {
    state: HubState,
    subscribers: Vec<Slot>,
}

struct Shared {
    inner: Mutex<Inner>,
    config: HubConfig,
    format: AudioFormat,
    next_id: AtomicU64,
    chunks_published: AtomicU64,
    shutdown: AtomicBool,
}

/// Fans PCM chunks out to every subscriber. Cheap to clone.
#[derive(Clone)]
pub struct BroadcastHub {
    shared: Arc<Shared>,
}

impl BroadcastHub {
    pub fn new(config: HubConfig, format: AudioFormat) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: HubState::Idle,
                    subscribers: Vec::new(),
                }),
                config,
                format,
                next_id: AtomicU64::new(1),
                chunks_published: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Format of the PCM carried by this hub
    pub fn format(&self) -> AudioFormat {
        self.shared.format
    }

    pub fn state(&self) -> HubState {
        self.shared.inner.lock().state
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == HubState::Stopped
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.inner.lock().subscribers.len()
    }

    /// Register a new subscriber with an empty bounded queue
    pub fn subscribe(&self) -> Result<SubscriberHandle, HubError> {
        let mut inner = self.shared.inner.lock();
        if inner.state == HubState::Stopped {
            return Err(HubError::Stopped);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.shared.config.queue_capacity.max(1));
        let stats = Arc::new(SubscriberStats::default());
        inner.subscribers.push(Slot {
            id,
            tx,
            stats: stats.clone(),
            consecutive_full: 0,
        });

        tracing::debug!(subscriber = id, total = inner.subscribers.len(), "Subscribed");
        Ok(SubscriberHandle { id, rx, stats })
    }

    /// Remove a subscriber and close its queue
    pub fn unsubscribe(&self, id: SubscriberId) -> Result<(), HubError> {
        let mut inner = self.shared.inner.lock();
        match inner.subscribers.iter().position(|slot| slot.id == id) {
            Some(pos) => {
                inner.subscribers.remove(pos);
                tracing::debug!(subscriber = id, total = inner.subscribers.len(), "Unsubscribed");
                Ok(())
            }
            None => Err(HubError::NotSubscribed(id)),
        }
    }

    /// Offer one chunk to every subscriber without blocking.
    ///
    /// Returns how many subscribers accepted it.
    pub fn publish(&self, chunk: Bytes) -> usize {
        let mut inner = self.shared.inner.lock();
        if inner.state == HubState::Stopped {
            return 0;
        }
        self.shared.chunks_published.fetch_add(1, Ordering::Relaxed);

        let policy = self.shared.config.overflow;
        let mut delivered = 0;
        inner.subscribers.retain_mut(|slot| match slot.tx.try_send(chunk.clone()) {
            Ok(()) => {
                slot.consecutive_full = 0;
                slot.stats.delivered.fetch_add(1, Ordering::Relaxed);
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                slot.consecutive_full += 1;
                let dropped = slot.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                match policy {
                    OverflowPolicy::DropNewest => {
                        if slot.consecutive_full == 1 {
                            tracing::warn!(subscriber = slot.id, dropped, "Subscriber overrun, dropping chunks");
                        }
                        true
                    }
                    OverflowPolicy::Evict { after } => {
                        if slot.consecutive_full >= after {
                            tracing::warn!(subscriber = slot.id, dropped, "Subscriber overrun, evicting");
                            false
                        } else {
                            true
                        }
                    }
                }
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(subscriber = slot.id, "Subscriber receiver gone, pruning");
                false
            }
        });

        delivered
    }

    /// Stop broadcasting and close every subscriber queue. Terminal.
    pub fn stop(&self) {
        let mut inner = self.shared.inner.lock();
        if inner.state == HubState::Stopped {
            return;
        }
        let closed = inner.subscribers.len();
        inner.state = HubState::Stopped;
        inner.subscribers.clear();
        tracing::info!(closed, "Broadcast hub stopped");
    }

    /// Process-wide stop: closes every queue now, the run loop exits after
    /// its current read.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.stop();
    }

    /// Attach the source and run the pump loop on a dedicated thread
    pub fn start<S: AudioSource>(&self, source: S) -> Result<JoinHandle<()>, HubError> {
        {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                HubState::Idle => inner.state = HubState::Running,
                HubState::Running => return Err(HubError::AlreadyStarted),
                HubState::Stopped => return Err(HubError::Stopped),
            }
        }

        if source.format() != self.shared.format {
            tracing::warn!(
                source = ?source.format(),
                hub = ?self.shared.format,
                "Source format differs from hub format"
            );
        }

        let hub = self.clone();
        thread::Builder::new()
            .name("broadcast-hub".to_string())
            .spawn(move || hub.run(source))
            .map_err(|e| {
                self.stop();
                HubError::Spawn(e.to_string())
            })
    }

    fn run<S: AudioSource>(&self, mut source: S) {
        tracing::info!(format = ?self.shared.format, "Broadcast hub running");
        loop {
            if self.shared.shutdown.load(Ordering::SeqCst) || self.is_stopped() {
                break;
            }
            match source.read_chunk() {
                Ok(Some(chunk)) => {
                    self.publish(chunk);
                }
                Ok(None) => {
                    tracing::info!("Audio source reached end of stream");
                    break;
                }
                Err(e) => {
                    tracing::error!("Audio source failed: {}", e);
                    break;
                }
            }
        }
        self.stop();
    }

    pub fn stats(&self) -> HubStats {
        let inner = self.shared.inner.lock();
        HubStats {
            state: inner.state,
            format: self.shared.format,
            chunks_published: self.shared.chunks_published.load(Ordering::Relaxed),
            subscribers: inner
                .subscribers
                .iter()
                .map(|slot| SubscriberSummary {
                    id: slot.id,
                    queued: slot.tx.max_capacity() - slot.tx.capacity(),
                    delivered: slot.stats.delivered(),
                    dropped: slot.stats.dropped(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::channel_source;
    use proptest::prelude::*;
    use std::time::Duration;

    fn hub(capacity: usize, overflow: OverflowPolicy) -> BroadcastHub {
        BroadcastHub::new(
            HubConfig {
                queue_capacity: capacity,
                overflow,
            },
            AudioFormat::new(44100, 2),
        )
    }

    fn chunk(n: u8) -> Bytes {
        Bytes::from(vec![n; 16])
    }

    fn drain(handle: &mut SubscriberHandle) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(c) = handle.try_recv() {
            out.push(c[0]);
        }
        out
    }

    #[test]
    fn test_fanout_preserves_order() {
        let hub = hub(16, OverflowPolicy::DropNewest);
        let mut a = hub.subscribe().unwrap();
        let mut b = hub.subscribe().unwrap();

        for i in 0..10 {
            assert_eq!(hub.publish(chunk(i)), 2);
        }

        assert_eq!(drain(&mut a), (0..10).collect::<Vec<_>>());
        assert_eq!(drain(&mut b), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_late_subscriber_sees_no_replay() {
        let hub = hub(16, OverflowPolicy::DropNewest);
        let mut early = hub.subscribe().unwrap();
        for i in 0..5 {
            hub.publish(chunk(i));
        }
        let mut late = hub.subscribe().unwrap();
        for i in 5..10 {
            hub.publish(chunk(i));
        }

        assert_eq!(drain(&mut early).len(), 10);
        assert_eq!(drain(&mut late), vec![5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_drop_newest_isolates_slow_subscriber() {
        let capacity = 3;
        let hub = hub(capacity, OverflowPolicy::DropNewest);
        let mut slow = hub.subscribe().unwrap();
        let mut fast = hub.subscribe().unwrap();

        let mut fast_seen = Vec::new();
        for i in 0..=capacity as u8 {
            hub.publish(chunk(i));
            fast_seen.extend(drain(&mut fast));
        }

        assert_eq!(fast_seen, vec![0, 1, 2, 3]);
        assert_eq!(slow.stats().dropped(), 1);
        assert_eq!(drain(&mut slow), vec![0, 1, 2]);
        assert_eq!(hub.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_evict_after_consecutive_overruns() {
        let hub = hub(1, OverflowPolicy::Evict { after: 2 });
        let mut slow = hub.subscribe().unwrap();
        let mut fast = hub.subscribe().unwrap();

        for i in 0..3 {
            hub.publish(chunk(i));
            drain(&mut fast);
        }

        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(slow.recv().await.unwrap()[0], 0);
        assert!(slow.recv().await.is_none());
        assert!(matches!(hub.unsubscribe(slow.id()), Err(HubError::NotSubscribed(_))));
    }

    #[test]
    fn test_successful_delivery_resets_eviction_streak() {
        let hub = hub(1, OverflowPolicy::Evict { after: 2 });
        let mut sub = hub.subscribe().unwrap();

        hub.publish(chunk(0));
        hub.publish(chunk(1)); // full, streak 1
        drain(&mut sub);
        hub.publish(chunk(2)); // delivered, streak reset
        hub.publish(chunk(3)); // full, streak 1

        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(sub.stats().dropped(), 2);
    }

    #[test]
    fn test_double_unsubscribe_is_not_fatal() {
        let hub = hub(4, OverflowPolicy::DropNewest);
        let sub = hub.subscribe().unwrap();

        assert!(hub.unsubscribe(sub.id()).is_ok());
        assert_eq!(hub.unsubscribe(sub.id()), Err(HubError::NotSubscribed(sub.id())));
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let hub = hub(4, OverflowPolicy::DropNewest);
        let sub = hub.subscribe().unwrap();
        let _other = hub.subscribe().unwrap();
        drop(sub);

        assert_eq!(hub.publish(chunk(0)), 1);
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_closes_queues_and_is_terminal() {
        let hub = hub(4, OverflowPolicy::DropNewest);
        let mut sub = hub.subscribe().unwrap();
        hub.publish(chunk(7));
        hub.stop();

        assert_eq!(sub.recv().await.unwrap()[0], 7);
        assert!(sub.recv().await.is_none());
        assert_eq!(hub.state(), HubState::Stopped);
        assert!(matches!(hub.subscribe(), Err(HubError::Stopped)));
        assert_eq!(hub.publish(chunk(8)), 0);

        let (_tx, source) = channel_source(hub.format(), 1);
        assert!(matches!(hub.start(source), Err(HubError::Stopped)));
    }

    #[tokio::test]
    async fn test_run_loop_pumps_until_source_ends() {
        let hub = hub(16, OverflowPolicy::DropNewest);
        let mut sub = hub.subscribe().unwrap();
        let (tx, source) = channel_source(hub.format(), 16);

        let handle = hub.start(source).unwrap();
        assert_eq!(hub.state(), HubState::Running);

        let (_tx2, second) = channel_source(hub.format(), 1);
        assert!(matches!(hub.start(second), Err(HubError::AlreadyStarted)));

        for i in 0..4 {
            tx.send(chunk(i)).unwrap();
        }
        drop(tx);

        let mut seen = Vec::new();
        while let Some(c) = tokio::time::timeout(Duration::from_secs(5), sub.recv()).await.unwrap() {
            seen.push(c[0]);
        }
        assert_eq!(seen, vec![0, 1, 2, 3]);

        handle.join().unwrap();
        assert_eq!(hub.state(), HubState::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_force_closes_while_source_idle() {
        let hub = hub(16, OverflowPolicy::DropNewest);
        let mut sub = hub.subscribe().unwrap();
        let (tx, source) = channel_source(hub.format(), 16);
        let handle = hub.start(source).unwrap();

        hub.shutdown();
        let next = tokio::time::timeout(Duration::from_secs(1), sub.recv()).await.unwrap();
        assert!(next.is_none());

        // the blocked read returns on the next chunk and the loop exits
        tx.send(chunk(0)).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_stats_snapshot() {
        let hub = hub(4, OverflowPolicy::DropNewest);
        let _a = hub.subscribe().unwrap();
        hub.publish(chunk(0));
        hub.publish(chunk(1));

        let stats = hub.stats();
        assert_eq!(stats.state, HubState::Idle);
        assert_eq!(stats.chunks_published, 2);
        assert_eq!(stats.subscribers.len(), 1);
        assert_eq!(stats.subscribers[0].queued, 2);
        assert_eq!(stats.subscribers[0].delivered, 2);
    }

    proptest! {
        #[test]
        fn prop_each_subscriber_gets_suffix_in_order(
            chunks in 1usize..40,
            joins in proptest::collection::vec(0usize..40, 1..6),
        ) {
            let hub = hub(64, OverflowPolicy::DropNewest);
            let mut subs: Vec<(usize, SubscriberHandle)> = Vec::new();

            for i in 0..chunks {
                for &at in &joins {
                    if at == i {
                        subs.push((at, hub.subscribe().unwrap()));
                    }
                }
                hub.publish(chunk(i as u8));
            }

            for (joined_at, mut sub) in subs {
                let expected: Vec<u8> = (joined_at..chunks).map(|i| i as u8).collect();
                prop_assert_eq!(drain(&mut sub), expected);
            }
        }
    }
}
