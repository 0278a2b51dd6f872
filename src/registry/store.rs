//! Stream registry implementation
//!
//! Lock order is always map, then entry. Publishing takes only the entry
//! lock, so streams never contend with each other on the hot path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;

use crate::media::Packet;

use super::config::RegistryConfig;
use super::entry::{FanOut, PublisherSlot, StreamEntry, StreamSnapshot, StreamState};
use super::error::RegistryError;
use super::key::StreamKey;
use super::subscriber::{self, Capabilities, CloseReason, SubscriberId, Subscription};

type EntryRef = Arc<RwLock<StreamEntry>>;

/// Central registry for all streams in a server
///
/// Owned explicitly (usually behind an `Arc`) and handed to every session.
pub struct StreamRegistry {
    streams: RwLock<HashMap<StreamKey, EntryRef>>,
    config: RegistryConfig,
    next_subscriber_id: AtomicU64,
    next_publisher_token: AtomicU64,
}

/// Exclusive publishing right on one stream
///
/// Obtained from [`StreamRegistry::acquire_publisher`]. Hand it back with
/// [`StreamRegistry::release_publisher`] when the publisher goes away.
#[derive(Debug)]
pub struct Publisher {
    key: StreamKey,
    session_id: u64,
    token: u64,
    entry: EntryRef,
}

impl Publisher {
    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Cache the packet and fan it out to every subscriber
    ///
    /// Never waits on a subscriber. Fails once the slot has been taken
    /// away by [`StreamRegistry::evict_publisher`].
    pub async fn send(&self, packet: Packet) -> Result<FanOut, RegistryError> {
        let mut entry = self.entry.write().await;
        match entry.publisher {
            Some(slot) if slot.token == self.token => Ok(entry.publish(&self.key, packet)),
            _ => Err(RegistryError::PublisherEvicted(self.key.clone())),
        }
    }
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            config,
            next_subscriber_id: AtomicU64::new(1),
            next_publisher_token: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Claim the publisher slot for `key`
    ///
    /// Creates the stream if needed. A stream in its grace period (or a
    /// placeholder waiting for a publisher) is reclaimed and keeps its
    /// subscribers.
    pub async fn acquire_publisher(
        &self,
        key: &StreamKey,
        session_id: u64,
    ) -> Result<Publisher, RegistryError> {
        let mut streams = self.streams.write().await;
        let token = self.next_publisher_token.fetch_add(1, Ordering::Relaxed);

        if let Some(entry_arc) = streams.get(key).cloned() {
            let mut entry = entry_arc.write().await;
            if entry.publisher.is_some() {
                return Err(RegistryError::AlreadyPublishing(key.clone()));
            }

            let previous = entry.state;
            entry.publisher = Some(PublisherSlot { session_id, token });
            entry.publisher_disconnected_at = None;
            entry.state = StreamState::Active;
            // Frames from the previous publisher can't be spliced onto new ones
            entry.gop.clear_frames();
            entry.begin_publisher();

            tracing::info!(
                stream = %key,
                session_id = session_id,
                previous = ?previous,
                subscribers = entry.subscriber_count(),
                "Publisher registered (existing stream)"
            );
            drop(entry);

            return Ok(Publisher {
                key: key.clone(),
                session_id,
                token,
                entry: entry_arc,
            });
        }

        let mut entry = StreamEntry::new(&self.config);
        entry.publisher = Some(PublisherSlot { session_id, token });
        entry.state = StreamState::Active;
        let entry_arc = Arc::new(RwLock::new(entry));
        streams.insert(key.clone(), Arc::clone(&entry_arc));

        tracing::info!(stream = %key, session_id = session_id, "Publisher registered (new stream)");

        Ok(Publisher {
            key: key.clone(),
            session_id,
            token,
            entry: entry_arc,
        })
    }

    /// Give up the publisher slot
    ///
    /// With the keep policy the stream enters its grace period; otherwise it
    /// is removed and every subscriber is closed with `StreamEnded`.
    pub async fn release_publisher(&self, publisher: &Publisher) -> Result<(), RegistryError> {
        let mut streams = self.streams.write().await;
        let mut entry = publisher.entry.write().await;

        match entry.publisher {
            Some(slot) if slot.token == publisher.token => {}
            _ => return Err(RegistryError::PublisherMismatch(publisher.key.clone())),
        }

        let remove = self.vacate(&publisher.key, &mut entry);
        drop(entry);

        if remove {
            remove_if_same(&mut streams, &publisher.key, &publisher.entry);
        }
        Ok(())
    }

    /// Forcibly take the publisher slot away (administrative)
    ///
    /// The stream then behaves as if the publisher had left; the evicted
    /// publisher's next `send` fails.
    pub async fn evict_publisher(&self, key: &StreamKey) -> Result<u64, RegistryError> {
        let mut streams = self.streams.write().await;
        let entry_arc = streams
            .get(key)
            .cloned()
            .ok_or_else(|| RegistryError::StreamNotFound(key.clone()))?;

        let mut entry = entry_arc.write().await;
        let session_id = entry
            .publisher
            .map(|p| p.session_id)
            .ok_or_else(|| RegistryError::StreamNotFound(key.clone()))?;

        tracing::warn!(stream = %key, session_id = session_id, "Evicting publisher");
        let remove = self.vacate(key, &mut entry);
        drop(entry);

        if remove {
            streams.remove(key);
        }
        Ok(session_id)
    }

    /// Register a subscriber
    ///
    /// The returned subscription starts with the stream's current GOP cache
    /// snapshot, taken under the same lock that registers the queue, so not
    /// a single live packet is missed or repeated.
    pub async fn subscribe(
        &self,
        key: &StreamKey,
        capabilities: Capabilities,
    ) -> Result<Subscription, RegistryError> {
        {
            let streams = self.streams.read().await;
            if let Some(entry_arc) = streams.get(key) {
                let mut entry = entry_arc.write().await;
                return Ok(self.attach(key, &mut entry, capabilities));
            }
        }

        if !self.config.allow_play_before_publish {
            return Err(RegistryError::StreamNotFound(key.clone()));
        }

        let mut streams = self.streams.write().await;
        let entry_arc = streams
            .entry(key.clone())
            .or_insert_with(|| {
                tracing::info!(stream = %key, "Placeholder stream created for early subscriber");
                Arc::new(RwLock::new(StreamEntry::new(&self.config)))
            })
            .clone();
        let mut entry = entry_arc.write().await;
        Ok(self.attach(key, &mut entry, capabilities))
    }

    /// Deregister a subscriber
    ///
    /// Removes the stream if this leaves it with neither publisher nor
    /// subscribers (outside a grace period).
    pub async fn unsubscribe(&self, subscription: Subscription) {
        self.detach(subscription.key(), subscription.id(), None).await;
    }

    /// Close a subscriber by handle id (administrative)
    pub async fn evict_subscriber(&self, key: &StreamKey, id: SubscriberId) -> bool {
        self.detach(key, id, Some(CloseReason::Evicted)).await
    }

    /// Release everything a session still holds
    ///
    /// Used by the connection supervisor when a session task dies without
    /// running its own cleanup. Returns the number of publisher slots freed.
    pub async fn release_session(&self, session_id: u64) -> usize {
        let mut streams = self.streams.write().await;
        let mut released = 0;
        let mut removals = Vec::new();

        for (key, entry_arc) in streams.iter() {
            let mut entry = entry_arc.write().await;
            // Subscriptions owned by the session were dropped with its task
            entry.prune_closed();

            if entry.publisher.map(|p| p.session_id) == Some(session_id) {
                released += 1;
                if self.vacate(key, &mut entry) {
                    removals.push(key.clone());
                    continue;
                }
            }
            if entry.is_abandoned() {
                removals.push(key.clone());
            }
        }

        for key in removals {
            streams.remove(&key);
            tracing::info!(stream = %key, session_id = session_id, "Stream removed after session failure");
        }
        released
    }

    /// Point-in-time view of every stream
    pub async fn list_streams(&self) -> Vec<StreamSnapshot> {
        let streams = self.streams.read().await;
        let mut out = Vec::with_capacity(streams.len());
        for (key, entry_arc) in streams.iter() {
            let entry = entry_arc.read().await;
            out.push(StreamSnapshot::capture(key, &entry));
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub async fn stream(&self, key: &StreamKey) -> Option<StreamSnapshot> {
        let streams = self.streams.read().await;
        let entry = streams.get(key)?.read().await;
        Some(StreamSnapshot::capture(key, &entry))
    }

    /// Standing metadata and sequence headers, used when a player unpauses
    pub async fn sequence_headers(&self, key: &StreamKey) -> Vec<Packet> {
        let streams = self.streams.read().await;
        match streams.get(key) {
            Some(entry_arc) => entry_arc.read().await.gop.headers(),
            None => Vec::new(),
        }
    }

    pub async fn stream_count(&self) -> usize {
        self.streams.read().await.len()
    }

    /// Run one cleanup pass
    ///
    /// Removes streams whose grace period has expired, placeholders that
    /// waited longer than `idle_stream_timeout`, and streams nobody holds.
    pub async fn cleanup(&self) {
        let mut streams = self.streams.write().await;
        let now = Instant::now();

        let mut removals = Vec::new();
        for (key, entry_arc) in streams.iter() {
            // Busy entries are looked at next pass
            let Ok(mut entry) = entry_arc.try_write() else {
                continue;
            };
            entry.prune_closed();

            let expired = match entry.state {
                StreamState::Active => false,
                StreamState::GracePeriod => entry
                    .publisher_disconnected_at
                    .map(|at| now.duration_since(at) >= self.config.publisher_grace_period)
                    .unwrap_or(true),
                StreamState::Idle => {
                    entry.subscribers.is_empty()
                        || now.duration_since(entry.created_at) >= self.config.idle_stream_timeout
                }
            };

            if expired {
                let closed = entry.close_all(CloseReason::StreamEnded);
                tracing::info!(
                    stream = %key,
                    state = ?entry.state,
                    subscribers_closed = closed,
                    "Stream removed by cleanup"
                );
                removals.push(key.clone());
            }
        }

        for key in removals {
            streams.remove(&key);
        }
    }

    /// Spawn the periodic cleanup task
    ///
    /// Abort the returned handle at shutdown.
    pub fn spawn_cleanup_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = registry.config.cleanup_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                registry.cleanup().await;
            }
        })
    }

    fn attach(
        &self,
        key: &StreamKey,
        entry: &mut StreamEntry,
        capabilities: Capabilities,
    ) -> Subscription {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (slot, subscription) = subscriber::channel(
            id,
            key.clone(),
            capabilities,
            self.config.subscriber_queue_depth,
            entry.gop.snapshot(),
        );
        entry.subscribers.push(slot);

        tracing::info!(
            stream = %key,
            subscriber_id = id,
            subscribers = entry.subscriber_count(),
            catchup = subscription.pending_catchup(),
            "Subscriber added"
        );
        subscription
    }

    async fn detach(&self, key: &StreamKey, id: SubscriberId, reason: Option<CloseReason>) -> bool {
        let mut streams = self.streams.write().await;
        let Some(entry_arc) = streams.get(key).cloned() else {
            return false;
        };

        let mut entry = entry_arc.write().await;
        let removed = match entry.take_subscriber(id) {
            Some(slot) => {
                if let Some(reason) = reason {
                    slot.close(reason);
                    tracing::warn!(stream = %key, subscriber_id = id, reason = %reason, "Subscriber closed");
                } else {
                    tracing::debug!(stream = %key, subscriber_id = id, "Subscriber removed");
                }
                true
            }
            None => false,
        };

        if entry.is_abandoned() {
            drop(entry);
            streams.remove(key);
            tracing::info!(stream = %key, "Stream removed, no publisher or subscribers");
        }
        removed
    }

    /// Clear the publisher slot; returns whether the stream must go
    fn vacate(&self, key: &StreamKey, entry: &mut StreamEntry) -> bool {
        let session_id = entry.publisher.take().map(|p| p.session_id);
        entry.publisher_disconnected_at = Some(Instant::now());

        if self.config.keep_after_publisher_end {
            entry.state = StreamState::GracePeriod;
            tracing::info!(
                stream = %key,
                session_id = ?session_id,
                subscribers = entry.subscriber_count(),
                grace_period_ms = self.config.publisher_grace_period.as_millis() as u64,
                "Publisher left, entering grace period"
            );
            false
        } else {
            let closed = entry.close_all(CloseReason::StreamEnded);
            tracing::info!(
                stream = %key,
                session_id = ?session_id,
                subscribers_closed = closed,
                "Publisher left, stream removed"
            );
            true
        }
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn remove_if_same(streams: &mut HashMap<StreamKey, EntryRef>, key: &StreamKey, entry: &EntryRef) {
    if streams.get(key).is_some_and(|current| Arc::ptr_eq(current, entry)) {
        streams.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    fn video_header() -> Packet {
        Packet::video(0, Bytes::from_static(&[0x17, 0x00, 0x00, 0x00, 0x00]))
    }

    fn keyframe(ts: u32) -> Packet {
        Packet::video(ts, Bytes::from_static(&[0x17, 0x01, 0x00, 0x00, 0x00]))
    }

    fn delta(ts: u32) -> Packet {
        Packet::video(ts, Bytes::from_static(&[0x27, 0x01, 0x00, 0x00, 0x00]))
    }

    fn key() -> StreamKey {
        StreamKey::new("live", "test_stream")
    }

    fn drain(sub: &mut Subscription) -> Vec<Packet> {
        let mut out = Vec::new();
        while let Ok(Some(p)) = sub.try_recv() {
            out.push(p);
        }
        out
    }

    #[tokio::test]
    async fn test_second_publisher_rejected() {
        let registry = StreamRegistry::new();
        let _first = assert_ok!(registry.acquire_publisher(&key(), 1).await);

        let err = assert_err!(registry.acquire_publisher(&key(), 2).await);
        assert_eq!(err, RegistryError::AlreadyPublishing(key()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_publish_single_winner() {
        let registry = Arc::new(StreamRegistry::new());
        let mut tasks = Vec::new();
        for session_id in 0..16u64 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                registry.acquire_publisher(&key(), session_id).await
            }));
        }

        let mut winners = Vec::new();
        let mut rejected = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(publisher) => winners.push(publisher),
                Err(RegistryError::AlreadyPublishing(_)) => rejected += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(winners.len(), 1);
        assert_eq!(rejected, 15);
    }

    #[tokio::test]
    async fn test_late_joiner_gets_gop_then_live() {
        let registry = StreamRegistry::new();
        let publisher = registry.acquire_publisher(&key(), 1).await.unwrap();

        publisher.send(video_header()).await.unwrap();
        publisher.send(delta(1)).await.unwrap(); // before any keyframe
        publisher.send(keyframe(10)).await.unwrap();
        for ts in 11..15 {
            publisher.send(delta(ts)).await.unwrap();
        }

        let mut sub = registry.subscribe(&key(), Capabilities::all()).await.unwrap();
        for ts in 15..20 {
            publisher.send(delta(ts)).await.unwrap();
        }

        let received = drain(&mut sub);
        assert_eq!(received[0], video_header());
        let ts: Vec<u32> = received[1..].iter().map(|p| p.timestamp).collect();
        assert_eq!(ts, (10..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_new_gop_boundary_in_cache() {
        let registry = StreamRegistry::new();
        let publisher = registry.acquire_publisher(&key(), 1).await.unwrap();

        publisher.send(video_header()).await.unwrap();
        publisher.send(keyframe(0)).await.unwrap();
        publisher.send(delta(1)).await.unwrap();
        publisher.send(delta(2)).await.unwrap();
        publisher.send(keyframe(3)).await.unwrap();

        let mut sub = registry.subscribe(&key(), Capabilities::all()).await.unwrap();
        assert_eq!(drain(&mut sub), vec![video_header(), keyframe(3)]);
    }

    #[tokio::test]
    async fn test_subscribers_joining_at_different_times() {
        let registry = StreamRegistry::new();
        let publisher = registry.acquire_publisher(&key(), 1).await.unwrap();
        publisher.send(video_header()).await.unwrap();
        publisher.send(keyframe(0)).await.unwrap();

        let mut early = registry.subscribe(&key(), Capabilities::all()).await.unwrap();
        for ts in 1..5 {
            publisher.send(delta(ts)).await.unwrap();
        }
        publisher.send(keyframe(5)).await.unwrap();
        publisher.send(delta(6)).await.unwrap();

        let mut late = registry.subscribe(&key(), Capabilities::all()).await.unwrap();
        for ts in 7..10 {
            publisher.send(delta(ts)).await.unwrap();
        }

        let early_ts: Vec<u32> = drain(&mut early)[1..].iter().map(|p| p.timestamp).collect();
        assert_eq!(early_ts, (0..10).collect::<Vec<_>>());

        let late_ts: Vec<u32> = drain(&mut late)[1..].iter().map(|p| p.timestamp).collect();
        assert_eq!(late_ts, (5..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_slow_subscriber_evicted_fast_unaffected() {
        let config = RegistryConfig::default().subscriber_queue_depth(4);
        let registry = StreamRegistry::with_config(config);
        let publisher = registry.acquire_publisher(&key(), 1).await.unwrap();

        let mut slow = registry.subscribe(&key(), Capabilities::all()).await.unwrap();
        let mut fast = registry.subscribe(&key(), Capabilities::all()).await.unwrap();

        for ts in 0..100 {
            let report = publisher.send(delta(ts)).await.unwrap();
            // fast consumer reads each packet as soon as it is queued
            let got = tokio::time::timeout(Duration::from_millis(100), fast.recv())
                .await
                .expect("fast subscriber stalled")
                .unwrap();
            assert_eq!(got.timestamp, ts);
            if ts == 4 {
                assert_eq!(report.evicted, 1);
            }
        }

        let stalled: Vec<u32> = drain(&mut slow).iter().map(|p| p.timestamp).collect();
        assert_eq!(stalled, vec![0, 1, 2, 3]);
        assert_eq!(slow.recv().await, Err(CloseReason::Overrun));

        let snapshot = registry.stream(&key()).await.unwrap();
        assert_eq!(snapshot.subscriber_count, 1);
    }

    #[tokio::test]
    async fn test_publisher_end_without_keep_policy() {
        let config = RegistryConfig::default().keep_after_publisher_end(false);
        let registry = StreamRegistry::with_config(config);
        let publisher = registry.acquire_publisher(&key(), 1).await.unwrap();
        let mut sub = registry.subscribe(&key(), Capabilities::all()).await.unwrap();

        publisher.send(keyframe(0)).await.unwrap();
        registry.release_publisher(&publisher).await.unwrap();

        assert!(registry.list_streams().await.is_empty());
        // Already queued packets are still delivered before the close
        assert_eq!(sub.recv().await.unwrap(), keyframe(0));
        assert_eq!(sub.recv().await, Err(CloseReason::StreamEnded));
    }

    #[tokio::test]
    async fn test_publisher_end_with_keep_policy() {
        let config = RegistryConfig::default().publisher_grace_period(Duration::from_millis(50));
        let registry = StreamRegistry::with_config(config);
        let publisher = registry.acquire_publisher(&key(), 1).await.unwrap();
        let mut early = registry.subscribe(&key(), Capabilities::all()).await.unwrap();

        publisher.send(video_header()).await.unwrap();
        publisher.send(keyframe(0)).await.unwrap();
        registry.release_publisher(&publisher).await.unwrap();

        let snapshot = registry.stream(&key()).await.unwrap();
        assert_eq!(snapshot.state, StreamState::GracePeriod);
        assert_eq!(snapshot.subscriber_count, 1);

        // Late subscriber still served from the cache
        let mut late = registry.subscribe(&key(), Capabilities::all()).await.unwrap();
        assert_eq!(drain(&mut late), vec![video_header(), keyframe(0)]);

        // Grace not yet expired
        registry.cleanup().await;
        assert_eq!(registry.stream_count().await, 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        registry.cleanup().await;
        assert_eq!(registry.stream_count().await, 0);

        assert_eq!(drain(&mut early).len(), 2);
        assert_eq!(early.recv().await, Err(CloseReason::StreamEnded));
    }

    #[tokio::test]
    async fn test_publisher_reclaims_grace_period_stream() {
        let registry = StreamRegistry::new();
        let first = registry.acquire_publisher(&key(), 1).await.unwrap();
        let mut sub = registry.subscribe(&key(), Capabilities::all()).await.unwrap();
        registry.release_publisher(&first).await.unwrap();

        let second = registry.acquire_publisher(&key(), 2).await.unwrap();
        second.send(keyframe(100)).await.unwrap();

        assert_eq!(sub.recv().await.unwrap(), keyframe(100));
        let snapshot = registry.stream(&key()).await.unwrap();
        assert_eq!(snapshot.publisher_session, Some(2));
        assert_eq!(snapshot.state, StreamState::Active);

        // The stale handle can neither publish nor release
        assert_eq!(
            first.send(delta(1)).await,
            Err(RegistryError::PublisherEvicted(key()))
        );
        assert_eq!(
            registry.release_publisher(&first).await,
            Err(RegistryError::PublisherMismatch(key()))
        );
    }

    #[tokio::test]
    async fn test_reclaim_keeps_timestamps_monotonic() {
        let registry = StreamRegistry::new();
        let first = registry.acquire_publisher(&key(), 1).await.unwrap();
        let mut sub = registry.subscribe(&key(), Capabilities::all()).await.unwrap();
        first.send(keyframe(5000)).await.unwrap();
        first.send(delta(5033)).await.unwrap();
        registry.release_publisher(&first).await.unwrap();

        // Restarted encoder begins again near zero
        let second = registry.acquire_publisher(&key(), 2).await.unwrap();
        second.send(keyframe(0)).await.unwrap();
        second.send(delta(33)).await.unwrap();

        let ts: Vec<u32> = drain(&mut sub).iter().map(|p| p.timestamp).collect();
        assert_eq!(ts, vec![5000, 5033, 5033, 5066]);

        // Late joiners see the same rebased clock
        let mut late = registry.subscribe(&key(), Capabilities::all()).await.unwrap();
        let ts: Vec<u32> = drain(&mut late).iter().map(|p| p.timestamp).collect();
        assert_eq!(ts, vec![5033, 5066]);

        // A third publisher is rebased onto the second one's timeline
        registry.release_publisher(&second).await.unwrap();
        let third = registry.acquire_publisher(&key(), 3).await.unwrap();
        third.send(keyframe(10)).await.unwrap();
        assert_eq!(sub.recv().await.unwrap().timestamp, 5066);
    }

    #[tokio::test]
    async fn test_reclaim_ahead_of_previous_clock_is_untouched() {
        let registry = StreamRegistry::new();
        let first = registry.acquire_publisher(&key(), 1).await.unwrap();
        let mut sub = registry.subscribe(&key(), Capabilities::all()).await.unwrap();
        first.send(keyframe(100)).await.unwrap();
        registry.release_publisher(&first).await.unwrap();

        let second = registry.acquire_publisher(&key(), 2).await.unwrap();
        second.send(keyframe(900)).await.unwrap();

        let ts: Vec<u32> = drain(&mut sub).iter().map(|p| p.timestamp).collect();
        assert_eq!(ts, vec![100, 900]);
    }

    #[tokio::test]
    async fn test_evict_publisher() {
        let registry = StreamRegistry::new();
        let publisher = registry.acquire_publisher(&key(), 7).await.unwrap();

        assert_eq!(registry.evict_publisher(&key()).await, Ok(7));
        assert_eq!(
            publisher.send(keyframe(0)).await,
            Err(RegistryError::PublisherEvicted(key()))
        );
        // Slot is free again
        assert_ok!(registry.acquire_publisher(&key(), 8).await);
    }

    #[tokio::test]
    async fn test_evict_subscriber() {
        let registry = StreamRegistry::new();
        let publisher = registry.acquire_publisher(&key(), 1).await.unwrap();
        let mut sub = registry.subscribe(&key(), Capabilities::all()).await.unwrap();

        assert!(registry.evict_subscriber(&key(), sub.id()).await);
        assert!(!registry.evict_subscriber(&key(), sub.id()).await);
        assert_eq!(sub.recv().await, Err(CloseReason::Evicted));

        let report = publisher.send(keyframe(0)).await.unwrap();
        assert_eq!(report, FanOut::default());
    }

    #[tokio::test]
    async fn test_subscribe_missing_stream() {
        let registry = StreamRegistry::new();
        let err = assert_err!(registry.subscribe(&key(), Capabilities::all()).await);
        assert_eq!(err, RegistryError::StreamNotFound(key()));
    }

    #[tokio::test]
    async fn test_play_before_publish_placeholder() {
        let config = RegistryConfig::default().allow_play_before_publish(true);
        let registry = StreamRegistry::with_config(config);

        let mut sub = registry.subscribe(&key(), Capabilities::all()).await.unwrap();
        let snapshot = registry.stream(&key()).await.unwrap();
        assert_eq!(snapshot.state, StreamState::Idle);
        assert!(!snapshot.has_publisher());

        let publisher = registry.acquire_publisher(&key(), 1).await.unwrap();
        publisher.send(keyframe(0)).await.unwrap();
        assert_eq!(sub.recv().await.unwrap(), keyframe(0));
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_abandoned_placeholder() {
        let config = RegistryConfig::default().allow_play_before_publish(true);
        let registry = StreamRegistry::with_config(config);

        let sub = registry.subscribe(&key(), Capabilities::all()).await.unwrap();
        assert_eq!(registry.stream_count().await, 1);
        registry.unsubscribe(sub).await;
        assert_eq!(registry.stream_count().await, 0);
    }

    #[tokio::test]
    async fn test_capability_filtering_applies_to_catchup_and_live() {
        let registry = StreamRegistry::new();
        let publisher = registry.acquire_publisher(&key(), 1).await.unwrap();
        let audio_header = Packet::audio(0, Bytes::from_static(&[0xAF, 0x00, 0x12, 0x10]));
        publisher.send(video_header()).await.unwrap();
        publisher.send(audio_header.clone()).await.unwrap();
        publisher.send(keyframe(0)).await.unwrap();

        let caps = Capabilities {
            video: false,
            audio: true,
        };
        let mut sub = registry.subscribe(&key(), caps).await.unwrap();
        publisher.send(delta(1)).await.unwrap();
        let frame = Packet::audio(2, Bytes::from_static(&[0xAF, 0x01, 0x00]));
        publisher.send(frame.clone()).await.unwrap();

        assert_eq!(drain(&mut sub), vec![audio_header, frame]);
    }

    #[tokio::test]
    async fn test_release_session_frees_publisher_slot() {
        let config = RegistryConfig::default().keep_after_publisher_end(false);
        let registry = StreamRegistry::with_config(config);
        let other = StreamKey::new("live", "other");

        let _publisher = registry.acquire_publisher(&key(), 42).await.unwrap();
        let _unrelated = registry.acquire_publisher(&other, 43).await.unwrap();

        assert_eq!(registry.release_session(42).await, 1);
        let streams = registry.list_streams().await;
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].key, other);

        assert_ok!(registry.acquire_publisher(&key(), 44).await);
    }

    #[tokio::test]
    async fn test_dropped_subscription_pruned() {
        let registry = StreamRegistry::new();
        let publisher = registry.acquire_publisher(&key(), 1).await.unwrap();
        let sub = registry.subscribe(&key(), Capabilities::all()).await.unwrap();
        drop(sub);

        let report = publisher.send(keyframe(0)).await.unwrap();
        assert_eq!(report.delivered, 0);
        assert_eq!(registry.stream(&key()).await.unwrap().subscriber_count, 0);
    }

    #[tokio::test]
    async fn test_snapshot_liveness_fields() {
        let registry = StreamRegistry::new();
        let publisher = registry.acquire_publisher(&key(), 1).await.unwrap();
        assert!(registry.stream(&key()).await.unwrap().last_packet_at.is_none());

        publisher.send(keyframe(0)).await.unwrap();
        publisher.send(delta(1)).await.unwrap();

        let snapshot = registry.stream(&key()).await.unwrap();
        assert_eq!(snapshot.packets_published, 2);
        assert_eq!(snapshot.gop_packets, 2);
        assert!(!snapshot.gop_degraded);
        assert!(snapshot.last_packet_at.is_some());
    }
}
