//! Per-stream state
//!
//! Everything about one stream lives behind that stream's own lock: the GOP
//! cache, the publisher slot and the subscriber set. Delivery under the lock
//! is a queue handoff only.

use std::time::Instant;

use crate::media::{GopCache, Packet};

use super::config::RegistryConfig;
use super::key::StreamKey;
use super::subscriber::{CloseReason, Offer, SubscriberId, SubscriberSlot};

/// State of a stream entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Stream has an active publisher
    Active,
    /// Publisher left, kept alive for the grace period
    GracePeriod,
    /// Placeholder created by an early player, waiting for a publisher
    Idle,
}

/// Current owner of the publisher slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct PublisherSlot {
    pub(super) session_id: u64,
    /// Unique per acquisition, so a stale handle never matches a reclaim
    pub(super) token: u64,
}

/// Outcome of delivering one packet to the subscriber set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    /// Subscribers the packet was queued for
    pub delivered: usize,
    /// Subscribers evicted because their queue was full
    pub evicted: usize,
}

/// Entry for a single stream in the registry
#[derive(Debug)]
pub(super) struct StreamEntry {
    pub(super) gop: GopCache,
    pub(super) publisher: Option<PublisherSlot>,
    pub(super) subscribers: Vec<SubscriberSlot>,
    pub(super) state: StreamState,
    pub(super) created_at: Instant,
    pub(super) last_packet_at: Option<Instant>,
    pub(super) publisher_disconnected_at: Option<Instant>,
    pub(super) packets_published: u64,
    /// Timestamp of the last packet fanned out, after rebasing
    pub(super) last_timestamp: Option<u32>,
    /// Added to every timestamp of the current publisher
    pub(super) timestamp_offset: u32,
    rebase_pending: bool,
}

impl StreamEntry {
    pub(super) fn new(config: &RegistryConfig) -> Self {
        Self {
            gop: GopCache::new(config.max_gop_packets),
            publisher: None,
            subscribers: Vec::new(),
            state: StreamState::Idle,
            created_at: Instant::now(),
            last_packet_at: None,
            publisher_disconnected_at: None,
            packets_published: 0,
            last_timestamp: None,
            timestamp_offset: 0,
            rebase_pending: false,
        }
    }

    /// A new publisher took over; its clock starts wherever its encoder says
    ///
    /// The first packet it sends decides the offset that keeps existing
    /// subscribers from seeing time go backwards.
    pub(super) fn begin_publisher(&mut self) {
        self.timestamp_offset = 0;
        self.rebase_pending = self.last_timestamp.is_some();
    }

    fn rebase(&mut self, packet: &mut Packet) {
        if std::mem::take(&mut self.rebase_pending) {
            if let Some(last) = self.last_timestamp {
                if packet.timestamp < last {
                    self.timestamp_offset = last.wrapping_sub(packet.timestamp);
                }
            }
        }
        packet.timestamp = packet.timestamp.wrapping_add(self.timestamp_offset);
        self.last_timestamp = Some(packet.timestamp);
    }

    pub(super) fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Nothing holds this stream open any more
    pub(super) fn is_abandoned(&self) -> bool {
        self.publisher.is_none()
            && self.subscribers.is_empty()
            && self.state != StreamState::GracePeriod
    }

    /// Cache the packet and queue it for every subscriber that wants it
    pub(super) fn publish(&mut self, key: &StreamKey, mut packet: Packet) -> FanOut {
        self.rebase(&mut packet);
        self.last_packet_at = Some(Instant::now());
        self.packets_published += 1;

        let mut report = FanOut::default();
        self.subscribers.retain(|slot| match slot.offer(&packet) {
            Offer::Delivered => {
                report.delivered += 1;
                true
            }
            Offer::Skipped => true,
            Offer::Overrun => {
                slot.close(CloseReason::Overrun);
                report.evicted += 1;
                false
            }
            Offer::Gone => {
                tracing::debug!(stream = %key, subscriber_id = slot.id, "Subscriber dropped");
                false
            }
        });

        if report.evicted > 0 {
            tracing::warn!(
                stream = %key,
                evicted = report.evicted,
                remaining = self.subscribers.len(),
                "Evicted slow subscribers"
            );
        }

        if self.gop.push(packet) {
            tracing::warn!(
                stream = %key,
                cached = self.gop.len(),
                "GOP cache full, fast-join degraded until next keyframe"
            );
        }

        report
    }

    pub(super) fn take_subscriber(&mut self, id: SubscriberId) -> Option<SubscriberSlot> {
        let idx = self.subscribers.iter().position(|s| s.id == id)?;
        Some(self.subscribers.remove(idx))
    }

    /// Close every subscriber (stream teardown)
    pub(super) fn close_all(&mut self, reason: CloseReason) -> usize {
        let count = self.subscribers.len();
        for slot in self.subscribers.drain(..) {
            slot.close(reason);
        }
        count
    }

    /// Drop slots whose consumer has gone away
    pub(super) fn prune_closed(&mut self) {
        self.subscribers.retain(|s| !s.is_closed());
    }
}

/// Point-in-time view of a stream for introspection
#[derive(Debug, Clone)]
pub struct StreamSnapshot {
    pub key: StreamKey,
    pub state: StreamState,
    pub publisher_session: Option<u64>,
    pub subscriber_count: usize,
    pub gop_packets: usize,
    pub gop_degraded: bool,
    pub packets_published: u64,
    pub created_at: Instant,
    pub last_packet_at: Option<Instant>,
}

impl StreamSnapshot {
    pub(super) fn capture(key: &StreamKey, entry: &StreamEntry) -> Self {
        Self {
            key: key.clone(),
            state: entry.state,
            publisher_session: entry.publisher.map(|p| p.session_id),
            subscriber_count: entry.subscribers.len(),
            gop_packets: entry.gop.len(),
            gop_degraded: entry.gop.is_degraded(),
            packets_published: entry.packets_published,
            created_at: entry.created_at,
            last_packet_at: entry.last_packet_at,
        }
    }

    pub fn has_publisher(&self) -> bool {
        self.publisher_session.is_some()
    }
}
