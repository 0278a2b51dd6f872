//! Subscriber handles
//!
//! Each subscriber owns a bounded `mpsc` queue. The publisher side only ever
//! calls `try_send`; the subscriber's own task does the slow transport write.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::media::{Packet, PacketKind};

use super::key::StreamKey;

/// Registry-wide unique subscriber handle id
pub type SubscriberId = u64;

/// What a subscriber wants delivered; metadata is always delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub video: bool,
    pub audio: bool,
}

impl Capabilities {
    pub const fn all() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }

    pub const fn metadata_only() -> Self {
        Self {
            video: false,
            audio: false,
        }
    }

    pub fn wants(&self, packet: &Packet) -> bool {
        match packet.kind {
            PacketKind::Video => self.video,
            PacketKind::Audio => self.audio,
            PacketKind::Metadata => true,
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::all()
    }
}

/// Why a subscription stopped delivering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CloseReason {
    /// Queue was full when the publisher tried to deliver
    #[error("subscriber overrun")]
    Overrun,
    /// Publisher left and the stream was torn down
    #[error("stream ended")]
    StreamEnded,
    /// Removed by an administrator
    #[error("subscriber evicted")]
    Evicted,
}

/// Registry-side end of a subscription
#[derive(Debug)]
pub(super) struct SubscriberSlot {
    pub(super) id: SubscriberId,
    pub(super) capabilities: Capabilities,
    tx: mpsc::Sender<Packet>,
    reason: Arc<OnceLock<CloseReason>>,
}

/// Result of offering a packet to one slot
pub(super) enum Offer {
    Delivered,
    Skipped,
    Overrun,
    Gone,
}

impl SubscriberSlot {
    pub(super) fn offer(&self, packet: &Packet) -> Offer {
        if !self.capabilities.wants(packet) {
            return Offer::Skipped;
        }
        match self.tx.try_send(packet.clone()) {
            Ok(()) => Offer::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => Offer::Overrun,
            Err(mpsc::error::TrySendError::Closed(_)) => Offer::Gone,
        }
    }

    /// Record the reason; the channel closes once the slot is dropped
    pub(super) fn close(&self, reason: CloseReason) {
        let _ = self.reason.set(reason);
    }

    pub(super) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer end of a subscription
///
/// Yields the join-time snapshot first, then live packets. Once the
/// registry drops the slot, every packet already queued is still delivered
/// before `recv` reports the close reason.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    key: StreamKey,
    capabilities: Capabilities,
    catchup: VecDeque<Packet>,
    rx: mpsc::Receiver<Packet>,
    reason: Arc<OnceLock<CloseReason>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Catch-up packets not yet consumed
    pub fn pending_catchup(&self) -> usize {
        self.catchup.len()
    }

    /// Next packet, or why delivery ended
    ///
    /// Cancel safe.
    pub async fn recv(&mut self) -> Result<Packet, CloseReason> {
        if let Some(packet) = self.catchup.pop_front() {
            return Ok(packet);
        }
        match self.rx.recv().await {
            Some(packet) => Ok(packet),
            None => Err(self.close_reason()),
        }
    }

    /// Non-blocking variant: `Ok(None)` when nothing is queued yet
    pub fn try_recv(&mut self) -> Result<Option<Packet>, CloseReason> {
        if let Some(packet) = self.catchup.pop_front() {
            return Ok(Some(packet));
        }
        match self.rx.try_recv() {
            Ok(packet) => Ok(Some(packet)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(self.close_reason()),
        }
    }

    fn close_reason(&self) -> CloseReason {
        // Slot dropped without a recorded reason: the registry went away
        self.reason.get().copied().unwrap_or(CloseReason::StreamEnded)
    }
}

/// Build both ends of a subscription
pub(super) fn channel(
    id: SubscriberId,
    key: StreamKey,
    capabilities: Capabilities,
    depth: usize,
    catchup: Vec<Packet>,
) -> (SubscriberSlot, Subscription) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    let reason = Arc::new(OnceLock::new());
    let slot = SubscriberSlot {
        id,
        capabilities,
        tx,
        reason: Arc::clone(&reason),
    };
    let catchup = catchup
        .into_iter()
        .filter(|p| capabilities.wants(p))
        .collect();
    let subscription = Subscription {
        id,
        key,
        capabilities,
        catchup,
        rx,
        reason,
    };
    (slot, subscription)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn video(ts: u32) -> Packet {
        Packet::video(ts, Bytes::from_static(&[0x27, 0x01]))
    }

    fn audio(ts: u32) -> Packet {
        Packet::audio(ts, Bytes::from_static(&[0xAF, 0x01]))
    }

    #[tokio::test]
    async fn test_catchup_then_live_then_reason() {
        let key = StreamKey::new("live", "s");
        let (slot, mut sub) = channel(1, key, Capabilities::all(), 4, vec![video(0), video(1)]);

        assert!(matches!(slot.offer(&video(2)), Offer::Delivered));
        slot.close(CloseReason::Evicted);
        drop(slot);

        assert_eq!(sub.recv().await.unwrap().timestamp, 0);
        assert_eq!(sub.recv().await.unwrap().timestamp, 1);
        assert_eq!(sub.recv().await.unwrap().timestamp, 2);
        assert_eq!(sub.recv().await, Err(CloseReason::Evicted));
    }

    #[test]
    fn test_capability_filter() {
        let key = StreamKey::new("live", "s");
        let meta = Packet::metadata(0, Bytes::from_static(b"m"));
        let caps = Capabilities {
            video: false,
            audio: true,
        };
        let (slot, mut sub) = channel(1, key, caps, 4, vec![meta.clone(), video(0), audio(1)]);
        assert_eq!(sub.pending_catchup(), 2);

        assert!(matches!(slot.offer(&video(2)), Offer::Skipped));
        assert!(matches!(slot.offer(&audio(3)), Offer::Delivered));

        assert_eq!(sub.try_recv().unwrap(), Some(meta));
        assert_eq!(sub.try_recv().unwrap(), Some(audio(1)));
        assert_eq!(sub.try_recv().unwrap(), Some(audio(3)));
        assert_eq!(sub.try_recv().unwrap(), None);
    }

    #[test]
    fn test_full_queue_and_dropped_receiver() {
        let key = StreamKey::new("live", "s");
        let (slot, sub) = channel(1, key, Capabilities::all(), 1, Vec::new());

        assert!(matches!(slot.offer(&video(0)), Offer::Delivered));
        assert!(matches!(slot.offer(&video(1)), Offer::Overrun));

        drop(sub);
        assert!(slot.is_closed());
        assert!(matches!(slot.offer(&video(2)), Offer::Gone));
    }

    #[test]
    fn test_metadata_only_capabilities() {
        let caps = Capabilities::metadata_only();
        assert!(!caps.wants(&video(0)));
        assert!(!caps.wants(&audio(0)));
        assert!(caps.wants(&Packet::metadata(0, Bytes::new())));
    }
}
