//! Fan-out Hub (§4.3): bounded, per-subscriber channels for decoded audio
//! and spectrum frames, isolated from the Sink Set and from each other.
//!
//! Unlike the teacher's `StreamRegistry` (a single `broadcast::Sender` per
//! stream, so one slow reader's lag affects all), the spec requires that a
//! full subscriber channel drop frames *only for that subscriber* and never
//! back-pressure the decode path or other subscribers (§4.3). A broadcast
//! channel can't give that isolation, so each subscriber gets its own
//! bounded `mpsc` channel, and membership lives in a `DashMap` guarded
//! conceptually by "its own lock" (the map's internal sharding) distinct
//! from the session lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::mpsc;

use crate::frame_codec::PcmFrame;
use crate::spectrum::SpectrumFrame;

/// Opaque subscriber handle returned by `subscribe_audio`/`subscribe_spectrum`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

fn next_id() -> SubscriberId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    SubscriberId(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// Mints an id from the same counter for non-fanout subscriber sets (the
/// Session Manager's own observer registry) that still want the opaque,
/// comparable id shape `SubscriberId` provides.
pub(crate) fn next_subscriber_id() -> SubscriberId {
    next_id()
}

/// Fan-out hub owning both subscriber collections. `Clone` is cheap (Arc
/// internals), matching how the Session Manager and TCI server both hold a
/// handle to the same hub.
#[derive(Clone)]
pub struct FanoutHub {
    inner: Arc<FanoutInner>,
}

struct FanoutInner {
    capacity: usize,
    audio_subscribers: DashMap<SubscriberId, mpsc::Sender<Arc<PcmFrame>>>,
    spectrum_subscribers: DashMap<SubscriberId, mpsc::Sender<Arc<SpectrumFrame>>>,
    /// Non-audio/spectrum clients that still count toward "combined
    /// subscriber count" for on-demand disconnect (e.g. a connected TCI client).
    other_subscribers: std::sync::atomic::AtomicUsize,
    /// Fired after any subscriber departure, so the Session Manager can kick
    /// off the on-demand disconnect debounce window (§4.3) without the hub
    /// needing to know what a "session" is.
    on_departure: SyncMutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl FanoutHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(FanoutInner {
                capacity,
                audio_subscribers: DashMap::new(),
                spectrum_subscribers: DashMap::new(),
                other_subscribers: std::sync::atomic::AtomicUsize::new(0),
                on_departure: SyncMutex::new(None),
            }),
        }
    }

    /// Registers the callback invoked on every subscriber departure. Only
    /// the Session Manager sets this, right after construction.
    pub fn set_on_departure_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.inner.on_departure.lock() = Some(Box::new(hook));
    }

    fn notify_departure(&self) {
        if let Some(hook) = self.inner.on_departure.lock().as_ref() {
            hook();
        }
    }

    pub fn subscribe_audio(&self) -> (SubscriberId, mpsc::Receiver<Arc<PcmFrame>>) {
        let id = next_id();
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        self.inner.audio_subscribers.insert(id, tx);
        (id, rx)
    }

    pub fn subscribe_spectrum(&self) -> (SubscriberId, mpsc::Receiver<Arc<SpectrumFrame>>) {
        let id = next_id();
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        self.inner.spectrum_subscribers.insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe_audio(&self, id: SubscriberId) {
        self.inner.audio_subscribers.remove(&id);
        self.notify_departure();
    }

    pub fn unsubscribe_spectrum(&self, id: SubscriberId) {
        self.inner.spectrum_subscribers.remove(&id);
        self.notify_departure();
    }

    pub fn register_other_subscriber(&self) {
        self.inner.other_subscribers.fetch_add(1, Ordering::SeqCst);
    }

    pub fn unregister_other_subscriber(&self) {
        self.inner.other_subscribers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Combined subscriber count used by the on-demand disconnect check (§4.3).
    pub fn subscriber_count(&self) -> usize {
        self.inner.audio_subscribers.len()
            + self.inner.spectrum_subscribers.len()
            + self.inner.other_subscribers.load(Ordering::SeqCst)
    }

    /// Spectrum-only subscriber count, used to lazily open/close the
    /// Spectrum Session's dedicated WebSocket (§4.4).
    pub fn spectrum_subscriber_count(&self) -> usize {
        self.inner.spectrum_subscribers.len()
    }

    /// Offers a decoded audio frame to every subscriber via non-blocking
    /// send. A full or closed channel only affects that subscriber; closed
    /// subscribers are pruned within this call, matching the spec's
    /// "within the same critical section" requirement without risking a
    /// panic on a closed channel (§9 "Channel-closed panic handling").
    pub fn publish_audio(&self, frame: PcmFrame) {
        let frame = Arc::new(frame);
        let mut dead = Vec::new();
        for entry in self.inner.audio_subscribers.iter() {
            match entry.value().try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Backpressure isolated to this subscriber: drop and continue.
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(*entry.key());
                }
            }
        }
        for id in dead {
            self.inner.audio_subscribers.remove(&id);
        }
    }

    pub fn publish_spectrum(&self, frame: SpectrumFrame) {
        let frame = Arc::new(frame);
        let mut dead = Vec::new();
        for entry in self.inner.spectrum_subscribers.iter() {
            match entry.value().try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(*entry.key());
                }
            }
        }
        for id in dead {
            self.inner.spectrum_subscribers.remove(&id);
        }
    }
}

/// Watches for the on-demand disconnect condition (§4.3): 500ms after any
/// subscriber departure, if the combined count is still zero, signal the
/// caller to tear down the upstream session. Returns `true` if the
/// disconnect should fire.
pub async fn on_demand_disconnect_check(hub: &FanoutHub, debounce: Duration) -> bool {
    tokio::time::sleep(debounce).await;
    hub.subscriber_count() == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_codec::PcmFrame;

    fn sample_frame() -> PcmFrame {
        PcmFrame {
            pcm: vec![0, 0],
            sample_rate: 12000,
            channels: 1,
            rtp_timestamp: 0,
        }
    }

    #[tokio::test]
    async fn full_subscriber_channel_drops_without_affecting_others() {
        let hub = FanoutHub::new(1);
        let (_id_a, mut rx_a) = hub.subscribe_audio();
        let (_id_b, mut rx_b) = hub.subscribe_audio();

        hub.publish_audio(sample_frame());
        hub.publish_audio(sample_frame()); // a's channel (cap=1) is now full

        // b should still receive both frames even though a's second send dropped.
        assert!(rx_b.recv().await.is_some());
        assert!(rx_b.recv().await.is_some());
        assert!(rx_a.recv().await.is_some());
        // a's second frame was dropped, not queued.
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropping_receiver_prunes_subscriber_on_next_publish() {
        let hub = FanoutHub::new(10);
        let (_id, rx) = hub.subscribe_audio();
        drop(rx);
        hub.publish_audio(sample_frame());
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn on_demand_disconnect_fires_when_count_stays_zero() {
        let hub = FanoutHub::new(10);
        let fired = on_demand_disconnect_check(&hub, Duration::from_millis(5)).await;
        assert!(fired);
    }

    #[tokio::test]
    async fn on_demand_disconnect_does_not_fire_with_active_subscriber() {
        let hub = FanoutHub::new(10);
        let (_id, _rx) = hub.subscribe_audio();
        let fired = on_demand_disconnect_check(&hub, Duration::from_millis(5)).await;
        assert!(!fired);
    }
}
