//! Multiplexing many trackers into per-subscriber streams.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tidemark_events::Latch;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::stream::{self, EVENT_CHANNEL_CAPACITY, EventStream};
use crate::tracker::TransferTracker;

/// Aggregates live trackers and fans their lifecycle streams out to any
/// number of subscribers, including subscribers that join late.
///
/// Cloning yields another handle to the same registry. Membership mutation
/// and snapshot iteration share one lock, so a tracker is delivered exactly
/// once to each subscriber regardless of interleaving.
#[derive(Clone, Default)]
pub struct FanoutRegistry {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    trackers: HashMap<Uuid, Arc<TransferTracker>>,
    relays: HashMap<Uuid, mpsc::UnboundedSender<Arc<TransferTracker>>>,
}

impl FanoutRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tracker, deliver it to every live subscriber, and retire
    /// it automatically once its transfer closes.
    pub fn add(&self, tracker: &Arc<TransferTracker>) {
        let id = Uuid::new_v4();
        {
            let mut inner = self.lock();
            inner.trackers.insert(id, Arc::clone(tracker));
            // Relays are unbounded: handing a tracker to a subscriber never
            // blocks while the membership lock is held.
            inner
                .relays
                .retain(|_, relay| relay.send(Arc::clone(tracker)).is_ok());
        }
        debug!(
            registration = %id,
            transfer_id = %tracker.transfer().id(),
            "tracker registered"
        );

        let registry = self.clone();
        let closed = tracker.closed();
        tokio::spawn(async move {
            closed.wait().await;
            registry.lock().trackers.remove(&id);
            debug!(registration = %id, "tracker retired");
        });
    }

    /// Open a combined stream over every current and future tracker.
    ///
    /// The current membership is replayed into the stream first; trackers
    /// added later are merged in live. Triggering `cancel` ends the stream
    /// and stops every producer feeding it.
    #[must_use]
    pub fn events(&self, cancel: Latch) -> EventStream {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (relay_tx, mut relay_rx) = mpsc::unbounded_channel();
        let relay_id = Uuid::new_v4();
        {
            // Replay and relay registration under one lock, so a concurrent
            // `add` is either in the snapshot or delivered live, never both.
            let mut inner = self.lock();
            for tracker in inner.trackers.values() {
                let _ = relay_tx.send(Arc::clone(tracker));
            }
            inner.relays.insert(relay_id, relay_tx);
        }
        debug!(relay = %relay_id, "fan-out subscriber registered");

        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    tracker = relay_rx.recv() => match tracker {
                        Some(tracker) => {
                            stream::spawn_driver(tracker, cancel.clone(), tx.clone());
                        }
                        None => break,
                    },
                    () = cancel.wait() => break,
                }
            }
            registry.lock().relays.remove(&relay_id);
            debug!(relay = %relay_id, "fan-out subscriber deregistered");
        });
        EventStream::new(rx)
    }

    /// Number of trackers currently registered.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.lock().trackers.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
