//! Process-local publish/subscribe bus for trade signals.
//!
//! Delivery contract:
//! - every subscriber on a channel gets each signal at most once, in publication order
//! - nothing is buffered for subscribers that are not registered at publish time
//! - publishing never waits on a subscriber; each one owns an unbounded queue,
//!   so a slow reader only delays itself

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::models::TradeSignal;

/// Identifier of a single subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

type Listener = (SubscriptionId, mpsc::UnboundedSender<TradeSignal>);

struct BusInner {
    channels: RwLock<HashMap<String, Vec<Listener>>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<Listener>>> {
        self.channels.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<Listener>>> {
        self.channels.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        let mut channels = self.write();
        let mut removed = false;

        for listeners in channels.values_mut() {
            let before = listeners.len();
            listeners.retain(|(sub, _)| *sub != id);
            removed |= listeners.len() != before;
        }
        channels.retain(|_, listeners| !listeners.is_empty());

        removed
    }
}

/// Cheaply cloneable handle to a shared signal bus.
#[derive(Clone)]
pub struct SignalBus {
    inner: Arc<BusInner>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                channels: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a listener on `channel`.
    pub fn subscribe(&self, channel: &str) -> Subscription {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();

        self.inner
            .write()
            .entry(channel.to_string())
            .or_default()
            .push((id, tx));

        debug!(channel = %channel, subscription = %id, "Subscribed to signal channel");

        Subscription {
            id,
            channel: channel.to_string(),
            receiver: rx,
            bus: Arc::downgrade(&self.inner),
            active: true,
        }
    }

    /// Hand `signal` to every listener currently subscribed on `channel`.
    ///
    /// Returns the number of listeners reached. With no listener the signal is
    /// dropped.
    pub fn publish(&self, channel: &str, signal: TradeSignal) -> usize {
        let mut channels = self.inner.write();

        let Some(listeners) = channels.get_mut(channel) else {
            debug!(channel = %channel, signal = %signal.id, "No subscribers, signal dropped");
            return 0;
        };

        listeners.retain(|(_, tx)| !tx.is_closed());

        let mut delivered = 0;
        for (id, tx) in listeners.iter() {
            if tx.send(signal.clone()).is_ok() {
                trace!(subscription = %id, signal = %signal.id, "Signal queued");
                delivered += 1;
            }
        }

        debug!(
            channel = %channel,
            signal = %signal.id,
            kind = ?signal.kind,
            delivered = delivered,
            "Signal published"
        );

        delivered
    }

    /// Remove a listener. Idempotent: returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.inner.remove(id);
        if removed {
            debug!(subscription = %id, "Unsubscribed from signal channel");
        }
        removed
    }

    /// Number of live listeners on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .read()
            .get(channel)
            .map(|listeners| listeners.iter().filter(|(_, tx)| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of a subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriptionId,
    channel: String,
    receiver: mpsc::UnboundedReceiver<TradeSignal>,
    bus: Weak<BusInner>,
    active: bool,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next signal in publication order. Yields `None` once unsubscribed and
    /// drained.
    pub async fn recv(&mut self) -> Option<TradeSignal> {
        self.receiver.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<TradeSignal> {
        self.receiver.try_recv().ok()
    }

    /// Stop receiving new signals. Safe to call any number of times, including
    /// after the bus itself is gone.
    pub fn unsubscribe(&mut self) -> bool {
        if !self.active {
            return false;
        }
        self.active = false;
        self.receiver.close();

        match self.bus.upgrade() {
            Some(inner) => inner.remove(self.id),
            None => false,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
