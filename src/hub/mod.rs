pub mod connection;
pub mod messages;
pub mod pump;

pub use connection::{CloseReason, ConnectionControl, ConnectionId, PairFilter};
pub use messages::{ClientRequest, PriceMessage, ServerMessage};
pub use pump::ConnectionPump;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, instrument, warn};

use crate::errors::{AppError, AppResult};
use crate::marketdata::{Pair, PairEntry, PriceStore};

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub outbound_queue: usize,
    pub ping_interval: Duration,
    pub missed_pong_threshold: u32,
    pub write_timeout: Duration,
}

impl HubConfig {
    /// How long a connection may stay silent before it is dropped.
    pub fn keepalive_timeout(&self) -> Duration {
        self.ping_interval * self.missed_pong_threshold
    }
}

/// Everything a pump needs to serve one registered connection.
pub struct Registration {
    pub control: Arc<ConnectionControl>,
    pub outbound: mpsc::Receiver<Arc<str>>,
    pub replies: mpsc::Sender<Arc<str>>,
}

struct Subscriber {
    control: Arc<ConnectionControl>,
    tx: mpsc::Sender<Arc<str>>,
    filter: PairFilter,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub evicted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Applied,
    UnknownPairs(Vec<Pair>),
    NotRegistered,
}

/// Registry of live subscribers and the fan-out path for price updates.
///
/// The registry lock is never held across an await, and enqueueing is always
/// `try_send`: a subscriber whose queue is full is evicted instead of waited on.
pub struct ConnectionHub {
    config: HubConfig,
    store: Arc<PriceStore>,
    registry: Mutex<HashMap<ConnectionId, Subscriber>>,
    accepting: AtomicBool,
    drained: Notify,
}

impl ConnectionHub {
    pub fn new(config: HubConfig, store: Arc<PriceStore>) -> Self {
        Self {
            config,
            store,
            registry: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            drained: Notify::new(),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.lock().is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.registry.lock().contains_key(&id)
    }

    /// Adds a subscriber and queues its initial snapshot. The snapshot is taken
    /// and queued under the registry lock, so no broadcast can reach the
    /// connection ahead of it.
    pub fn register(&self, filter: PairFilter) -> AppResult<Registration> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(AppError::Server("hub is shutting down".into()));
        }

        let id = ConnectionId::new();
        let control = Arc::new(ConnectionControl::new(id));
        let (tx, outbound) = mpsc::channel(self.config.outbound_queue);

        {
            let mut registry = self.registry.lock();
            let snapshot = self.snapshot_message(&filter);
            tx.try_send(snapshot)
                .map_err(|_| AppError::Server("unable to queue initial snapshot".into()))?;
            registry.insert(
                id,
                Subscriber {
                    control: Arc::clone(&control),
                    tx: tx.clone(),
                    filter,
                },
            );
            debug!(conn = %id, connections = registry.len(), "connection registered");
        }

        Ok(Registration {
            control,
            outbound,
            replies: tx,
        })
    }

    /// Removes a subscriber. Safe to call any number of times.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let mut registry = self.registry.lock();
        let removed = registry.remove(&id).is_some();
        if removed {
            debug!(conn = %id, connections = registry.len(), "connection unregistered");
        }
        if registry.is_empty() {
            self.drained.notify_waiters();
        }
        removed
    }

    /// Replaces a subscriber's pair filter, then queues an acknowledgement and
    /// a snapshot of the newly selected pairs.
    pub fn resubscribe(&self, id: ConnectionId, pairs: Vec<Pair>) -> SubscribeOutcome {
        let unknown: Vec<Pair> = pairs
            .iter()
            .filter(|pair| !self.store.contains(pair))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return SubscribeOutcome::UnknownPairs(unknown);
        }

        let mut registry = self.registry.lock();
        let Some(subscriber) = registry.get_mut(&id) else {
            return SubscribeOutcome::NotRegistered;
        };

        let mut selected = pairs;
        selected.sort();
        selected.dedup();
        subscriber.filter = PairFilter::from_pairs(selected.clone());

        let ack = ServerMessage::Subscribed { pairs: selected }.encode();
        let snapshot = self.snapshot_message(&subscriber.filter);
        let queued = subscriber.tx.try_send(ack).is_ok() && subscriber.tx.try_send(snapshot).is_ok();
        if !queued {
            if let Some(evicted) = registry.remove(&id) {
                self.evict(&evicted);
            }
            if registry.is_empty() {
                self.drained.notify_waiters();
            }
            return SubscribeOutcome::NotRegistered;
        }
        SubscribeOutcome::Applied
    }

    /// Queues one message per updated pair on every matching subscriber.
    /// Never waits: a subscriber that cannot take a message is evicted.
    #[instrument(skip_all, fields(pairs = updates.len()))]
    pub fn broadcast(&self, updates: &[(Pair, Arc<PairEntry>)]) -> BroadcastReport {
        let messages: Vec<(&Pair, Arc<str>)> = updates
            .iter()
            .filter_map(|(pair, entry)| {
                PriceMessage::from_entry(pair, entry)
                    .map(|msg| (pair, ServerMessage::Price(msg).encode()))
            })
            .collect();

        let mut report = BroadcastReport::default();
        if messages.is_empty() {
            return report;
        }

        let mut registry = self.registry.lock();
        let mut slow = Vec::new();
        let mut gone = Vec::new();
        for (id, subscriber) in registry.iter() {
            for (pair, text) in &messages {
                if !subscriber.filter.matches(pair) {
                    continue;
                }
                match subscriber.tx.try_send(Arc::clone(text)) {
                    Ok(()) => report.delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        slow.push(*id);
                        break;
                    }
                    // the pump already exited and will unregister on its own
                    Err(TrySendError::Closed(_)) => {
                        gone.push(*id);
                        break;
                    }
                }
            }
        }

        for id in slow {
            if let Some(subscriber) = registry.remove(&id) {
                self.evict(&subscriber);
                report.evicted += 1;
            }
        }
        for id in &gone {
            registry.remove(id);
        }
        if (report.evicted > 0 || !gone.is_empty()) && registry.is_empty() {
            self.drained.notify_waiters();
        }
        report
    }

    /// Stops accepting connections, asks every subscriber to close normally and
    /// waits up to `grace` for them to finish. Returns how many had to be
    /// force-closed.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.accepting.store(false, Ordering::Release);

        let controls: Vec<Arc<ConnectionControl>> = self
            .registry
            .lock()
            .values()
            .map(|s| Arc::clone(&s.control))
            .collect();
        info!(connections = controls.len(), "closing subscriber connections");
        for control in &controls {
            control.request_close(CloseReason::Shutdown);
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let drained = self.drained.notified();
            if self.is_empty() {
                return 0;
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                break;
            }
        }

        let stragglers: Vec<Subscriber> = self.registry.lock().drain().map(|(_, s)| s).collect();
        for subscriber in &stragglers {
            subscriber.control.force_close();
        }
        warn!(
            count = stragglers.len(),
            "force-closed connections after shutdown grace period"
        );
        stragglers.len()
    }

    fn evict(&self, subscriber: &Subscriber) {
        warn!(conn = %subscriber.control.id(), "evicting slow consumer");
        subscriber.control.request_close(CloseReason::SlowConsumer);
    }

    fn snapshot_message(&self, filter: &PairFilter) -> Arc<str> {
        let data = self
            .store
            .snapshot()
            .iter()
            .filter(|(pair, _)| filter.matches(pair))
            .filter_map(|(pair, entry)| PriceMessage::from_entry(pair, entry))
            .collect();
        ServerMessage::Snapshot { data }.encode()
    }
}
