//! The event bus: a per-run broadcast channel carrying the closed
//! `EventType` vocabulary to every live subscriber (the daemon's `WatchJob`
//! stream, in-process tests, a terminal dashboard).
//!
//! A channel is created lazily per key, guarded by a `RwLock<HashMap<..>>`
//! with a double-checked insert. Overflow is handled the way
//! `tokio::sync::broadcast` handles it natively -- the sender never blocks,
//! and a lagging subscriber is told how many events it missed the next time
//! it polls, which we log as a warning.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tracing::warn;

use choo_db::models::EventType;

use crate::worker::WorkerEventSink;

/// Default channel capacity: the maximum number of unconsumed events a
/// subscriber may lag behind before the oldest are dropped.
pub const DEFAULT_CAPACITY: usize = 1024;

/// One event as it travels the bus, carrying the per-run sequence number
/// required by the journal's total ordering guarantee.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub sequence: u64,
    pub event_type: EventType,
    pub unit_id: Option<String>,
    pub task: Option<u32>,
    pub payload: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

/// A single run's event stream: one broadcast channel plus a monotonic
/// sequence counter.
pub struct EventBus {
    sender: broadcast::Sender<BusEvent>,
    sequence: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sequence: AtomicU64::new(0),
        }
    }

    /// Publish an event, stamping it with the next sequence number and the
    /// current wall-clock time. Never blocks: a full channel simply means
    /// the oldest buffered event is dropped for slow subscribers.
    pub fn publish(
        &self,
        event_type: EventType,
        unit_id: Option<String>,
        task: Option<u32>,
        payload: Option<Value>,
        now: DateTime<Utc>,
    ) -> BusEvent {
        let event = BusEvent {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            event_type,
            unit_id,
            task,
            payload,
            timestamp: now,
        };
        // `send` only errors when there are no receivers, which is fine --
        // a run with nobody watching still proceeds.
        let _ = self.sender.send(event.clone());
        event
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }
}

/// Receive the next event off `receiver`, transparently logging and
/// skipping past a lag gap rather than surfacing it as an error to the
/// caller.
pub async fn recv_lossy(receiver: &mut broadcast::Receiver<BusEvent>) -> Option<BusEvent> {
    loop {
        match receiver.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event bus subscriber lagged, dropping oldest events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

/// An `EventBus`-backed `WorkerEventSink`, letting the worker pipeline and
/// orchestrator publish directly onto a run's bus without depending on the
/// bus type itself.
pub struct BusEventSink {
    bus: Arc<EventBus>,
}

impl BusEventSink {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

impl WorkerEventSink for BusEventSink {
    fn emit(&self, event_type: EventType, unit_id: &str, payload: Option<Value>) {
        let unit_id = if unit_id.is_empty() {
            None
        } else {
            Some(unit_id.to_string())
        };
        self.bus.publish(event_type, unit_id, None, payload, Utc::now());
    }
}

/// Registry of one `EventBus` per job, so the daemon's job manager can hand
/// each job its own bus and `WatchJob` can subscribe to the right one by id.
#[derive(Default)]
pub struct BusRegistry {
    buses: RwLock<HashMap<String, Arc<EventBus>>>,
}

impl BusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the bus for `job_id`, creating one with `DEFAULT_CAPACITY` if
    /// absent. Double-checks after acquiring the write lock so concurrent
    /// first-time callers don't create two buses for the same job.
    pub async fn get_or_create(&self, job_id: &str) -> Arc<EventBus> {
        {
            let buses = self.buses.read().await;
            if let Some(bus) = buses.get(job_id) {
                return bus.clone();
            }
        }
        let mut buses = self.buses.write().await;
        buses
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(EventBus::new(DEFAULT_CAPACITY)))
            .clone()
    }

    pub async fn remove(&self, job_id: &str) {
        self.buses.write().await.remove(job_id);
    }
}
