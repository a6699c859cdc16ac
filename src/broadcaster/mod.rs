pub mod protocol;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use crate::downloader::{TaskProgress, TaskStatus};
use crate::errors::{AppError, ErrorInfo, Result};

pub use protocol::{ObserverCommand, ObserverSession};

pub type ObserverId = u64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Progress,
    Status,
    Error,
    Metadata,
    Heartbeat,
    Pong,
    Stats,
}

/// Server-to-observer message: `{type, task_id, timestamp, data}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub task_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl EventEnvelope {
    pub fn new(event_type: EventType, task_id: Option<&str>, data: serde_json::Value) -> Self {
        Self {
            event_type,
            task_id: task_id.map(str::to_string),
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn progress(task_id: &str, progress: &TaskProgress, current_unit: Option<usize>) -> Self {
        Self::new(
            EventType::Progress,
            Some(task_id),
            serde_json::json!({
                "current": progress.current,
                "total": progress.total,
                "percentage": progress.percentage,
                "speed": progress.speed,
                "eta": progress.eta,
                "current_unit": current_unit,
            }),
        )
    }

    pub fn status(task_id: &str, status: &str, message: impl Into<String>) -> Self {
        Self::new(
            EventType::Status,
            Some(task_id),
            serde_json::json!({ "status": status, "message": message.into() }),
        )
    }

    pub fn task_status(task_id: &str, status: TaskStatus, message: impl Into<String>) -> Self {
        Self::status(task_id, status.as_str(), message)
    }

    pub fn error(task_id: Option<&str>, error: &ErrorInfo) -> Self {
        Self::new(
            EventType::Error,
            task_id,
            serde_json::to_value(error).unwrap_or_else(|_| serde_json::json!({ "error": error.error })),
        )
    }

    pub fn metadata(task_id: &str, data: serde_json::Value) -> Self {
        Self::new(EventType::Metadata, Some(task_id), data)
    }

    pub fn is_status(&self) -> bool {
        self.event_type == EventType::Status
    }

    /// `data.status` of a status envelope.
    pub fn status_value(&self) -> Option<&str> {
        self.data.get("status").and_then(|s| s.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BroadcastStats {
    pub active_connections: usize,
    pub total_connections: u64,
    pub active_tasks: usize,
    pub max_connections: usize,
    pub dropped_events: u64,
}

#[derive(Default)]
struct Hub {
    observers: HashMap<ObserverId, mpsc::Sender<EventEnvelope>>,
    /// task id -> subscribed observers
    subscribers: HashMap<String, HashSet<ObserverId>>,
}

impl Hub {
    fn forget(&mut self, observer: ObserverId) {
        self.observers.remove(&observer);
        self.subscribers.retain(|_, set| {
            set.remove(&observer);
            !set.is_empty()
        });
    }
}

/// Fan-out hub relaying task events to subscribed observers. Every send is a
/// non-blocking enqueue into a bounded per-observer queue; a full queue
/// drops the event for that observer only.
pub struct ProgressBroadcaster {
    hub: Mutex<Hub>,
    next_observer: AtomicU64,
    total_connections: AtomicU64,
    dropped_events: AtomicU64,
    max_connections: usize,
    queue_capacity: usize,
}

impl ProgressBroadcaster {
    pub fn new(max_connections: usize, queue_capacity: usize) -> Self {
        Self {
            hub: Mutex::new(Hub::default()),
            next_observer: AtomicU64::new(1),
            total_connections: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
            max_connections,
            queue_capacity: queue_capacity.max(1),
        }
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        // nothing panics while holding the lock, but don't cascade if it ever does
        self.hub.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a new observer. Fails once `max_connections` are active.
    pub fn connect(&self) -> Result<(ObserverId, mpsc::Receiver<EventEnvelope>)> {
        let mut hub = self.hub();
        if hub.observers.len() >= self.max_connections {
            log::warn!("[BROADCAST] connection rejected: max connections ({}) reached", self.max_connections);
            return Err(AppError::InvalidState(format!(
                "Server at capacity ({} observers)",
                self.max_connections
            )));
        }

        let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        hub.observers.insert(id, tx);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("[BROADCAST] observer {} connected ({} active)", id, hub.observers.len());
        Ok((id, rx))
    }

    /// Removes the observer and every subscription it held.
    pub fn disconnect(&self, observer: ObserverId) {
        let mut hub = self.hub();
        if hub.observers.contains_key(&observer) {
            hub.forget(observer);
            log::info!("[BROADCAST] observer {} disconnected ({} active)", observer, hub.observers.len());
        }
    }

    /// Idempotent. Returns false if the observer is unknown.
    pub fn subscribe(&self, observer: ObserverId, task_id: &str) -> bool {
        let mut hub = self.hub();
        if !hub.observers.contains_key(&observer) {
            return false;
        }
        hub.subscribers.entry(task_id.to_string()).or_default().insert(observer);
        log::debug!("[BROADCAST] observer {} subscribed to {}", observer, task_id);
        true
    }

    /// Idempotent.
    pub fn unsubscribe(&self, observer: ObserverId, task_id: &str) {
        let mut hub = self.hub();
        if let Some(set) = hub.subscribers.get_mut(task_id) {
            set.remove(&observer);
            if set.is_empty() {
                hub.subscribers.remove(task_id);
            }
        }
    }

    /// Delivers to every observer subscribed to `task_id`; returns how many
    /// accepted the event.
    pub fn publish(&self, task_id: &str, event: EventEnvelope) -> usize {
        let mut hub = self.hub();
        let targets: Vec<ObserverId> = match hub.subscribers.get(task_id) {
            Some(set) => set.iter().copied().collect(),
            None => return 0,
        };
        self.fan_out(&mut hub, &targets, &event)
    }

    /// Delivers to every connected observer regardless of subscriptions.
    pub fn broadcast_all(&self, event: EventEnvelope) -> usize {
        let mut hub = self.hub();
        let targets: Vec<ObserverId> = hub.observers.keys().copied().collect();
        self.fan_out(&mut hub, &targets, &event)
    }

    /// Direct reply to a single observer.
    pub fn deliver_to(&self, observer: ObserverId, event: EventEnvelope) -> bool {
        let mut hub = self.hub();
        self.fan_out(&mut hub, &[observer], &event) == 1
    }

    fn fan_out(&self, hub: &mut Hub, targets: &[ObserverId], event: &EventEnvelope) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        for id in targets {
            let Some(tx) = hub.observers.get(id) else {
                continue;
            };
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped_events.fetch_add(1, Ordering::Relaxed);
                    log::debug!("[BROADCAST] observer {} queue full, dropped {:?} event", id, event.event_type);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
            }
        }

        for id in closed {
            log::debug!("[BROADCAST] observer {} receiver gone, removing", id);
            hub.forget(id);
        }
        delivered
    }

    /// Drops the subscriber set of a task that reached a terminal state.
    pub fn close_task(&self, task_id: &str) {
        self.hub().subscribers.remove(task_id);
    }

    pub fn is_subscribed(&self, observer: ObserverId, task_id: &str) -> bool {
        self.hub()
            .subscribers
            .get(task_id)
            .map_or(false, |set| set.contains(&observer))
    }

    pub fn subscriber_count(&self, task_id: &str) -> usize {
        self.hub().subscribers.get(task_id).map_or(0, HashSet::len)
    }

    /// Whether any task's subscriber set still references `observer`.
    pub fn references(&self, observer: ObserverId) -> bool {
        let hub = self.hub();
        hub.observers.contains_key(&observer) || hub.subscribers.values().any(|set| set.contains(&observer))
    }

    pub fn stats(&self) -> BroadcastStats {
        let hub = self.hub();
        BroadcastStats {
            active_connections: hub.observers.len(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_tasks: hub.subscribers.len(),
            max_connections: self.max_connections,
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
        }
    }

    pub fn heartbeat_event(&self) -> EventEnvelope {
        let active = self.hub().observers.len();
        EventEnvelope::new(
            EventType::Heartbeat,
            None,
            serde_json::json!({ "timestamp": Utc::now().timestamp(), "active_connections": active }),
        )
    }

    /// Sends a liveness event to all observers every `interval` until `shutdown` fires.
    pub fn start_heartbeat(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let broadcaster = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let event = broadcaster.heartbeat_event();
                        let sent = broadcaster.broadcast_all(event);
                        log::debug!("[BROADCAST] 💓 heartbeat to {} observers", sent);
                    }
                }
            }
        })
    }
}
