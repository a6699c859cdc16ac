use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use crate::downloader::registry::TaskRegistry;
use crate::errors::{AppError, Result};
use super::{EventEnvelope, EventType, ObserverId, ProgressBroadcaster};

/// Client-to-server commands on the observer channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ObserverCommand {
    Subscribe { task_id: String },
    Unsubscribe { task_id: String },
    Stats,
    Ping,
}

/// One connected observer. Dropping the session disconnects it.
pub struct ObserverSession {
    id: ObserverId,
    registry: Arc<TaskRegistry>,
    events: mpsc::Receiver<EventEnvelope>,
}

impl std::fmt::Debug for ObserverSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverSession").field("id", &self.id).finish_non_exhaustive()
    }
}

impl ObserverSession {
    pub fn connect(registry: Arc<TaskRegistry>) -> Result<Self> {
        let (id, events) = registry.broadcaster().connect()?;
        Ok(Self { id, registry, events })
    }

    pub fn id(&self) -> ObserverId {
        self.id
    }

    fn broadcaster(&self) -> &Arc<ProgressBroadcaster> {
        self.registry.broadcaster()
    }

    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<EventEnvelope> {
        self.events.try_recv().ok()
    }

    pub async fn handle(&self, command: ObserverCommand) {
        match command {
            ObserverCommand::Subscribe { task_id } => {
                self.registry.subscribe(self.id, &task_id).await;
            }
            ObserverCommand::Unsubscribe { task_id } => {
                self.broadcaster().unsubscribe(self.id, &task_id);
            }
            ObserverCommand::Stats => {
                let stats = self.broadcaster().stats();
                let data = serde_json::to_value(&stats).unwrap_or_default();
                self.broadcaster()
                    .deliver_to(self.id, EventEnvelope::new(EventType::Stats, None, data));
            }
            ObserverCommand::Ping => {
                let data = serde_json::json!({ "timestamp": chrono::Utc::now().timestamp() });
                self.broadcaster()
                    .deliver_to(self.id, EventEnvelope::new(EventType::Pong, None, data));
            }
        }
    }

    /// Parses and runs a raw text command; malformed input is answered with
    /// an `error` event instead of failing the session.
    pub async fn handle_text(&self, text: &str) {
        match parse_command(text) {
            Ok(command) => self.handle(command).await,
            Err(e) => {
                log::warn!("[BROADCAST] observer {} sent bad command: {}", self.id, e);
                self.broadcaster()
                    .deliver_to(self.id, EventEnvelope::error(None, &e.info()));
            }
        }
    }
}

impl Drop for ObserverSession {
    fn drop(&mut self) {
        self.registry.broadcaster().disconnect(self.id);
    }
}

pub fn parse_command(text: &str) -> Result<ObserverCommand> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|_| AppError::Validation("Invalid JSON format".to_string()))?;
    serde_json::from_value(value).map_err(|e| AppError::Validation(format!("Unsupported command: {}", e)))
}
