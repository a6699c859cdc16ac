use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use crate::broadcaster::{EventEnvelope, ObserverId, ProgressBroadcaster};
use crate::errors::{AppError, ErrorInfo, Result};
use crate::security::InputValidator;
use super::isolation::{IsolationLedger, TaskVerdict};
use super::{
    ProgressTick, Task, TaskKind, TaskProgress, TaskResult, TaskStatus, UnitFailure, UnitOutcome, WorkUnit,
};

/// Scheduling handle for a registered task.
#[derive(Debug, Clone)]
pub struct TaskTicket {
    pub id: String,
    /// Submission order, used for first-come first-served dispatch.
    pub seq: u64,
    pub cancel: CancellationToken,
}

struct TaskEntry {
    task: Task,
    seq: u64,
    cancel: CancellationToken,
    cancel_requested: bool,
    ledger: IsolationLedger,
    unit_progress: Vec<f64>,
    current_unit: Option<usize>,
}

impl TaskEntry {
    fn touch(&mut self) {
        self.task.updated_at = Utc::now();
    }

    fn recompute_progress(&mut self) {
        let total = self.task.units.len() as f64;
        let current: f64 = self.unit_progress.iter().sum();
        let progress = &mut self.task.progress;
        // never regress, even if float rounding would say otherwise
        progress.current = current.max(progress.current).min(total);
        progress.total = total;
        progress.percentage = if total > 0.0 {
            (progress.current / total * 100.0).min(100.0)
        } else {
            0.0
        };
    }
}

/// Authoritative store of task state. Every mutation of one task is
/// serialized through that task's lock; events are published while the lock
/// is held so observers see them in state order.
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Arc<Mutex<TaskEntry>>>>,
    broadcaster: Arc<ProgressBroadcaster>,
    validator: InputValidator,
    next_seq: AtomicU64,
}

impl TaskRegistry {
    pub fn new(broadcaster: Arc<ProgressBroadcaster>) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            broadcaster,
            validator: InputValidator::default(),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn broadcaster(&self) -> &Arc<ProgressBroadcaster> {
        &self.broadcaster
    }

    async fn entry(&self, id: &str) -> Result<Arc<Mutex<TaskEntry>>> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Task {} not found", id)))
    }

    fn prepare_units(&self, mut units: Vec<WorkUnit>) -> Result<Vec<WorkUnit>> {
        if units.is_empty() {
            return Err(AppError::Validation("A task needs at least one unit".to_string()));
        }
        for (index, unit) in units.iter_mut().enumerate() {
            self.validator.validate_url_format(&unit.url)?;
            unit.index = index;
        }
        Ok(units)
    }

    /// Registers a new `pending` task.
    pub async fn create(&self, kind: TaskKind, units: Vec<WorkUnit>, source_url: Option<String>) -> Result<Task> {
        let units = self.prepare_units(units)?;
        let id = crate::utils::generate_task_id(kind.as_str());
        self.insert(id, kind, units, source_url).await
    }

    /// Registers a `pending` task whose units are attached later with
    /// [`attach_units`](Self::attach_units).
    pub async fn create_deferred(&self, kind: TaskKind, source_url: String) -> Result<Task> {
        self.validator.validate_url_format(&source_url)?;
        let id = crate::utils::generate_task_id(kind.as_str());
        self.insert(id, kind, Vec::new(), Some(source_url)).await
    }

    async fn insert(&self, id: String, kind: TaskKind, units: Vec<WorkUnit>, source_url: Option<String>) -> Result<Task> {
        let now = Utc::now();
        let unit_count = units.len();
        let task = Task {
            id: id.clone(),
            kind,
            status: TaskStatus::Pending,
            source_url,
            units,
            progress: TaskProgress {
                total: unit_count as f64,
                ..Default::default()
            },
            result: TaskResult::default(),
            error: None,
            created_at: now,
            updated_at: now,
        };

        let entry = TaskEntry {
            task: task.clone(),
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            cancel: CancellationToken::new(),
            cancel_requested: false,
            ledger: IsolationLedger::new(unit_count),
            unit_progress: vec![0.0; unit_count],
            current_unit: None,
        };

        self.tasks.write().await.insert(id.clone(), Arc::new(Mutex::new(entry)));
        log::info!("[REGISTRY] created {} task {} with {} units", kind.as_str(), id, unit_count);
        Ok(task)
    }

    /// Attaches units to a deferred task that is still `pending` and empty.
    pub async fn attach_units(&self, id: &str, units: Vec<WorkUnit>) -> Result<Task> {
        let units = self.prepare_units(units)?;
        let entry = self.entry(id).await?;
        let mut entry = entry.lock().await;

        if entry.task.status != TaskStatus::Pending || !entry.task.units.is_empty() {
            return Err(AppError::InvalidState(format!(
                "Task {} cannot accept units while {}",
                id,
                entry.task.status.as_str()
            )));
        }

        let count = units.len();
        entry.task.units = units;
        entry.ledger.resize(count);
        entry.unit_progress = vec![0.0; count];
        entry.recompute_progress();
        entry.touch();

        let event = EventEnvelope::metadata(id, serde_json::json!({ "units": count }));
        self.broadcaster.publish(id, event);
        Ok(entry.task.clone())
    }

    pub async fn ticket(&self, id: &str) -> Result<TaskTicket> {
        let entry = self.entry(id).await?;
        let entry = entry.lock().await;
        Ok(TaskTicket {
            id: id.to_string(),
            seq: entry.seq,
            cancel: entry.cancel.clone(),
        })
    }

    /// Read-only snapshot.
    pub async fn get(&self, id: &str) -> Result<Task> {
        let entry = self.entry(id).await?;
        let entry = entry.lock().await;
        Ok(entry.task.clone())
    }

    pub async fn list(&self) -> Vec<Task> {
        let entries: Vec<_> = self.tasks.read().await.values().cloned().collect();
        let mut tasks = Vec::with_capacity(entries.len());
        for entry in entries {
            tasks.push(entry.lock().await.task.clone());
        }
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    /// Moves a task to `next` if the lifecycle allows it.
    pub async fn transition(&self, id: &str, next: TaskStatus) -> Result<Task> {
        let entry = self.entry(id).await?;
        let mut entry = entry.lock().await;
        let message = format!("Task {}", next.as_str());
        self.apply_transition(&mut entry, next, message)?;
        Ok(entry.task.clone())
    }

    fn apply_transition(&self, entry: &mut TaskEntry, next: TaskStatus, message: String) -> Result<()> {
        let current = entry.task.status;
        if !current.can_transition_to(next) {
            return Err(AppError::InvalidState(format!(
                "Task {} cannot move from {} to {}",
                entry.task.id,
                current.as_str(),
                next.as_str()
            )));
        }

        entry.task.status = next;
        entry.touch();
        log::info!("[REGISTRY] {} {} -> {}", entry.task.id, current.as_str(), next.as_str());

        let id = entry.task.id.clone();
        if let (Some(error), true) = (&entry.task.error, next == TaskStatus::Failed) {
            self.broadcaster.publish(&id, EventEnvelope::error(Some(&id), error));
        }
        self.broadcaster.publish(&id, EventEnvelope::task_status(&id, next, message));
        if next.is_terminal() {
            entry.cancel.cancel();
            self.broadcaster.close_task(&id);
        }
        Ok(())
    }

    /// Called when a unit of the task acquires a worker slot. Returns true
    /// if this moved the task `pending -> in_progress`.
    pub async fn mark_started(&self, id: &str, unit_index: usize) -> Result<bool> {
        let entry = self.entry(id).await?;
        let mut entry = entry.lock().await;
        entry.current_unit = Some(unit_index);
        match entry.task.status {
            TaskStatus::Pending => {
                let message = format!("Processing unit {} of {}", unit_index + 1, entry.task.units.len());
                self.apply_transition(&mut entry, TaskStatus::InProgress, message)?;
                Ok(true)
            }
            TaskStatus::InProgress => Ok(false),
            other => Err(AppError::InvalidState(format!("Task {} is already {}", id, other.as_str()))),
        }
    }

    /// Merges one unit's progress tick into the aggregate.
    pub async fn record_progress(&self, id: &str, tick: &ProgressTick) -> Result<()> {
        let entry = self.entry(id).await?;
        let mut entry = entry.lock().await;

        if entry.task.status.is_terminal() {
            log::warn!(
                "[REGISTRY] late progress for unit {} of {} task {}, ignoring",
                tick.unit_index,
                entry.task.status.as_str(),
                id
            );
            return Ok(());
        }

        let index = tick.unit_index;
        if index >= entry.unit_progress.len() || entry.ledger.is_recorded(index) {
            log::debug!("[REGISTRY] stale progress for unit {} of {}", index, id);
            return Ok(());
        }

        let fraction = tick.fraction.clamp(0.0, 1.0);
        if fraction > entry.unit_progress[index] {
            entry.unit_progress[index] = fraction;
        }
        if tick.speed.is_some() {
            entry.task.progress.speed = tick.speed;
        }
        if tick.eta.is_some() {
            entry.task.progress.eta = tick.eta;
        }
        entry.current_unit = Some(index);
        entry.recompute_progress();
        entry.touch();

        let event = EventEnvelope::progress(id, &entry.task.progress, entry.current_unit);
        self.broadcaster.publish(id, event);
        Ok(())
    }

    pub async fn publish_metadata(&self, id: &str, data: serde_json::Value) {
        if let Ok(entry) = self.entry(id).await {
            let entry = entry.lock().await;
            if !entry.task.status.is_terminal() {
                self.broadcaster.publish(id, EventEnvelope::metadata(id, data));
            }
        }
    }

    /// Records a unit's terminal outcome once; finalizes the task when every
    /// unit has settled. Returns true if the task reached a terminal state.
    pub async fn record_outcome(&self, id: &str, unit_index: usize, outcome: UnitOutcome) -> Result<bool> {
        let entry = self.entry(id).await?;
        let mut entry = entry.lock().await;
        self.settle_unit(&mut entry, unit_index, outcome)?;
        Ok(entry.task.status.is_terminal())
    }

    fn settle_unit(&self, entry: &mut TaskEntry, unit_index: usize, outcome: UnitOutcome) -> Result<()> {
        let id = entry.task.id.clone();
        if entry.task.status.is_terminal() {
            log::warn!("[REGISTRY] outcome for unit {} of finished task {} ignored", unit_index, id);
            return Ok(());
        }

        let url = match entry.task.units.get(unit_index) {
            Some(unit) => unit.url.clone(),
            None => {
                return Err(AppError::InvalidState(format!("Task {} has no unit {}", id, unit_index)));
            }
        };

        let ledger_entry = match &outcome {
            UnitOutcome::Succeeded(_) => Ok(()),
            UnitOutcome::Failed(e) => Err(e.info()),
        };
        if !entry.ledger.record(unit_index, ledger_entry) {
            log::debug!("[REGISTRY] duplicate outcome for unit {} of {}", unit_index, id);
            return Ok(());
        }

        match outcome {
            UnitOutcome::Succeeded(artifact) => {
                log::info!("[REGISTRY] {} unit {} succeeded", id, unit_index);
                entry.task.result.succeeded.push(artifact);
            }
            UnitOutcome::Failed(error) => {
                let info = error.info();
                if !matches!(error, AppError::Cancelled(_)) {
                    log::warn!("[REGISTRY] {} unit {} failed: {}", id, unit_index, info.error);
                    self.broadcaster.publish(&id, EventEnvelope::error(Some(&id), &info));
                }
                entry.task.result.failed.push(UnitFailure {
                    unit_index,
                    url,
                    error: info,
                });
            }
        }

        entry.unit_progress[unit_index] = 1.0;
        entry.recompute_progress();
        entry.touch();
        self.broadcaster
            .publish(&id, EventEnvelope::progress(&id, &entry.task.progress, Some(unit_index)));

        if entry.ledger.is_settled() {
            self.finalize(entry)?;
        }
        Ok(())
    }

    fn finalize(&self, entry: &mut TaskEntry) -> Result<()> {
        entry.task.result.succeeded.sort_by_key(|a| a.unit_index);
        entry.task.result.failed.sort_by_key(|f| f.unit_index);

        let succeeded = entry.task.result.succeeded.len();
        let failed = entry.task.result.failed.len();

        match entry.ledger.verdict(entry.cancel_requested) {
            TaskVerdict::Cancelled => {
                let message = format!("Cancelled ({} succeeded, {} not completed)", succeeded, failed);
                self.apply_transition(entry, TaskStatus::Cancelled, message)
            }
            TaskVerdict::Completed => {
                if entry.task.status == TaskStatus::Pending {
                    self.apply_transition(entry, TaskStatus::InProgress, "Processing".to_string())?;
                }
                let message = format!("Completed: {} succeeded, {} failed", succeeded, failed);
                self.apply_transition(entry, TaskStatus::Completed, message)
            }
            TaskVerdict::Failed(error) => {
                if entry.task.status == TaskStatus::Pending {
                    self.apply_transition(entry, TaskStatus::InProgress, "Processing".to_string())?;
                }
                let message = error.error.clone();
                entry.task.error = Some(error);
                self.apply_transition(entry, TaskStatus::Failed, message)
            }
        }
    }

    /// Fails a task that never got admitted (e.g. playlist expansion failed).
    pub async fn fail_admission(&self, id: &str, error: &AppError) -> Result<Task> {
        let entry = self.entry(id).await?;
        let mut entry = entry.lock().await;
        entry.task.error = Some(error.info());
        let message = format!("Task could not start: {}", error);
        self.apply_transition(&mut entry, TaskStatus::Failed, message)?;
        Ok(entry.task.clone())
    }

    /// Requests cooperative cancellation. Idempotent; terminal tasks are left as-is.
    pub async fn cancel(&self, id: &str) -> Result<Task> {
        let entry = self.entry(id).await?;
        let mut entry = entry.lock().await;

        match entry.task.status {
            status if status.is_terminal() => {
                log::debug!("[REGISTRY] cancel on {} task {} is a no-op", status.as_str(), id);
            }
            TaskStatus::Pending => {
                entry.cancel_requested = true;
                entry.cancel.cancel();
                for index in entry.ledger.unsettled() {
                    let url = entry.task.units[index].url.clone();
                    entry.ledger.record(index, Err(cancelled_info()));
                    entry.task.result.failed.push(UnitFailure {
                        unit_index: index,
                        url,
                        error: cancelled_info(),
                    });
                }
                let message = "Cancelled before start".to_string();
                self.apply_transition(&mut entry, TaskStatus::Cancelled, message)?;
            }
            _ => {
                if !entry.cancel_requested {
                    log::info!("[REGISTRY] cancellation requested for {}", id);
                    entry.cancel_requested = true;
                    entry.cancel.cancel();
                    entry.touch();
                }
            }
        }
        Ok(entry.task.clone())
    }

    pub async fn is_cancel_requested(&self, id: &str) -> bool {
        match self.entry(id).await {
            Ok(entry) => entry.lock().await.cancel_requested,
            Err(_) => true,
        }
    }

    /// Subscribes `observer` to a live task. For an unknown or finished task
    /// the observer gets exactly one status event and is not subscribed.
    pub async fn subscribe(&self, observer: ObserverId, id: &str) -> bool {
        let entry = match self.entry(id).await {
            Ok(entry) => entry,
            Err(_) => {
                self.broadcaster
                    .deliver_to(observer, EventEnvelope::status(id, "not_found", format!("Task {} not found", id)));
                return false;
            }
        };

        let entry = entry.lock().await;
        let status = entry.task.status;
        if status.is_terminal() {
            let message = match &entry.task.error {
                Some(error) => error.error.clone(),
                None => format!("Task {}", status.as_str()),
            };
            self.broadcaster
                .deliver_to(observer, EventEnvelope::task_status(id, status, message));
            return false;
        }
        self.broadcaster.subscribe(observer, id)
    }

    /// Evicts terminal tasks not updated within `retention`.
    pub async fn sweep_expired(&self, retention: Duration) -> usize {
        let cutoff = match chrono::Duration::from_std(retention) {
            Ok(age) => Utc::now() - age,
            Err(_) => return 0,
        };

        let mut tasks = self.tasks.write().await;
        let mut expired = Vec::new();
        for (id, entry) in tasks.iter() {
            // a locked entry is being mutated, so it isn't stale
            if let Ok(entry) = entry.try_lock() {
                if entry.task.status.is_terminal() && entry.task.updated_at < cutoff {
                    expired.push(id.clone());
                }
            }
        }
        for id in &expired {
            tasks.remove(id);
        }
        if !expired.is_empty() {
            log::info!("[REGISTRY] 🧹 evicted {} expired tasks", expired.len());
        }
        expired.len()
    }
}

fn cancelled_info() -> ErrorInfo {
    AppError::Cancelled("unit cancelled before completion".to_string()).info()
}
