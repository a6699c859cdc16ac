use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use crate::errors::{AppError, Result};
use crate::security::InputValidator;
use super::cache::ProbeCache;
use super::registry::TaskRegistry;
use super::routing::RoutingPolicy;
use super::{ArtifactRef, FetchContext, MediaInfo, Operation, ProgressTick, UnitOutcome, WorkUnit};

const PROGRESS_CHANNEL_CAPACITY: usize = 64;

/// Runs one backend call for one unit: validation, availability probe,
/// routing, progress forwarding, timeout and error normalization.
pub struct UnitExecutor {
    registry: Arc<TaskRegistry>,
    routing: Arc<RoutingPolicy>,
    probes: ProbeCache,
    validator: InputValidator,
    unit_timeout: Duration,
}

impl UnitExecutor {
    pub fn new(
        registry: Arc<TaskRegistry>,
        routing: Arc<RoutingPolicy>,
        probes: ProbeCache,
        validator: InputValidator,
        unit_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            routing,
            probes,
            validator,
            unit_timeout,
        }
    }

    pub fn routing(&self) -> &Arc<RoutingPolicy> {
        &self.routing
    }

    pub fn probes(&self) -> &ProbeCache {
        &self.probes
    }

    /// Never returns anything but a single definite outcome.
    pub async fn execute(&self, task_id: &str, unit: &WorkUnit, cancel: &CancellationToken) -> UnitOutcome {
        if cancel.is_cancelled() {
            return UnitOutcome::Failed(AppError::Cancelled(format!("unit {} cancelled before start", unit.index)));
        }

        let unit_cancel = cancel.child_token();
        log::info!("[EXEC] {} unit {} -> {}", task_id, unit.index, unit.url);

        let outcome = match tokio::time::timeout(self.unit_timeout, self.run(task_id, unit, &unit_cancel)).await {
            Ok(Ok(artifact)) => UnitOutcome::Succeeded(artifact),
            Ok(Err(e)) => UnitOutcome::Failed(normalize(e, cancel)),
            Err(_) => {
                // the backend future is already dropped; this stops anything it spawned
                unit_cancel.cancel();
                UnitOutcome::Failed(AppError::network(
                    format!("Unit timed out after {}s", self.unit_timeout.as_secs()),
                    true,
                ))
            }
        };

        match &outcome {
            UnitOutcome::Succeeded(_) => log::info!("[EXEC] ✅ {} unit {} done", task_id, unit.index),
            UnitOutcome::Failed(e) => log::warn!("[EXEC] ❌ {} unit {} failed: {}", task_id, unit.index, e),
        }
        outcome
    }

    async fn run(&self, task_id: &str, unit: &WorkUnit, cancel: &CancellationToken) -> Result<ArtifactRef> {
        self.validator.validate_media_url(&unit.url)?;

        let availability = if unit.operation == Operation::Download {
            let backend = self.routing.metadata_backend();
            let info = self.probes.get_or_probe(&unit.url, backend.as_ref(), cancel).await?;
            self.registry.publish_metadata(task_id, metadata_event(unit, &info)).await;
            Some(info)
        } else {
            None
        };

        let route = self.routing.route(unit, availability.as_ref())?;

        let mut unit = unit.clone();
        if unit.title.is_none() {
            unit.title = availability.map(|info| info.title);
        }
        log::info!("[EXEC] {} unit {} routed to {}", task_id, unit.index, route.backend.get_name());

        let (tx, mut rx) = mpsc::channel::<ProgressTick>(PROGRESS_CHANNEL_CAPACITY);
        let ctx = FetchContext {
            unit_index: unit.index,
            progress: tx,
            cancel: cancel.clone(),
        };
        ctx.checkpoint()?;

        let fetch = route.backend.fetch(&unit, &ctx);
        tokio::pin!(fetch);

        let result = loop {
            tokio::select! {
                biased;
                Some(tick) = rx.recv() => self.forward(task_id, tick).await,
                result = &mut fetch => break result,
            }
        };

        while let Ok(tick) = rx.try_recv() {
            self.forward(task_id, tick).await;
        }

        result
    }

    async fn forward(&self, task_id: &str, tick: ProgressTick) {
        if let Err(e) = self.registry.record_progress(task_id, &tick).await {
            log::debug!("[EXEC] progress for {} dropped: {}", task_id, e);
        }
    }
}

fn metadata_event(unit: &WorkUnit, info: &MediaInfo) -> serde_json::Value {
    serde_json::json!({
        "unit": unit.index,
        "url": unit.url,
        "title": info.title,
        "duration": info.duration,
        "thumbnail": info.thumbnail,
        "uploader": info.uploader,
        "available_qualities": info.available_qualities(),
    })
}

/// Folds errors that escaped a backend into the shared taxonomy.
fn normalize(error: AppError, cancel: &CancellationToken) -> AppError {
    if cancel.is_cancelled() {
        return match error {
            AppError::Cancelled(_) => error,
            other => AppError::Cancelled(format!("stopped: {}", other)),
        };
    }
    match error {
        AppError::Json(e) => AppError::Backend(format!("Unreadable backend output: {}", e)),
        other => other,
    }
}
