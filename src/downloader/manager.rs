use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use crate::broadcaster::{ObserverSession, ProgressBroadcaster};
use crate::config::AppConfig;
use crate::errors::{AppError, Result};
use crate::processing::Merger;
use crate::security::InputValidator;
use super::cache::ProbeCache;
use super::executor::UnitExecutor;
use super::http_pool::HttpPool;
use super::isolation::run_isolated;
use super::registry::TaskRegistry;
use super::routing::RoutingPolicy;
use super::selection::PlaylistSelection;
use super::strategies::{DirectDownloader, RenderDownloader};
use super::ytdlp::YtDlp;
use super::{Downloader, MediaInfo, Operation, Task, TaskKind, TaskStatus, UnitOptions, UnitOutcome, WorkUnit};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleRequest {
    pub url: String,
    #[serde(default)]
    pub options: UnitOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistRequest {
    pub url: String,
    #[serde(default)]
    pub options: UnitOptions,
    #[serde(default)]
    pub selection: PlaylistSelection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub urls: Vec<String>,
    #[serde(default)]
    pub options: UnitOptions,
    /// Per-batch ceiling; never raises the global pool size.
    pub max_concurrent: Option<usize>,
}

/// Units of one task still waiting for a slot.
struct TaskQueue {
    task_id: String,
    pending: VecDeque<WorkUnit>,
    in_flight: usize,
    cap: usize,
    cancel: CancellationToken,
}

struct Job {
    seq: u64,
    task_id: String,
    unit: WorkUnit,
    cancel: CancellationToken,
}

/// Queued units of all tasks, keyed by submission sequence so the oldest
/// task with a runnable unit always goes first.
#[derive(Default)]
struct DispatchQueue {
    tasks: BTreeMap<u64, TaskQueue>,
}

impl DispatchQueue {
    fn push(&mut self, seq: u64, queue: TaskQueue) {
        self.tasks.insert(seq, queue);
    }

    fn next_runnable(&mut self) -> Option<Job> {
        for (seq, queue) in self.tasks.iter_mut() {
            if queue.in_flight >= queue.cap {
                continue;
            }
            if let Some(unit) = queue.pending.pop_front() {
                queue.in_flight += 1;
                return Some(Job {
                    seq: *seq,
                    task_id: queue.task_id.clone(),
                    unit,
                    cancel: queue.cancel.clone(),
                });
            }
        }
        None
    }

    fn finish(&mut self, seq: u64) {
        if let Some(queue) = self.tasks.get_mut(&seq) {
            queue.in_flight = queue.in_flight.saturating_sub(1);
            if queue.in_flight == 0 && queue.pending.is_empty() {
                self.tasks.remove(&seq);
            }
        }
    }

    /// Removes every queued unit of `task_id`, returning their indices.
    fn purge(&mut self, task_id: &str) -> Vec<usize> {
        let Some(seq) = self
            .tasks
            .iter()
            .find(|(_, q)| q.task_id == task_id)
            .map(|(seq, _)| *seq)
        else {
            return Vec::new();
        };

        let mut purged = Vec::new();
        if let Some(queue) = self.tasks.get_mut(&seq) {
            purged = queue.pending.drain(..).map(|u| u.index).collect();
            if queue.in_flight == 0 {
                self.tasks.remove(&seq);
            }
        }
        purged
    }

    fn queued_units(&self) -> usize {
        self.tasks.values().map(|q| q.pending.len()).sum()
    }
}

/// State shared between the manager handle, the dispatcher loop and jobs.
struct Dispatcher {
    queue: Mutex<DispatchQueue>,
    wakeup: Notify,
    slots: Arc<Semaphore>,
    registry: Arc<TaskRegistry>,
    executor: Arc<UnitExecutor>,
}

impl Dispatcher {
    fn queue(&self) -> MutexGuard<'_, DispatchQueue> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        log::info!("[SCHED] dispatcher started with {} slots", self.slots.available_permits());
        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let job = loop {
                let next = self.queue().next_runnable();
                if let Some(job) = next {
                    break Some(job);
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break None,
                    _ = self.wakeup.notified() => {}
                }
            };

            let Some(job) = job else { break };
            log::debug!("[SCHED] slot granted to {} unit {}", job.task_id, job.unit.index);
            tokio::spawn(Arc::clone(&self).run_job(job, permit));
        }
        log::info!("[SCHED] dispatcher stopped");
    }

    async fn run_job(self: Arc<Self>, job: Job, permit: OwnedSemaphorePermit) {
        let Job {
            seq,
            task_id,
            unit,
            cancel,
        } = job;
        let index = unit.index;

        let outcome = if cancel.is_cancelled() {
            UnitOutcome::Failed(AppError::Cancelled(format!("unit {} cancelled before start", index)))
        } else {
            match self.registry.mark_started(&task_id, index).await {
                Ok(_) => {
                    let executor = Arc::clone(&self.executor);
                    let id = task_id.clone();
                    run_isolated(index, async move { executor.execute(&id, &unit, &cancel).await }).await
                }
                Err(e) => UnitOutcome::Failed(e),
            }
        };

        drop(permit);

        match self.registry.record_outcome(&task_id, index, outcome).await {
            Ok(true) => log::info!("[SCHED] task {} finished", task_id),
            Ok(false) => {}
            Err(e) => log::warn!("[SCHED] could not record unit {} of {}: {}", index, task_id, e),
        }

        self.queue().finish(seq);
        self.wakeup.notify_one();
    }

    async fn enqueue(&self, task: &Task, cap: usize) -> Result<()> {
        let ticket = self.registry.ticket(&task.id).await?;
        self.queue().push(
            ticket.seq,
            TaskQueue {
                task_id: task.id.clone(),
                pending: task.units.iter().cloned().collect(),
                in_flight: 0,
                cap: cap.max(1),
                cancel: ticket.cancel,
            },
        );
        log::info!("[SCHED] queued {} units of {}", task.units.len(), task.id);
        self.wakeup.notify_one();
        Ok(())
    }
}

/// Front door of the orchestrator: validates submissions, registers tasks
/// and feeds their units into the process-wide worker pool.
pub struct DownloadManager {
    config: AppConfig,
    registry: Arc<TaskRegistry>,
    dispatcher: Arc<Dispatcher>,
    validator: InputValidator,
    shutdown: CancellationToken,
}

impl DownloadManager {
    /// Builds the manager with the yt-dlp/ffmpeg backed strategies.
    pub fn new(config: AppConfig) -> Result<Self> {
        let ytdlp = Arc::new(YtDlp::new(config.ytdlp_path.clone(), config.proxy.clone()));
        let pool = Arc::new(HttpPool::new(config.proxy.as_deref())?);
        let merger = Arc::new(Merger::new(config.ffmpeg_path.clone()));

        let direct: Arc<dyn Downloader> = Arc::new(DirectDownloader::new(Arc::clone(&ytdlp), pool, config.clone()));
        let render: Arc<dyn Downloader> = Arc::new(RenderDownloader::new(ytdlp, merger, config.clone()));
        Ok(Self::with_backends(config, direct, render))
    }

    /// Must be called inside a tokio runtime; spawns the dispatcher,
    /// heartbeat and retention sweeper.
    pub fn with_backends(config: AppConfig, direct: Arc<dyn Downloader>, render: Arc<dyn Downloader>) -> Self {
        let broadcaster = Arc::new(ProgressBroadcaster::new(
            config.max_observer_connections,
            config.observer_queue_capacity,
        ));
        let registry = Arc::new(TaskRegistry::new(Arc::clone(&broadcaster)));
        let validator = InputValidator::new(config.min_quality, config.max_quality);

        let routing = Arc::new(RoutingPolicy::new(direct, render, config.max_quality_direct));
        let probes = ProbeCache::new(
            std::time::Duration::from_secs(config.probe_cache_ttl_secs),
            config.probe_timeout(),
        );
        let executor = Arc::new(UnitExecutor::new(
            Arc::clone(&registry),
            routing,
            probes,
            InputValidator::new(config.min_quality, config.max_quality),
            config.unit_timeout(),
        ));

        let dispatcher = Arc::new(Dispatcher {
            queue: Mutex::new(DispatchQueue::default()),
            wakeup: Notify::new(),
            slots: Arc::new(Semaphore::new(config.max_concurrent_downloads.max(1))),
            registry: Arc::clone(&registry),
            executor,
        });

        let shutdown = CancellationToken::new();
        tokio::spawn(Arc::clone(&dispatcher).run(shutdown.clone()));
        broadcaster.start_heartbeat(config.heartbeat_interval(), shutdown.clone());
        Self::start_retention_sweeper(Arc::clone(&registry), &config, shutdown.clone());

        log::info!(
            "[SCHED] 🚀 manager ready: {} workers, direct up to {}p",
            config.max_concurrent_downloads,
            config.max_quality_direct
        );

        Self {
            config,
            registry,
            dispatcher,
            validator,
            shutdown,
        }
    }

    fn start_retention_sweeper(registry: Arc<TaskRegistry>, config: &AppConfig, shutdown: CancellationToken) {
        let retention = config.task_retention();
        let every = config.retention_sweep_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        registry.sweep_expired(retention).await;
                    }
                }
            }
        });
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Arc<ProgressBroadcaster> {
        self.registry.broadcaster()
    }

    /// Opens an in-process observer connection.
    pub fn observe(&self) -> Result<ObserverSession> {
        ObserverSession::connect(Arc::clone(&self.registry))
    }

    fn validate_options(&self, options: &UnitOptions) -> Result<()> {
        self.validator.validate_quality(options.quality)?;
        self.validator.validate_subtitle_languages(&options.subtitle_languages)
    }

    pub async fn submit_single(&self, request: SingleRequest) -> Result<String> {
        self.validate_options(&request.options)?;
        let unit = WorkUnit::new(request.url.trim(), Operation::Download, request.options);
        self.submit_units(TaskKind::Single, vec![unit], None, usize::MAX).await
    }

    pub async fn submit_thumbnail(&self, url: &str) -> Result<String> {
        let unit = WorkUnit::new(url.trim(), Operation::Thumbnail, UnitOptions::default());
        self.submit_units(TaskKind::Single, vec![unit], None, usize::MAX).await
    }

    pub async fn submit_captions(&self, url: &str, languages: Vec<String>) -> Result<String> {
        let options = UnitOptions {
            include_subtitles: true,
            subtitle_languages: if languages.is_empty() { vec!["en".to_string()] } else { languages },
            ..UnitOptions::default()
        };
        self.validate_options(&options)?;
        let unit = WorkUnit::new(url.trim(), Operation::Captions, options);
        self.submit_units(TaskKind::Single, vec![unit], None, usize::MAX).await
    }

    pub async fn submit_batch(&self, request: BatchRequest) -> Result<String> {
        self.validate_options(&request.options)?;
        if request.urls.is_empty() {
            return Err(AppError::Validation("Batch needs at least one URL".to_string()));
        }
        if request.urls.len() > self.config.max_batch_urls {
            return Err(AppError::Validation(format!(
                "Batch has {} URLs; the limit is {}",
                request.urls.len(),
                self.config.max_batch_urls
            )));
        }
        if request.max_concurrent == Some(0) {
            return Err(AppError::Validation("max_concurrent must be at least 1".to_string()));
        }

        let units = request
            .urls
            .iter()
            .map(|url| WorkUnit::new(url.trim(), Operation::Download, request.options.clone()))
            .collect();
        let cap = request.max_concurrent.unwrap_or(usize::MAX);
        self.submit_units(TaskKind::Batch, units, None, cap).await
    }

    async fn submit_units(&self, kind: TaskKind, units: Vec<WorkUnit>, source: Option<String>, cap: usize) -> Result<String> {
        let task = self.registry.create(kind, units, source).await?;
        self.dispatcher.enqueue(&task, cap).await?;
        Ok(task.id)
    }

    /// Returns at once; entries are resolved in the background and the task
    /// fails if none can be selected.
    pub async fn submit_playlist(&self, request: PlaylistRequest) -> Result<String> {
        self.validate_options(&request.options)?;
        request.selection.validate()?;
        let url = request.url.trim().to_string();
        self.validator.validate_url_format(&url)?;
        if !self.validator.is_playlist_url(&url) {
            return Err(AppError::Validation(format!("Not a playlist URL: {}", url)));
        }

        let task = self.registry.create_deferred(TaskKind::Playlist, url.clone()).await?;
        let dispatcher = Arc::clone(&self.dispatcher);
        let task_id = task.id.clone();
        tokio::spawn(async move {
            expand_playlist(dispatcher, task_id, url, request).await;
        });
        Ok(task.id)
    }

    /// Synchronous metadata lookup, served from the probe cache when fresh.
    pub async fn extract_metadata(&self, url: &str) -> Result<MediaInfo> {
        let url = url.trim();
        self.validator.validate_media_url(url)?;
        let executor = &self.dispatcher.executor;
        let backend = executor.routing().metadata_backend();
        executor
            .probes()
            .get_or_probe(url, backend.as_ref(), &self.shutdown.child_token())
            .await
    }

    pub async fn get(&self, task_id: &str) -> Result<Task> {
        self.registry.get(task_id).await
    }

    pub async fn list(&self) -> Vec<Task> {
        self.registry.list().await
    }

    /// Requests cancellation and returns immediately with the current snapshot.
    pub async fn cancel(&self, task_id: &str) -> Result<Task> {
        let snapshot = self.registry.cancel(task_id).await?;
        let purged = self.dispatcher.queue().purge(task_id);

        if snapshot.status == TaskStatus::InProgress {
            for index in purged {
                let outcome = UnitOutcome::Failed(AppError::Cancelled(format!("unit {} cancelled before start", index)));
                self.registry.record_outcome(task_id, index, outcome).await?;
            }
        }
        self.dispatcher.wakeup.notify_one();
        self.registry.get(task_id).await
    }

    /// Polls until the task is terminal.
    pub async fn wait_for(&self, task_id: &str) -> Result<Task> {
        loop {
            let task = self.registry.get(task_id).await?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
    }

    pub fn available_slots(&self) -> usize {
        self.dispatcher.slots.available_permits()
    }

    pub fn queued_units(&self) -> usize {
        self.dispatcher.queue().queued_units()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn expand_playlist(dispatcher: Arc<Dispatcher>, task_id: String, url: String, request: PlaylistRequest) {
    let registry = Arc::clone(&dispatcher.registry);
    let cancel = match registry.ticket(&task_id).await {
        Ok(ticket) => ticket.cancel,
        Err(_) => return,
    };

    let expanded = async {
        let backend = dispatcher.executor.routing().metadata_backend();
        let info = dispatcher
            .executor
            .probes()
            .get_or_probe(&url, backend.as_ref(), &cancel)
            .await?;
        if info.entries.is_empty() {
            return Err(AppError::ContentUnavailable(format!("Playlist {} has no entries", url)));
        }

        let total = info.entries.len();
        let selected = request.selection.apply(info.entries);
        if selected.is_empty() {
            return Err(AppError::Validation(format!("Selection matched none of {} playlist entries", total)));
        }
        log::info!("[SCHED] playlist {} selected {} of {} entries", task_id, selected.len(), total);

        let units = selected
            .into_iter()
            .map(|entry| WorkUnit {
                index: 0,
                url: entry.url,
                operation: Operation::Download,
                options: request.options.clone(),
                title: entry.title,
            })
            .collect();
        let task = registry.attach_units(&task_id, units).await?;
        dispatcher.enqueue(&task, usize::MAX).await
    }
    .await;

    if let Err(e) = expanded {
        if cancel.is_cancelled() {
            log::info!("[SCHED] playlist {} expansion stopped by cancellation", task_id);
            return;
        }
        log::error!("[SCHED] playlist {} expansion failed: {}", task_id, e);
        if let Err(state) = registry.fail_admission(&task_id, &e).await {
            log::debug!("[SCHED] playlist {} already settled: {}", task_id, state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(index: usize) -> WorkUnit {
        let mut u = WorkUnit::new(format!("https://youtu.be/{}", index), Operation::Download, UnitOptions::default());
        u.index = index;
        u
    }

    fn queue(task_id: &str, units: usize, cap: usize) -> TaskQueue {
        TaskQueue {
            task_id: task_id.to_string(),
            pending: (0..units).map(unit).collect(),
            in_flight: 0,
            cap,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn oldest_task_goes_first() {
        let mut q = DispatchQueue::default();
        q.push(2, queue("late", 5, usize::MAX));
        q.push(1, queue("early", 2, usize::MAX));

        let order: Vec<String> = std::iter::from_fn(|| q.next_runnable())
            .map(|job| format!("{}:{}", job.task_id, job.unit.index))
            .collect();
        assert_eq!(order[..3], ["early:0", "early:1", "late:0"]);
        assert_eq!(order.len(), 7);
    }

    #[test]
    fn per_task_cap_lets_later_tasks_through() {
        let mut q = DispatchQueue::default();
        q.push(1, queue("batch", 3, 1));
        q.push(2, queue("single", 1, usize::MAX));

        assert_eq!(q.next_runnable().unwrap().task_id, "batch");
        assert_eq!(q.next_runnable().unwrap().task_id, "single");
        assert!(q.next_runnable().is_none());

        q.finish(1);
        assert_eq!(q.next_runnable().unwrap().unit.index, 1);
    }

    #[test]
    fn purge_returns_queued_indices_and_drops_idle_tasks() {
        let mut q = DispatchQueue::default();
        q.push(1, queue("a", 3, usize::MAX));
        let job = q.next_runnable().unwrap();
        assert_eq!(q.purge("a"), vec![1, 2]);
        assert_eq!(q.queued_units(), 0);
        q.finish(job.seq);
        assert!(q.tasks.is_empty());
        assert!(q.purge("a").is_empty());
    }
}
