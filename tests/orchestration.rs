use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mediagrab::downloader::{
    ArtifactKind, ArtifactRef, BackendKind, FetchContext, MediaInfo, PlaylistEntry, ProgressTick,
};
use mediagrab::{
    AppConfig, AppError, BatchRequest, DownloadManager, Downloader, EventEnvelope, EventType, ObserverCommand,
    ObserverSession, Operation, PlaylistRequest, PlaylistSelection, Result, SingleRequest, Task, TaskStatus,
    UnitOptions, WorkUnit,
};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(10);

/// Backend whose behavior is picked by the video id in the URL:
/// `fail…` errors with a retryable network error, `hang…` blocks until
/// cancelled, `boom…` panics, anything else succeeds after four steps.
struct MockBackend {
    kind: BackendKind,
    step: Duration,
    fetches: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MockBackend {
    fn new(kind: BackendKind, step: Duration) -> Arc<Self> {
        Arc::new(Self {
            kind,
            step,
            fetches: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl Downloader for MockBackend {
    async fn probe(&self, url: &str, _cancel: &CancellationToken) -> Result<MediaInfo> {
        if url.contains("list=EMPTY") {
            return Ok(MediaInfo {
                is_playlist: true,
                ..Default::default()
            });
        }
        if url.contains("list=") {
            return Ok(MediaInfo {
                id: "PL1".into(),
                title: "Mix".into(),
                is_playlist: true,
                entries: (0..5)
                    .map(|i| PlaylistEntry {
                        id: format!("vidplaylst{}", i),
                        url: format!("https://youtu.be/vidplaylst{}", i),
                        title: Some(format!("Entry {}", i)),
                    })
                    .collect(),
                ..Default::default()
            });
        }
        Ok(MediaInfo {
            title: "Clip".into(),
            progressive_qualities: vec![360, 480, 720],
            video_only_qualities: vec![1080, 1440],
            has_audio: true,
            ..Default::default()
        })
    }

    async fn fetch(&self, unit: &WorkUnit, ctx: &FetchContext) -> Result<ArtifactRef> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if unit.url.contains("/fail") {
            return Err(AppError::network("connection reset by peer", true));
        }
        if unit.url.contains("/boom") {
            panic!("backend blew up");
        }
        if unit.url.contains("/hang") {
            ctx.report(ProgressTick::stage("download", 0.1)).await?;
            ctx.cancel.cancelled().await;
            return Err(AppError::Cancelled("stopped".into()));
        }

        for step in 1..=4 {
            tokio::time::sleep(self.step).await;
            ctx.report(ProgressTick::stage("download", step as f64 / 4.0)).await?;
        }

        let kind = match unit.operation {
            Operation::Download => ArtifactKind::Video,
            Operation::Captions => ArtifactKind::Captions,
            Operation::Thumbnail => ArtifactKind::Thumbnail,
            Operation::Metadata => ArtifactKind::Metadata,
        };
        Ok(ArtifactRef {
            unit_index: unit.index,
            url: unit.url.clone(),
            kind,
            paths: vec![],
            size_bytes: Some(1024),
            title: unit.title.clone(),
        })
    }

    fn supports_operation(&self, operation: Operation) -> bool {
        self.kind == BackendKind::Render || operation == Operation::Download
    }

    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn get_name(&self) -> &str {
        match self.kind {
            BackendKind::Direct => "mock-direct",
            BackendKind::Render => "mock-render",
        }
    }
}

struct Harness {
    manager: DownloadManager,
    direct: Arc<MockBackend>,
    render: Arc<MockBackend>,
}

fn harness_with(config: AppConfig, step: Duration) -> Harness {
    let direct = MockBackend::new(BackendKind::Direct, step);
    let render = MockBackend::new(BackendKind::Render, step);
    let manager = DownloadManager::with_backends(
        config,
        Arc::clone(&direct) as Arc<dyn Downloader>,
        Arc::clone(&render) as Arc<dyn Downloader>,
    );
    Harness { manager, direct, render }
}

fn config(workers: usize) -> AppConfig {
    AppConfig {
        max_concurrent_downloads: workers,
        heartbeat_interval_secs: 3600,
        unit_timeout_secs: 30,
        ..Default::default()
    }
}

fn harness(workers: usize) -> Harness {
    harness_with(config(workers), Duration::from_millis(5))
}

fn video(id: &str) -> String {
    format!("https://youtu.be/{}", id)
}

fn options(quality: u32) -> UnitOptions {
    UnitOptions {
        quality,
        ..Default::default()
    }
}

async fn finish(manager: &DownloadManager, task_id: &str) -> Task {
    tokio::time::timeout(WAIT, manager.wait_for(task_id))
        .await
        .expect("task did not finish in time")
        .unwrap()
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

async fn next_event(session: &mut ObserverSession) -> EventEnvelope {
    tokio::time::timeout(WAIT, session.recv())
        .await
        .expect("no event in time")
        .expect("observer channel closed")
}

fn is_terminal_status(event: &EventEnvelope) -> bool {
    event.is_status() && matches!(event.status_value(), Some("completed" | "failed" | "cancelled"))
}

#[tokio::test]
async fn batch_with_one_bad_url_still_completes() {
    let h = harness(2);
    let id = h
        .manager
        .submit_batch(BatchRequest {
            urls: vec![
                video("aaaaaaaaaaa"),
                "https://example.com/not-media".to_string(),
                video("bbbbbbbbbbb"),
            ],
            options: options(720),
            max_concurrent: None,
        })
        .await
        .unwrap();

    let task = finish(&h.manager, &id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result.succeeded.len(), 2);
    assert_eq!(task.result.failed.len(), 1);
    assert_eq!(task.result.failed[0].unit_index, 1);
    assert_eq!(task.result.failed[0].error.error_type, "ValidationError");
    assert!(task.error.is_none());
    let indices: Vec<usize> = task.result.succeeded.iter().map(|a| a.unit_index).collect();
    assert_eq!(indices, vec![0, 2]);
}

#[tokio::test]
async fn every_unit_failing_fails_the_task() {
    let h = harness(2);
    let id = h
        .manager
        .submit_batch(BatchRequest {
            urls: vec![video("fail0000001"), video("fail0000002")],
            options: options(480),
            max_concurrent: None,
        })
        .await
        .unwrap();

    let task = finish(&h.manager, &id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.result.succeeded.is_empty());
    assert_eq!(task.result.failed.len(), 2);
    let error = task.error.expect("failed task carries an error");
    assert_eq!(error.error_type, "NetworkError");
    assert!(error.retryable);
}

#[tokio::test]
async fn single_above_threshold_network_failure_goes_through_render() {
    let h = harness(1);
    let id = h
        .manager
        .submit_single(SingleRequest {
            url: video("fail0000003"),
            options: options(1080),
        })
        .await
        .unwrap();

    let task = finish(&h.manager, &id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    let error = task.error.unwrap();
    assert_eq!(error.error_type, "NetworkError");
    assert!(error.retryable);
    assert_eq!(h.render.fetches(), 1);
    assert_eq!(h.direct.fetches(), 0);
}

#[tokio::test]
async fn low_quality_routes_direct_even_with_extras() {
    let h = harness(1);

    let at_threshold = h
        .manager
        .submit_single(SingleRequest {
            url: video("ccccccccccc"),
            options: options(720),
        })
        .await
        .unwrap();
    assert_eq!(finish(&h.manager, &at_threshold).await.status, TaskStatus::Completed);
    assert_eq!((h.direct.fetches(), h.render.fetches()), (1, 0));

    let above = h
        .manager
        .submit_single(SingleRequest {
            url: video("ddddddddddd"),
            options: options(1080),
        })
        .await
        .unwrap();
    assert_eq!(finish(&h.manager, &above).await.status, TaskStatus::Completed);
    assert_eq!((h.direct.fetches(), h.render.fetches()), (1, 1));

    let with_subs = h
        .manager
        .submit_single(SingleRequest {
            url: video("eeeeeeeeeee"),
            options: UnitOptions {
                quality: 360,
                include_subtitles: true,
                ..Default::default()
            },
        })
        .await
        .unwrap();
    assert_eq!(finish(&h.manager, &with_subs).await.status, TaskStatus::Completed);
    assert_eq!((h.direct.fetches(), h.render.fetches()), (2, 1));
}

#[tokio::test]
async fn unoffered_quality_fails_without_fetching() {
    let h = harness(1);
    let id = h
        .manager
        .submit_single(SingleRequest {
            url: video("fffffffffff"),
            options: options(2160),
        })
        .await
        .unwrap();

    let task = finish(&h.manager, &id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    let error = task.error.unwrap();
    assert_eq!(error.error_type, "QualityUnavailableError");
    assert!(!error.retryable);
    assert_eq!(h.render.fetches() + h.direct.fetches(), 0);
}

#[tokio::test]
async fn panicking_backend_only_fails_its_unit() {
    let h = harness(2);
    let id = h
        .manager
        .submit_batch(BatchRequest {
            urls: vec![video("boom0000001"), video("ggggggggggg")],
            options: options(720),
            max_concurrent: None,
        })
        .await
        .unwrap();

    let task = finish(&h.manager, &id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result.succeeded.len(), 1);
    assert_eq!(task.result.failed[0].unit_index, 0);
    assert_eq!(task.result.failed[0].error.error_type, "BackendError");
}

#[tokio::test]
async fn progress_events_never_go_backwards() {
    let h = harness_with(config(2), Duration::from_millis(20));
    let mut session = h.manager.observe().unwrap();
    let id = h
        .manager
        .submit_batch(BatchRequest {
            urls: vec![video("hhhhhhhhhhh"), video("iiiiiiiiiii"), video("jjjjjjjjjjj")],
            options: options(480),
            max_concurrent: None,
        })
        .await
        .unwrap();
    session
        .handle(ObserverCommand::Subscribe { task_id: id.clone() })
        .await;

    let mut seen = Vec::new();
    loop {
        let event = next_event(&mut session).await;
        if event.event_type == EventType::Progress {
            let current = event.data["current"].as_f64().unwrap();
            let percentage = event.data["percentage"].as_f64().unwrap();
            assert!((0.0..=100.0).contains(&percentage));
            seen.push(current);
        }
        if is_terminal_status(&event) {
            assert_eq!(event.status_value(), Some("completed"));
            break;
        }
    }

    assert!(!seen.is_empty());
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress regressed: {:?}", seen);
    let task = h.manager.get(&id).await.unwrap();
    assert_eq!(task.progress.current, task.progress.total);
    assert_eq!(task.progress.total, 3.0);
}

#[tokio::test]
async fn terminal_task_subscription_gets_one_status_event() {
    let h = harness(1);
    let id = h
        .manager
        .submit_single(SingleRequest {
            url: video("kkkkkkkkkkk"),
            options: options(360),
        })
        .await
        .unwrap();
    finish(&h.manager, &id).await;

    let mut session = h.manager.observe().unwrap();
    session
        .handle(ObserverCommand::Subscribe { task_id: id.clone() })
        .await;

    let event = next_event(&mut session).await;
    assert!(event.is_status());
    assert_eq!(event.status_value(), Some("completed"));
    assert_eq!(event.task_id.as_deref(), Some(id.as_str()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(session.try_recv().is_none());
    assert_eq!(h.manager.broadcaster().subscriber_count(&id), 0);
}

#[tokio::test]
async fn unknown_task_subscription_reports_not_found() {
    let h = harness(1);
    let mut session = h.manager.observe().unwrap();
    session
        .handle(ObserverCommand::Subscribe {
            task_id: "single_missing".into(),
        })
        .await;
    let event = next_event(&mut session).await;
    assert_eq!(event.status_value(), Some("not_found"));

    let err = h.manager.get("single_missing").await.unwrap_err();
    assert_eq!(err.error_type(), "NotFoundError");
}

#[tokio::test]
async fn cancelling_running_batch_accounts_for_every_unit() {
    let h = harness(2);
    let id = h
        .manager
        .submit_batch(BatchRequest {
            urls: (1..=4).map(|i| video(&format!("hang000000{}", i))).collect(),
            options: options(720),
            max_concurrent: None,
        })
        .await
        .unwrap();

    let direct = Arc::clone(&h.direct);
    wait_until(move || direct.in_flight() == 2).await;
    assert_eq!(h.manager.get(&id).await.unwrap().status, TaskStatus::InProgress);

    h.manager.cancel(&id).await.unwrap();
    let task = finish(&h.manager, &id).await;
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.result.succeeded.is_empty());
    assert_eq!(task.result.failed.len(), 4);
    assert!(task.result.failed.iter().all(|f| f.error.error_type == "CancelledError"));
    assert_eq!(h.direct.fetches(), 2);

    // idempotent
    let again = h.manager.cancel(&id).await.unwrap();
    assert_eq!(again.status, TaskStatus::Cancelled);
    assert_eq!(again.result.failed.len(), 4);
}

#[tokio::test]
async fn cancelling_pending_task_is_immediate() {
    let h = harness(1);
    let blocker = h
        .manager
        .submit_single(SingleRequest {
            url: video("hang0000009"),
            options: options(720),
        })
        .await
        .unwrap();
    let direct = Arc::clone(&h.direct);
    wait_until(move || direct.in_flight() == 1).await;

    let queued = h
        .manager
        .submit_batch(BatchRequest {
            urls: vec![video("lllllllllll"), video("mmmmmmmmmmm")],
            options: options(720),
            max_concurrent: None,
        })
        .await
        .unwrap();
    assert_eq!(h.manager.get(&queued).await.unwrap().status, TaskStatus::Pending);

    let task = h.manager.cancel(&queued).await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.result.failed.len(), 2);
    assert_eq!(h.manager.queued_units(), 0);

    h.manager.cancel(&blocker).await.unwrap();
    assert_eq!(finish(&h.manager, &blocker).await.status, TaskStatus::Cancelled);
    assert_eq!(h.direct.fetches(), 1);
}

#[tokio::test]
async fn cancelling_finished_task_changes_nothing() {
    let h = harness(1);
    let id = h
        .manager
        .submit_single(SingleRequest {
            url: video("nnnnnnnnnnn"),
            options: options(720),
        })
        .await
        .unwrap();
    let done = finish(&h.manager, &id).await;

    let after = h.manager.cancel(&id).await.unwrap();
    assert_eq!(after.status, TaskStatus::Completed);
    assert_eq!(after.updated_at, done.updated_at);
    assert_eq!(after.result.succeeded.len(), 1);
}

#[tokio::test]
async fn worker_pool_bounds_concurrency_across_tasks() {
    let h = harness_with(config(2), Duration::from_millis(10));
    let mut ids = Vec::new();
    for batch in 0..2 {
        let urls = (0..3).map(|i| video(&format!("pool{}{}00000", batch, i))).collect();
        let id = h
            .manager
            .submit_batch(BatchRequest {
                urls,
                options: options(720),
                max_concurrent: None,
            })
            .await
            .unwrap();
        ids.push(id);
    }

    for id in &ids {
        assert_eq!(finish(&h.manager, id).await.status, TaskStatus::Completed);
    }
    assert_eq!(h.direct.fetches(), 6);
    assert!(h.direct.peak() <= 2, "peak {}", h.direct.peak());
}

#[tokio::test]
async fn batch_cap_limits_its_own_parallelism() {
    let h = harness_with(config(3), Duration::from_millis(10));
    let id = h
        .manager
        .submit_batch(BatchRequest {
            urls: (0..3).map(|i| video(&format!("capped{}0000", i))).collect(),
            options: options(720),
            max_concurrent: Some(1),
        })
        .await
        .unwrap();

    assert_eq!(finish(&h.manager, &id).await.result.succeeded.len(), 3);
    assert_eq!(h.direct.peak(), 1);
}

#[tokio::test]
async fn observer_leaving_mid_task_does_not_disturb_it() {
    let h = harness_with(config(1), Duration::from_millis(20));
    let mut session = h.manager.observe().unwrap();
    let id = h
        .manager
        .submit_single(SingleRequest {
            url: video("ooooooooooo"),
            options: options(720),
        })
        .await
        .unwrap();
    session
        .handle(ObserverCommand::Subscribe { task_id: id.clone() })
        .await;
    next_event(&mut session).await;
    drop(session);

    let task = finish(&h.manager, &id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    let stats = h.manager.broadcaster().stats();
    assert_eq!(stats.active_connections, 0);
    assert_eq!(stats.total_connections, 1);
    assert_eq!(h.manager.broadcaster().subscriber_count(&id), 0);
}

#[tokio::test]
async fn playlist_selection_becomes_units() {
    let h = harness(2);
    let id = h
        .manager
        .submit_playlist(PlaylistRequest {
            url: "https://www.youtube.com/playlist?list=PL1".into(),
            options: options(720),
            selection: PlaylistSelection {
                start: Some(1),
                max_items: Some(2),
                reverse: true,
                ..Default::default()
            },
        })
        .await
        .unwrap();

    let task = finish(&h.manager, &id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    let urls: Vec<&str> = task.units.iter().map(|u| u.url.as_str()).collect();
    assert_eq!(urls, vec!["https://youtu.be/vidplaylst2", "https://youtu.be/vidplaylst1"]);
    assert_eq!(task.result.succeeded[0].title.as_deref(), Some("Entry 2"));
}

#[tokio::test]
async fn empty_playlist_fails_admission() {
    let h = harness(1);
    let id = h
        .manager
        .submit_playlist(PlaylistRequest {
            url: "https://www.youtube.com/playlist?list=EMPTY".into(),
            options: options(720),
            selection: PlaylistSelection::default(),
        })
        .await
        .unwrap();

    let task = finish(&h.manager, &id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.units.is_empty());
    assert_eq!(task.error.unwrap().error_type, "ContentUnavailableError");
}

#[tokio::test]
async fn bad_submissions_are_rejected_synchronously() {
    let h = harness(1);

    let err = h
        .manager
        .submit_single(SingleRequest {
            url: video("ppppppppppp"),
            options: options(100),
        })
        .await
        .unwrap_err();
    assert_eq!(err.error_type(), "ValidationError");

    let err = h
        .manager
        .submit_single(SingleRequest {
            url: "not a url".into(),
            options: options(720),
        })
        .await
        .unwrap_err();
    assert_eq!(err.error_type(), "ValidationError");

    let err = h
        .manager
        .submit_batch(BatchRequest {
            urls: vec![],
            options: options(720),
            max_concurrent: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.error_type(), "ValidationError");

    let err = h
        .manager
        .submit_playlist(PlaylistRequest {
            url: video("qqqqqqqqqqq"),
            options: options(720),
            selection: PlaylistSelection::default(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.error_type(), "ValidationError");

    assert!(h.manager.list().await.is_empty());
}

#[tokio::test]
async fn thumbnail_and_captions_use_render_backend() {
    let h = harness(2);
    let thumb = h.manager.submit_thumbnail(&video("rrrrrrrrrrr")).await.unwrap();
    let subs = h
        .manager
        .submit_captions(&video("sssssssssss"), vec!["en".into(), "de".into()])
        .await
        .unwrap();

    let thumb = finish(&h.manager, &thumb).await;
    let subs = finish(&h.manager, &subs).await;
    assert_eq!(thumb.result.succeeded[0].kind, ArtifactKind::Thumbnail);
    assert_eq!(subs.result.succeeded[0].kind, ArtifactKind::Captions);
    assert_eq!(h.render.fetches(), 2);
    assert_eq!(h.direct.fetches(), 0);
}

#[tokio::test]
async fn metadata_lookup_is_synchronous() {
    let h = harness(1);
    let info = h.manager.extract_metadata(&video("ttttttttttt")).await.unwrap();
    assert_eq!(info.title, "Clip");
    assert_eq!(info.available_qualities(), vec![360, 480, 720, 1080, 1440]);

    let err = h.manager.extract_metadata("https://example.com/x").await.unwrap_err();
    assert_eq!(err.error_type(), "ValidationError");
}

#[tokio::test]
async fn observer_commands_are_answered() {
    let h = harness(1);
    let mut session = h.manager.observe().unwrap();

    session.handle_text(r#"{"type":"ping"}"#).await;
    assert_eq!(next_event(&mut session).await.event_type, EventType::Pong);

    session.handle_text(r#"{"type":"stats"}"#).await;
    let stats = next_event(&mut session).await;
    assert_eq!(stats.event_type, EventType::Stats);
    assert_eq!(stats.data["active_connections"], 1);

    session.handle_text("{not json").await;
    let error = next_event(&mut session).await;
    assert_eq!(error.event_type, EventType::Error);
    assert_eq!(error.data["error_type"], "ValidationError");

    session.handle_text(r#"{"type":"shout"}"#).await;
    assert_eq!(next_event(&mut session).await.event_type, EventType::Error);
}

#[tokio::test]
async fn observer_connections_are_capped() {
    let h = harness_with(
        AppConfig {
            max_observer_connections: 1,
            ..config(1)
        },
        Duration::from_millis(5),
    );
    let first = h.manager.observe().unwrap();
    assert_eq!(h.manager.observe().unwrap_err().error_type(), "InvalidStateError");
    drop(first);
    assert!(h.manager.observe().is_ok());
}

#[tokio::test]
async fn finished_tasks_expire_after_retention() {
    let h = harness(1);
    let id = h
        .manager
        .submit_single(SingleRequest {
            url: video("uuuuuuuuuuu"),
            options: options(720),
        })
        .await
        .unwrap();
    finish(&h.manager, &id).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(h.manager.registry().sweep_expired(Duration::ZERO).await, 1);
    assert_eq!(h.manager.get(&id).await.unwrap_err().error_type(), "NotFoundError");
}
