use std::sync::Arc;
use crate::errors::{AppError, Result};
use super::{BackendKind, Downloader, MediaInfo, Operation, WorkUnit};

/// A routing decision: which backend handles the unit.
#[derive(Clone)]
pub struct Route {
    pub kind: BackendKind,
    pub backend: Arc<dyn Downloader>,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("kind", &self.kind)
            .field("backend", &self.backend.get_name())
            .finish()
    }
}

/// Chooses between the fast/direct and render/merge backends.
pub struct RoutingPolicy {
    direct: Arc<dyn Downloader>,
    render: Arc<dyn Downloader>,
    max_quality_direct: u32,
}

impl RoutingPolicy {
    pub fn new(direct: Arc<dyn Downloader>, render: Arc<dyn Downloader>, max_quality_direct: u32) -> Self {
        Self {
            direct,
            render,
            max_quality_direct,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.max_quality_direct
    }

    /// Pure selection on operation and requested quality. Caption and
    /// thumbnail flags do not affect the choice; both backends write them.
    pub fn select(&self, unit: &WorkUnit) -> BackendKind {
        match unit.operation {
            Operation::Download if unit.options.quality <= self.max_quality_direct => BackendKind::Direct,
            _ => BackendKind::Render,
        }
    }

    pub fn backend(&self, kind: BackendKind) -> Arc<dyn Downloader> {
        match kind {
            BackendKind::Direct => Arc::clone(&self.direct),
            BackendKind::Render => Arc::clone(&self.render),
        }
    }

    /// Backend used for availability probes and metadata extraction.
    pub fn metadata_backend(&self) -> Arc<dyn Downloader> {
        Arc::clone(&self.render)
    }

    /// Routes a unit, rejecting downloads whose quality the latest probe
    /// does not offer.
    pub fn route(&self, unit: &WorkUnit, availability: Option<&MediaInfo>) -> Result<Route> {
        if unit.operation == Operation::Download {
            if let Some(info) = availability {
                let available = info.available_qualities();
                if !available.is_empty() && !info.offers_quality(unit.options.quality) {
                    return Err(AppError::QualityUnavailable {
                        requested: unit.options.quality,
                        available,
                    });
                }
            }
        }

        let kind = self.select(unit);
        let backend = self.backend(kind);
        if !backend.supports_operation(unit.operation) {
            return Err(AppError::Backend(format!(
                "{} backend cannot perform {:?}",
                backend.get_name(),
                unit.operation
            )));
        }
        log::debug!("[ROUTE] unit {} ({}p, {:?}) -> {}", unit.index, unit.options.quality, unit.operation, backend.get_name());
        Ok(Route { kind, backend })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::{ArtifactRef, FetchContext, UnitOptions};
    use tokio_util::sync::CancellationToken;

    struct Named(BackendKind);

    #[async_trait::async_trait]
    impl Downloader for Named {
        async fn probe(&self, _url: &str, _cancel: &CancellationToken) -> Result<MediaInfo> {
            Ok(MediaInfo::default())
        }

        async fn fetch(&self, _unit: &WorkUnit, _ctx: &FetchContext) -> Result<ArtifactRef> {
            Err(AppError::Backend("not used".into()))
        }

        fn supports_operation(&self, operation: Operation) -> bool {
            self.0 == BackendKind::Render || operation == Operation::Download
        }

        fn kind(&self) -> BackendKind {
            self.0
        }

        fn get_name(&self) -> &str {
            match self.0 {
                BackendKind::Direct => "direct",
                BackendKind::Render => "render",
            }
        }
    }

    fn policy() -> RoutingPolicy {
        RoutingPolicy::new(Arc::new(Named(BackendKind::Direct)), Arc::new(Named(BackendKind::Render)), 720)
    }

    fn unit(operation: Operation, quality: u32) -> WorkUnit {
        WorkUnit::new(
            "https://youtu.be/dQw4w9WgXcQ",
            operation,
            UnitOptions {
                quality,
                ..Default::default()
            },
        )
    }

    #[test]
    fn threshold_splits_downloads() {
        let policy = policy();
        for q in [144, 360, 480, 720] {
            assert_eq!(policy.select(&unit(Operation::Download, q)), BackendKind::Direct);
        }
        for q in [1080, 1440, 2160] {
            assert_eq!(policy.select(&unit(Operation::Download, q)), BackendKind::Render);
        }
    }

    #[test]
    fn non_download_operations_always_render() {
        let policy = policy();
        for op in [Operation::Metadata, Operation::Captions, Operation::Thumbnail] {
            assert_eq!(policy.select(&unit(op, 360)), BackendKind::Render);
            assert_eq!(policy.route(&unit(op, 360), None).unwrap().backend.get_name(), "render");
        }
    }

    #[test]
    fn extras_do_not_change_the_route() {
        let policy = policy();

        let mut u = unit(Operation::Download, 360);
        u.options.include_subtitles = true;
        assert_eq!(policy.select(&u), BackendKind::Direct);

        let mut u = unit(Operation::Download, 480);
        u.options.download_thumbnail = true;
        assert_eq!(policy.select(&u), BackendKind::Direct);

        let mut u = unit(Operation::Download, 1080);
        u.options.include_subtitles = true;
        u.options.download_thumbnail = true;
        assert_eq!(policy.select(&u), BackendKind::Render);
    }

    #[test]
    fn unavailable_quality_is_rejected_with_choices() {
        let info = MediaInfo {
            progressive_qualities: vec![360, 720],
            video_only_qualities: vec![1080],
            ..Default::default()
        };
        match policy().route(&unit(Operation::Download, 1440), Some(&info)) {
            Err(AppError::QualityUnavailable { requested, available }) => {
                assert_eq!(requested, 1440);
                assert_eq!(available, vec![360, 720, 1080]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(policy().route(&unit(Operation::Download, 1080), Some(&info)).unwrap().kind, BackendKind::Render);
    }
}
