//! Orchestration core for fetching remote media.
//!
//! A submission becomes a [`downloader::Task`] made of work units. Units are
//! routed to a fast single-stream backend or a render/merge backend, executed
//! on a bounded worker pool with per-unit error isolation, and every state
//! change is pushed to subscribed observers through the
//! [`broadcaster::ProgressBroadcaster`].

pub mod broadcaster;
pub mod config;
pub mod downloader;
pub mod errors;
pub mod processing;
pub mod security;
pub mod utils;

pub use broadcaster::{EventEnvelope, EventType, ObserverCommand, ObserverSession, ProgressBroadcaster};
pub use config::AppConfig;
pub use downloader::manager::{BatchRequest, DownloadManager, PlaylistRequest, SingleRequest};
pub use downloader::selection::PlaylistSelection;
pub use downloader::{
    ArtifactRef, Downloader, MediaInfo, Operation, OutputFormat, Task, TaskKind, TaskStatus, UnitOptions, WorkUnit,
};
pub use errors::{AppError, ErrorInfo, Result};
