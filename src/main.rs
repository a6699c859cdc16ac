use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use std::path::PathBuf;

use mediagrab::{
    AppConfig, BatchRequest, DownloadManager, EventType, ObserverCommand, OutputFormat, PlaylistRequest,
    PlaylistSelection, SingleRequest, UnitOptions,
};

#[derive(Parser)]
#[command(name = "mediagrab", version, about = "Fetch remote media with live progress")]
struct Cli {
    /// Config file (JSON or TOML); defaults to the user config dir
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download one video
    Single {
        url: String,
        #[command(flatten)]
        options: OptionArgs,
    },
    /// Download a playlist, optionally narrowed down
    Playlist {
        url: String,
        #[command(flatten)]
        options: OptionArgs,
        /// First entry to keep (0-based)
        #[arg(long)]
        start: Option<usize>,
        /// Last entry to keep (0-based, inclusive)
        #[arg(long)]
        end: Option<usize>,
        #[arg(long)]
        max_items: Option<usize>,
        #[arg(long)]
        reverse: bool,
    },
    /// Download several URLs as one task
    Batch {
        #[arg(required = true)]
        urls: Vec<String>,
        #[command(flatten)]
        options: OptionArgs,
        /// Per-task parallelism cap
        #[arg(long)]
        max_concurrent: Option<usize>,
    },
    /// Print metadata without downloading
    Info { url: String },
    /// Fetch the thumbnail only
    Thumbnail { url: String },
    /// Fetch captions only
    Captions {
        url: String,
        #[arg(long, value_delimiter = ',', default_value = "en")]
        languages: Vec<String>,
    },
}

#[derive(Args)]
struct OptionArgs {
    /// Target height in pixels
    #[arg(short, long, default_value_t = 720)]
    quality: u32,
    #[arg(short, long, default_value = "mp4")]
    format: String,
    #[arg(long)]
    subtitles: bool,
    #[arg(long, value_delimiter = ',', default_value = "en")]
    sub_langs: Vec<String>,
    #[arg(long)]
    thumbnail: bool,
}

impl OptionArgs {
    fn into_options(self) -> anyhow::Result<UnitOptions> {
        let format: OutputFormat = self.format.parse()?;
        Ok(UnitOptions {
            quality: self.quality,
            format,
            include_subtitles: self.subtitles,
            subtitle_languages: self.sub_langs,
            download_thumbnail: self.thumbnail,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let config = match AppConfig::load_from(cli.config.as_deref()) {
        Ok(config) => {
            info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            log::error!("Failed to load configuration: {}", e);
            AppConfig::default()
        }
    };

    let manager = DownloadManager::new(config).context("failed to start download manager")?;

    let task_id = match cli.command {
        Command::Info { url } => {
            let info = manager.extract_metadata(&url).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            return Ok(());
        }
        Command::Single { url, options } => {
            manager
                .submit_single(SingleRequest {
                    url,
                    options: options.into_options()?,
                })
                .await?
        }
        Command::Playlist {
            url,
            options,
            start,
            end,
            max_items,
            reverse,
        } => {
            manager
                .submit_playlist(PlaylistRequest {
                    url,
                    options: options.into_options()?,
                    selection: PlaylistSelection {
                        start,
                        end,
                        max_items,
                        reverse,
                        ..Default::default()
                    },
                })
                .await?
        }
        Command::Batch {
            urls,
            options,
            max_concurrent,
        } => {
            manager
                .submit_batch(BatchRequest {
                    urls,
                    options: options.into_options()?,
                    max_concurrent,
                })
                .await?
        }
        Command::Thumbnail { url } => manager.submit_thumbnail(&url).await?,
        Command::Captions { url, languages } => manager.submit_captions(&url, languages).await?,
    };

    info!("📊 Task ID: {}", task_id);
    follow(&manager, &task_id).await?;

    let task = manager.get(&task_id).await?;
    println!("{}", serde_json::to_string_pretty(&task)?);
    manager.shutdown();
    Ok(())
}

/// Renders the task's progress events until a terminal status arrives.
/// Ctrl-C cancels the task instead of killing the process.
async fn follow(manager: &DownloadManager, task_id: &str) -> anyhow::Result<()> {
    let mut session = manager.observe()?;
    session
        .handle(ObserverCommand::Subscribe {
            task_id: task_id.to_string(),
        })
        .await;

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] [{bar:40}] {pos:>3}% {msg}")?
            .progress_chars("=> "),
    );

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                bar.set_message("cancelling...");
                manager.cancel(task_id).await?;
                continue;
            }
            event = session.recv() => event,
        };
        let Some(event) = event else { break };

        match event.event_type {
            EventType::Progress => {
                let percentage = event.data.get("percentage").and_then(|v| v.as_f64()).unwrap_or(0.0);
                bar.set_position(percentage.round().clamp(0.0, 100.0) as u64);
                if let Some(speed) = event.data.get("speed").and_then(|v| v.as_f64()) {
                    bar.set_message(format!("{:.1} MiB/s", speed / (1024.0 * 1024.0)));
                }
            }
            EventType::Metadata => {
                if let Some(title) = event.data.get("title").and_then(|v| v.as_str()) {
                    bar.println(format!("🎬 {}", title));
                }
            }
            EventType::Error => {
                let message = event.data.get("error").and_then(|v| v.as_str()).unwrap_or("unknown error");
                bar.println(format!("❌ {}", message));
            }
            EventType::Status => {
                let status = event.status_value().unwrap_or_default().to_string();
                if matches!(status.as_str(), "completed" | "failed" | "cancelled" | "not_found") {
                    bar.finish_with_message(status);
                    break;
                }
                bar.set_message(status);
            }
            _ => {}
        }
    }
    Ok(())
}
