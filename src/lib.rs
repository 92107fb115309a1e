pub mod db;
pub mod log_store;
pub mod models;
pub mod positioning;
pub mod settings;
pub mod tracking;
pub mod uploader;
pub mod utils;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};
use tokio::io::{AsyncBufRead, BufReader};
use tokio_util::sync::CancellationToken;

use db::Database;
use log_store::LogStore;
use models::Coordinate;
use positioning::{
    replay::{replay_feed, ReplayStatus},
    AuthorizationStatus, ReplayPositioning,
};
use settings::SettingsStore;
use tracking::TrackerHandle;
use uploader::HttpUploader;

const HISTORY_LIMIT: usize = 20;

#[derive(Debug, Parser)]
#[command(name = "gpspinger", version, about = "Adaptive GPS ping scheduler")]
struct Cli {
    /// Directory holding settings.json and the SQLite database.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start tracking and drive it from a recorded positioning feed.
    Run {
        /// Newline-delimited JSON records, or `-` for stdin.
        #[arg(long, value_name = "PATH")]
        replay: String,
        /// Delay between replayed records.
        #[arg(long, default_value_t = 200)]
        pace_ms: u64,
    },
    /// Stop tracking and forget the persisted "tracking on" flag.
    Stop,
    /// Store an explicit home coordinate.
    SetHome {
        #[arg(long, allow_hyphen_values = true)]
        latitude: f64,
        #[arg(long, allow_hyphen_values = true)]
        longitude: f64,
    },
    /// Print settings, tracking flag and recent ping history.
    Status,
}

struct Services {
    db: Database,
    settings: Arc<SettingsStore>,
}

impl Services {
    fn open(data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let db = Database::new(data_dir.join("gpspinger.sqlite3"))?;
        let settings = Arc::new(SettingsStore::new(data_dir.join("settings.json"))?);
        Ok(Self { db, settings })
    }

    async fn tracker(
        &self,
        positioning: Arc<ReplayPositioning>,
        logs: LogStore,
    ) -> Result<TrackerHandle> {
        let uploader = Arc::new(HttpUploader::new()?);
        let (handle, _task) = TrackerHandle::spawn(
            positioning,
            uploader,
            Arc::clone(&self.settings),
            logs,
            self.db.clone(),
        )
        .await?;
        Ok(handle)
    }
}

pub fn run() -> Result<()> {
    utils::init_logging(LevelFilter::Info);

    let cli = Cli::parse();
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => dirs::data_dir()
            .ok_or_else(|| anyhow!("no data directory available; pass --data-dir"))?
            .join("gpspinger"),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(async move {
        info!("GPS pinger starting up...");
        let services = Services::open(data_dir)?;

        match cli.command {
            Command::Run { replay, pace_ms } => {
                run_replay(&services, &replay, Duration::from_millis(pace_ms)).await
            }
            Command::Stop => stop(&services).await,
            Command::SetHome {
                latitude,
                longitude,
            } => set_home(&services, Coordinate::new(latitude, longitude)).await,
            Command::Status => status(&services).await,
        }
    })
}

async fn run_replay(services: &Services, source: &str, pace: Duration) -> Result<()> {
    let reader: Box<dyn AsyncBufRead + Unpin + Send> = if source == "-" {
        Box::new(BufReader::new(tokio::io::stdin()))
    } else {
        let file = tokio::fs::File::open(source)
            .await
            .with_context(|| format!("failed to open replay feed {source}"))?;
        Box::new(BufReader::new(file))
    };

    let positioning = Arc::new(ReplayPositioning::new(AuthorizationStatus::NotDetermined));
    let logs = LogStore::new();
    let tracker = services.tracker(Arc::clone(&positioning), logs.clone()).await?;

    tracker.start().await?;
    // Let the authorization grant reach the tracker before the first fix.
    tracker.snapshot().await?;

    let cancel_token = CancellationToken::new();
    {
        let cancel_token = cancel_token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel_token.cancel();
            }
        });
    }

    let delivered = replay_feed(Arc::clone(&positioning), reader, pace, cancel_token).await?;
    info!("Replayed {delivered} positioning records");

    let snapshot = tracker.snapshot().await?;
    tracker.shutdown().await?;

    for entry in logs.entries() {
        println!("{} {}", entry.timestamp.to_rfc3339(), entry.message);
    }
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    println!("{}", describe_radio(&positioning.status()));
    Ok(())
}

fn describe_radio(status: &ReplayStatus) -> String {
    let on_off = |enabled: bool| if enabled { "on" } else { "off" };
    format!(
        "Radio: continuous={}, significant-changes={}, visits={}, accuracy={}m, filter={}m, regions={}",
        on_off(status.continuous),
        on_off(status.significant_changes),
        on_off(status.visits),
        status.desired_accuracy.meters(),
        status.distance_filter,
        status.regions.len(),
    )
}

async fn stop(services: &Services) -> Result<()> {
    let positioning = Arc::new(ReplayPositioning::new(AuthorizationStatus::NotDetermined));
    let tracker = services.tracker(positioning, LogStore::new()).await?;
    let result = tracker.stop().await;
    tracker.shutdown().await?;
    result?;
    println!("Tracking stopped.");
    Ok(())
}

async fn set_home(services: &Services, coordinate: Coordinate) -> Result<()> {
    if !(-90.0..=90.0).contains(&coordinate.latitude)
        || !(-180.0..=180.0).contains(&coordinate.longitude)
    {
        return Err(anyhow!(
            "coordinate ({}, {}) is out of range",
            coordinate.latitude,
            coordinate.longitude
        ));
    }

    let positioning = Arc::new(ReplayPositioning::new(AuthorizationStatus::NotDetermined));
    let logs = LogStore::new();
    let tracker = services.tracker(positioning, logs.clone()).await?;
    let result = tracker.set_home(coordinate, "command line").await;
    tracker.shutdown().await?;
    result?;

    for entry in logs.entries() {
        println!("{}", entry.message);
    }
    Ok(())
}

async fn status(services: &Services) -> Result<()> {
    let settings = services.settings.current();
    let tracking = services.db.is_tracking_enabled().await?;
    let device_id = services.db.device_id().await?;
    let history = services.db.recent_ping_attempts(HISTORY_LIMIT).await?;

    println!("Device: {device_id}");
    println!("Tracking: {}", if tracking { "on" } else { "off" });
    println!("Settings: {}", serde_json::to_string_pretty(&settings)?);

    if history.is_empty() {
        println!("No pings recorded yet.");
        return Ok(());
    }

    println!("Recent pings:");
    for attempt in history {
        println!(
            "  {} {:<13} {:<6} ({:.5}, {:.5}) ±{:.0}m{}",
            attempt.attempted_at.to_rfc3339(),
            attempt.mode.as_str(),
            attempt.outcome.as_str(),
            attempt.latitude,
            attempt.longitude,
            attempt.horizontal_accuracy,
            attempt
                .detail
                .map(|detail| format!(" {detail}"))
                .unwrap_or_default(),
        );
    }
    Ok(())
}
