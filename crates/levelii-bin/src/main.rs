//! `levelii`: continuous NEXRAD Level II ingestion service.
//!
//! Two modes:
//!
//! - `run`: the daemon. Discovers newly-published archives for the
//!   monitored stations, decodes them and maintains the on-disk frame
//!   store with retention.
//! - `convert`: one-shot offline decode of a local archive file into
//!   the same artifact layout.
//!
//! Configuration precedence, lowest to highest: built-in defaults, the
//! persisted `config.json`, `NEXRAD_*` environment variables, CLI
//! flags.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use levelii_core::Product;
use levelii_decode::{decode_products, encode_pointcloud, project_pointcloud, DecodeOptions};
use levelii_fetch::{FetcherConfig, FrameFetcher, ObjectStore, S3HttpStore, ALL_STATIONS};
use levelii_storage::{project_frame, FrameStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "levelii")]
#[command(about = "NEXRAD Level II ingestion and decoding service", long_about = None)]
struct Cli {
    /// Data directory; defaults to data/levelii next to the executable.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ingestion daemon until interrupted.
    Run {
        /// Fetch up to max_frames_per_station historical archives per
        /// station on cold start (default: latest archive only).
        #[arg(long)]
        catchup: bool,

        /// Comma-separated station list, or ALL.
        #[arg(long)]
        stations: Option<String>,

        /// Decode worker count.
        #[arg(long)]
        threads: Option<usize>,

        /// Pre-allocated buffer count.
        #[arg(long)]
        buffer_count: Option<usize>,

        /// Per-buffer capacity in MiB.
        #[arg(long)]
        buffer_size: Option<usize>,
    },

    /// Decode one local archive file into the frame store.
    Convert {
        /// Path to an Archive II file (LDM, bzip2 or uncompressed).
        file: PathBuf,

        /// Products to decode.
        #[arg(long, value_delimiter = ',', default_value = "reflectivity")]
        products: Vec<Product>,

        /// Also export each frame as an earth-coordinate point cloud
        /// (base64 float16) beside its artifacts.
        #[arg(long)]
        pointcloud: bool,
    },
}

fn default_data_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("data")
        .join("levelii")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);

    match cli.command {
        Commands::Run {
            catchup,
            stations,
            threads,
            buffer_count,
            buffer_size,
        } => {
            run_daemon(
                data_dir,
                catchup,
                stations,
                threads,
                buffer_count,
                buffer_size,
            )
            .await
        }
        Commands::Convert {
            file,
            products,
            pointcloud,
        } => convert_file(data_dir, &file, &products, pointcloud),
    }
}

async fn run_daemon(
    data_dir: PathBuf,
    catchup: bool,
    stations: Option<String>,
    threads: Option<usize>,
    buffer_count: Option<usize>,
    buffer_size_mb: Option<usize>,
) -> Result<()> {
    info!(data_dir = %data_dir.display(), "level II ingestion service starting");

    let mut config = FetcherConfig::load(&data_dir)
        .unwrap_or_else(|err| {
            warn!(%err, "persisted config unreadable, using defaults");
            None
        })
        .unwrap_or_default();
    config.apply_env_overrides();

    // CLI beats environment and stored values.
    if let Some(stations) = stations {
        if stations == ALL_STATIONS || stations == "*" {
            config.monitored_stations = [ALL_STATIONS.to_string()].into_iter().collect();
        } else {
            config.monitored_stations = stations
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }
    if let Some(threads) = threads {
        config.fetcher_thread_pool_size = threads;
    }
    if let Some(count) = buffer_count {
        config.buffer_pool_size = count;
    }
    if let Some(mb) = buffer_size_mb {
        config.buffer_size = mb * 1024 * 1024;
    }
    config.catchup_enabled = catchup;

    info!(
        stations = ?config.monitored_stations,
        threads = config.fetcher_thread_pool_size,
        buffers = config.buffer_pool_size,
        buffer_mb = config.buffer_size / (1024 * 1024),
        catchup = config.catchup_enabled,
        "effective configuration"
    );

    let storage = Arc::new(FrameStore::open(&data_dir).context("opening frame store")?);
    let object_store: Arc<dyn ObjectStore> = Arc::new(S3HttpStore::new());
    let fetcher = FrameFetcher::new(Arc::clone(&storage), object_store, config, &data_dir);

    fetcher.start();
    info!("ingestion running; press ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");

    fetcher.stop().await;
    storage.shutdown();
    info!("level II ingestion service stopped cleanly");
    Ok(())
}

fn convert_file(
    data_dir: PathBuf,
    file: &PathBuf,
    products: &[Product],
    pointcloud: bool,
) -> Result<()> {
    let data = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    info!(file = %file.display(), bytes = data.len(), "converting archive");

    let mut scratch = Vec::new();
    let frames = decode_products(
        &data,
        products,
        "UNKNOWN",
        "00000000_000000",
        &mut scratch,
        &DecodeOptions::default(),
    );

    let storage = FrameStore::open(&data_dir).context("opening frame store")?;
    let mut artifacts = 0usize;
    for (product, frame) in &frames {
        if !frame.has_samples() {
            warn!(product = %product, "no samples decoded");
            continue;
        }
        let Some(projected) = project_frame(frame) else {
            warn!(product = %product, "frame has no usable geometry");
            continue;
        };
        for artifact in &projected.tilts {
            storage
                .save_tilt(&frame.station, *product, &frame.timestamp, artifact)
                .with_context(|| format!("storing {product} tilt {:.1}", artifact.tilt))?;
            artifacts += 1;
        }
        if let Some(volumetric) = &projected.volumetric {
            storage
                .save_volumetric(&frame.station, *product, &frame.timestamp, volumetric)
                .context("storing volumetric grid")?;
            artifacts += 1;
        }
        if pointcloud {
            let points = project_pointcloud(frame);
            storage
                .save_pointcloud(
                    &frame.station,
                    *product,
                    &frame.timestamp,
                    &encode_pointcloud(&points),
                )
                .context("storing point-cloud export")?;
            info!(product = %product, points = points.len(), "point cloud exported");
            artifacts += 1;
        }
        info!(
            product = %product,
            station = %frame.station,
            timestamp = %frame.timestamp,
            sweeps = frame.sweeps.len(),
            tilts = projected.tilts.len(),
            vcp = frame.vcp_number,
            "frame converted"
        );
    }
    storage.shutdown();

    if artifacts == 0 {
        anyhow::bail!("no artifacts produced from {}", file.display());
    }
    info!(artifacts, data_dir = %data_dir.display(), "conversion complete");
    Ok(())
}
