//! Scheduler configuration.
//!
//! Precedence, lowest to highest: built-in defaults, the persisted
//! `config.json`, environment variables, CLI flags. The file is
//! rewritten whenever the configuration is mutated at runtime.

use anyhow::{Context, Result};
use levelii_core::Product;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Sentinel station name that expands to every station published for
/// the current day.
pub const ALL_STATIONS: &str = "ALL";

/// Persisted file name under the data directory.
pub const CONFIG_FILE: &str = "config.json";

/// All runtime-tunable scheduler options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// Stations to monitor; may contain the [`ALL_STATIONS`] sentinel.
    pub monitored_stations: BTreeSet<String>,
    /// Moments decoded from every fetched archive.
    pub products: Vec<Product>,

    /// Discovery cadence.
    pub scan_interval_seconds: u64,
    /// Retention bound and cold-start catch-up depth.
    pub max_frames_per_station: usize,
    /// Retention cadence.
    pub cleanup_interval_seconds: u64,
    pub auto_cleanup_enabled: bool,
    /// Cold start fetches the newest `max_frames_per_station` archives
    /// when enabled, only the latest one otherwise.
    pub catchup_enabled: bool,

    /// Decode concurrency.
    pub fetcher_thread_pool_size: usize,
    /// Listing concurrency.
    pub discovery_parallelism: usize,
    /// Pre-allocated buffer count.
    pub buffer_pool_size: usize,
    /// Per-buffer capacity in bytes.
    pub buffer_size: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            monitored_stations: ["KTLX", "KCRP", "KEWX"]
                .into_iter()
                .map(String::from)
                .collect(),
            products: vec![
                Product::Reflectivity,
                Product::Velocity,
                Product::CorrelationCoefficient,
            ],
            scan_interval_seconds: 30,
            max_frames_per_station: 30,
            cleanup_interval_seconds: 300,
            auto_cleanup_enabled: true,
            catchup_enabled: true,
            fetcher_thread_pool_size: 8,
            discovery_parallelism: 10,
            buffer_pool_size: 64,
            buffer_size: 120 * 1024 * 1024,
        }
    }
}

impl FetcherConfig {
    /// True when the two configs differ in any knob that requires the
    /// worker pools and buffer pool to be rebuilt.
    pub fn pools_differ(&self, other: &Self) -> bool {
        self.fetcher_thread_pool_size != other.fetcher_thread_pool_size
            || self.discovery_parallelism != other.discovery_parallelism
            || self.buffer_pool_size != other.buffer_pool_size
            || self.buffer_size != other.buffer_size
    }

    /// Load the persisted config from `data_path/config.json`, if any.
    pub fn load(data_path: &Path) -> Result<Option<Self>> {
        let path = data_path.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing config {}", path.display()))?;
        info!(path = %path.display(), "loaded persisted configuration");
        Ok(Some(config))
    }

    /// Persist to `data_path/config.json`.
    pub fn save(&self, data_path: &Path) -> Result<()> {
        fs::create_dir_all(data_path)
            .with_context(|| format!("creating data dir {}", data_path.display()))?;
        let path = data_path.join(CONFIG_FILE);
        let json = serde_json::to_vec_pretty(self).context("encoding config")?;
        fs::write(&path, json).with_context(|| format!("writing config {}", path.display()))
    }

    /// Apply the well-known environment variables on top of this
    /// config. Unparseable values are logged and skipped.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(stations) = std::env::var("NEXRAD_MONITORED_STATIONS") {
            if stations == ALL_STATIONS || stations == "*" {
                self.monitored_stations = [ALL_STATIONS.to_string()].into_iter().collect();
            } else {
                self.monitored_stations = stations
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            info!(stations = %stations, "stations overridden from environment");
        }

        apply_env_usize("NEXRAD_THREADS", &mut self.fetcher_thread_pool_size);
        apply_env_usize("NEXRAD_DISCOVERY_THREADS", &mut self.discovery_parallelism);
        apply_env_usize("NEXRAD_BUFFER_COUNT", &mut self.buffer_pool_size);

        if let Ok(value) = std::env::var("NEXRAD_BUFFER_SIZE_MB") {
            match value.parse::<usize>() {
                Ok(mb) if mb > 0 => self.buffer_size = mb * 1024 * 1024,
                _ => warn!(%value, "ignoring unparseable NEXRAD_BUFFER_SIZE_MB"),
            }
        }
    }
}

fn apply_env_usize(name: &str, slot: &mut usize) {
    if let Ok(value) = std::env::var(name) {
        match value.parse::<usize>() {
            Ok(parsed) if parsed > 0 => {
                info!(name, value = parsed, "applied environment override");
                *slot = parsed;
            }
            _ => warn!(name, %value, "ignoring unparseable environment override"),
        }
    }
}
