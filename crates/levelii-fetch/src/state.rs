//! Per-station progress persistence.
//!
//! After every discovery pass the station cursors and counters are
//! written to `state.json` as one blob, so a restart resumes exactly
//! where the previous process stopped.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::info;

/// Persisted file name under the data directory.
pub const STATE_FILE: &str = "state.json";

/// Progress and counters for one station.
///
/// `last_processed_key` is the incremental listing cursor; it is
/// monotonically non-decreasing across passes and restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StationStats {
    pub last_processed_key: String,
    pub frames_fetched: u64,
    pub frames_failed: u64,
    /// Nanoseconds since the epoch of the last fetch attempt.
    pub last_fetch_timestamp: i64,
    /// Volume timestamp of the newest stored frame.
    pub last_frame_timestamp: String,
    /// Nanoseconds since the epoch of the last discovery scan.
    pub last_scan_timestamp: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    station_stats: HashMap<String, StationStats>,
}

/// Load station state from `data_path/state.json`; an absent file is
/// an empty state.
pub fn load_state(data_path: &Path) -> Result<HashMap<String, StationStats>> {
    let path = data_path.join(STATE_FILE);
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let bytes = fs::read(&path).with_context(|| format!("reading state {}", path.display()))?;
    let state: PersistedState = serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing state {}", path.display()))?;
    info!(
        path = %path.display(),
        stations = state.station_stats.len(),
        "loaded station state"
    );
    Ok(state.station_stats)
}

/// Write station state to `data_path/state.json`.
pub fn save_state(data_path: &Path, stats: &HashMap<String, StationStats>) -> Result<()> {
    fs::create_dir_all(data_path)
        .with_context(|| format!("creating data dir {}", data_path.display()))?;
    let state = PersistedState {
        station_stats: stats.clone(),
    };
    let path = data_path.join(STATE_FILE);
    let json = serde_json::to_vec_pretty(&state).context("encoding state")?;
    fs::write(&path, json).with_context(|| format!("writing state {}", path.display()))
}
