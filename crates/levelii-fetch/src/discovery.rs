//! Discovery planning: key filtering, cursors and batching.
//!
//! Pure functions over listings so the scan policy is testable without
//! a live store. Archive keys follow
//! `YYYY/MM/DD/STATION/STATIONYYYYMMDD_HHMMSS_V06`.

use chrono::{DateTime, Utc};

/// Bucket the network publishes Level II archives to.
pub const DEFAULT_BUCKET: &str = "unidata-nexrad-level2";
/// Items per batch handed to the fetch stage.
pub const BATCH_SIZE: usize = 5;
/// Keys with shorter filenames than this are not archives.
const MIN_FILENAME_LEN: usize = 20;

/// One discovered archive to fetch.
#[derive(Debug, Clone)]
pub struct DiscoveryItem {
    pub station: String,
    pub bucket: String,
    pub key: String,
    /// `YYYYMMDD_HHMMSS`, extracted from the filename.
    pub timestamp: String,
}

/// A station's batch of discovery items, processed in key order on a
/// single fetch task.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryBatch {
    pub station: String,
    pub items: Vec<DiscoveryItem>,
}

/// Day prefix for listings: `YYYY/MM/DD/` or `YYYY/MM/DD/STATION/`.
pub fn day_prefix(now: DateTime<Utc>, station: Option<&str>) -> String {
    let date = now.format("%Y/%m/%d");
    match station {
        Some(station) => format!("{date}/{station}/"),
        None => format!("{date}/"),
    }
}

/// Extract the station from a delimiter listing's common prefix
/// (`YYYY/MM/DD/STATION/`).
pub fn station_from_prefix(prefix: &str) -> Option<String> {
    let trimmed = prefix.strip_suffix('/')?;
    let station = trimmed.rsplit('/').next()?;
    if station.is_empty() {
        return None;
    }
    Some(station.to_string())
}

/// Whether a key names a fetchable archive: long enough and not a
/// `*_MDM` metadata companion.
pub fn key_eligible(key: &str) -> bool {
    let filename = filename_of(key);
    filename.len() >= MIN_FILENAME_LEN && !filename.contains("_MDM")
}

/// Derive the volume timestamp from an archive key, e.g.
/// `.../KTLX20270213_162244_V06` yields `20270213_162244`.
pub fn timestamp_from_key(key: &str) -> Option<String> {
    let filename = filename_of(key);
    let date = filename.get(4..12)?;
    let underscore = filename.find('_')?;
    let time = filename.get(underscore + 1..underscore + 7)?;
    Some(format!("{date}_{time}"))
}

fn filename_of(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Select the keys a scan should fetch.
///
/// With a cursor present, everything the listing returned is new (the
/// listing started after the cursor). On a cold start, catch-up takes
/// the newest `max_frames` keys; otherwise only the latest one.
pub fn plan_targets<'a>(
    sorted_keys: &'a [String],
    cursor: &str,
    catchup: bool,
    max_frames: usize,
) -> &'a [String] {
    if sorted_keys.is_empty() {
        return sorted_keys;
    }
    if !cursor.is_empty() {
        return sorted_keys;
    }
    if catchup {
        let take = max_frames.min(sorted_keys.len());
        &sorted_keys[sorted_keys.len() - take..]
    } else {
        &sorted_keys[sorted_keys.len() - 1..]
    }
}
