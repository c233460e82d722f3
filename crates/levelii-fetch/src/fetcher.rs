//! The ingestion scheduler.
//!
//! Three long-lived loops drive the pipeline: discovery (per-station
//! listing scans on the discovery pool), fetch (batches popped off the
//! bounded discovery queue and dispatched onto the fetch pool) and
//! cleanup (periodic retention). Worker pools are semaphore-sized task
//! spawns; reconfiguration swaps the semaphores and buffer pool so
//! in-flight work drains on the old ones while new work uses the new.
//!
//! Shutdown is cooperative: a watch signal plus an atomic flag checked
//! at every loop iteration and between per-item operations. No lock is
//! held across I/O or decode work; snapshots are cloned out under the
//! lock and the lock released before any await.

use crate::config::{FetcherConfig, ALL_STATIONS};
use crate::discovery::{
    day_prefix, key_eligible, plan_targets, station_from_prefix, timestamp_from_key,
    DiscoveryBatch, DiscoveryItem, BATCH_SIZE, DEFAULT_BUCKET,
};
use crate::object_store::ObjectStore;
use crate::state::{load_state, save_state, StationStats};
use chrono::Utc;
use levelii_core::Product;
use levelii_decode::{decode_products, DecodeOptions};
use levelii_pool::BufferPool;
use levelii_storage::{project_frame, FrameStore, ProjectedFrame, WriteTask};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Bound on batches waiting between the discovery and fetch stages.
const DISCOVERY_QUEUE_CAPACITY: usize = 64;

/// State guarded by the scheduler mutex: the live config and the pools
/// it sizes.
struct SchedulerState {
    config: FetcherConfig,
    discovery_pool: Arc<Semaphore>,
    fetch_pool: Arc<Semaphore>,
    buffer_pool: BufferPool,
}

impl SchedulerState {
    fn build_pools(config: &FetcherConfig) -> (Arc<Semaphore>, Arc<Semaphore>, BufferPool) {
        (
            Arc::new(Semaphore::new(config.discovery_parallelism.max(1))),
            Arc::new(Semaphore::new(config.fetcher_thread_pool_size.max(1))),
            BufferPool::new(config.buffer_pool_size.max(1), config.buffer_size.max(1)),
        )
    }
}

/// Continuous per-station discovery and fetch over an object store.
pub struct FrameFetcher {
    storage: Arc<FrameStore>,
    object_store: Arc<dyn ObjectStore>,
    data_path: PathBuf,
    bucket: String,
    decode_options: DecodeOptions,

    state: Mutex<SchedulerState>,
    stats: Mutex<HashMap<String, StationStats>>,
    active_scans: Mutex<HashSet<String>>,

    batch_tx: mpsc::Sender<DiscoveryBatch>,
    batch_rx: Mutex<Option<mpsc::Receiver<DiscoveryBatch>>>,

    shutdown_tx: watch::Sender<bool>,
    should_stop: AtomicBool,
    is_running: AtomicBool,

    frames_fetched: AtomicU64,
    frames_failed: AtomicU64,
    last_fetch_timestamp: AtomicI64,

    loop_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    worker_tasks: tokio::sync::Mutex<JoinSet<()>>,
}

impl FrameFetcher {
    /// Build a fetcher over the given storage and object store. Station
    /// state is restored from `data_path/state.json`.
    pub fn new(
        storage: Arc<FrameStore>,
        object_store: Arc<dyn ObjectStore>,
        config: FetcherConfig,
        data_path: impl Into<PathBuf>,
    ) -> Arc<Self> {
        let data_path = data_path.into();
        let stats = load_state(&data_path).unwrap_or_else(|err| {
            warn!(%err, "station state unreadable, starting fresh");
            HashMap::new()
        });

        let (discovery_pool, fetch_pool, buffer_pool) = SchedulerState::build_pools(&config);
        let (batch_tx, batch_rx) = mpsc::channel(DISCOVERY_QUEUE_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            storage,
            object_store,
            data_path,
            bucket: DEFAULT_BUCKET.to_string(),
            decode_options: DecodeOptions::default(),
            state: Mutex::new(SchedulerState {
                config,
                discovery_pool,
                fetch_pool,
                buffer_pool,
            }),
            stats: Mutex::new(stats),
            active_scans: Mutex::new(HashSet::new()),
            batch_tx,
            batch_rx: Mutex::new(Some(batch_rx)),
            shutdown_tx,
            should_stop: AtomicBool::new(false),
            is_running: AtomicBool::new(false),
            frames_fetched: AtomicU64::new(0),
            frames_failed: AtomicU64::new(0),
            last_fetch_timestamp: AtomicI64::new(0),
            loop_tasks: Mutex::new(Vec::new()),
            worker_tasks: tokio::sync::Mutex::new(JoinSet::new()),
        })
    }

    /// Spawn the discovery, fetch and cleanup loops. The loops hold
    /// clones of the shared handle and keep the fetcher alive.
    pub fn start(self: &Arc<Self>) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.should_stop.store(false, Ordering::SeqCst);

        let mut tasks = self.loop_tasks.lock().expect("loop task lock");
        tasks.push(tokio::spawn(Arc::clone(self).discovery_loop()));
        tasks.push(tokio::spawn(Arc::clone(self).fetch_loop()));
        tasks.push(tokio::spawn(Arc::clone(self).cleanup_loop()));
        drop(tasks);
        info!("frame fetcher started");
    }

    /// Cooperative shutdown: signal, join the loops, then wait for
    /// in-flight scans and batch tasks to finish.
    pub async fn stop(&self) {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.should_stop.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<_> = self
            .loop_tasks
            .lock()
            .expect("loop task lock")
            .drain(..)
            .collect();
        for task in tasks {
            if task.await.is_err() {
                error!("scheduler loop panicked");
            }
        }

        let mut workers = self.worker_tasks.lock().await;
        while let Some(result) = workers.join_next().await {
            if result.is_err() {
                error!("worker task panicked");
            }
        }

        self.save_state_snapshot();
        info!("frame fetcher stopped");
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Replace the configuration atomically, rebuilding the pools when
    /// any sizing knob changed. In-flight tasks drain on the old pools.
    pub fn reconfigure(&self, new_config: FetcherConfig) {
        let pools_changed = {
            let mut state = self.state.lock().expect("state lock");
            let changed = state.config.pools_differ(&new_config);
            state.config = new_config;
            if changed {
                let (discovery, fetch, buffers) = SchedulerState::build_pools(&state.config);
                state.discovery_pool = discovery;
                state.fetch_pool = fetch;
                state.buffer_pool = buffers;
            }
            changed
        };
        self.persist_config();
        if pools_changed {
            info!("configuration changed, pools rebuilt");
        }
    }

    pub fn config(&self) -> FetcherConfig {
        self.state.lock().expect("state lock").config.clone()
    }

    pub fn add_monitored_station(&self, station: &str) {
        {
            let mut state = self.state.lock().expect("state lock");
            state.config.monitored_stations.insert(station.to_string());
        }
        self.persist_config();
    }

    pub fn remove_monitored_station(&self, station: &str) {
        {
            let mut state = self.state.lock().expect("state lock");
            state.config.monitored_stations.remove(station);
        }
        self.persist_config();
    }

    pub fn set_monitored_stations(&self, stations: impl IntoIterator<Item = String>) {
        {
            let mut state = self.state.lock().expect("state lock");
            state.config.monitored_stations = stations.into_iter().collect();
        }
        self.persist_config();
    }

    pub fn monitored_stations(&self) -> Vec<String> {
        let state = self.state.lock().expect("state lock");
        state.config.monitored_stations.iter().cloned().collect()
    }

    /// Point-in-time snapshot of scheduler and per-station counters.
    pub fn statistics(&self) -> serde_json::Value {
        let (config, discovery_available, fetch_available, buffers_available, buffer_count) = {
            let state = self.state.lock().expect("state lock");
            (
                state.config.clone(),
                state.discovery_pool.available_permits(),
                state.fetch_pool.available_permits(),
                state.buffer_pool.available(),
                state.buffer_pool.count(),
            )
        };
        let active: Vec<String> = {
            let scans = self.active_scans.lock().expect("active scan lock");
            scans.iter().cloned().collect()
        };
        let station_stats: serde_json::Value = {
            let stats = self.stats.lock().expect("stats lock");
            stats
                .iter()
                .map(|(station, s)| {
                    (
                        station.clone(),
                        json!({
                            "frames_fetched": s.frames_fetched,
                            "frames_failed": s.frames_failed,
                            "last_fetch_timestamp": s.last_fetch_timestamp,
                            "last_frame_timestamp": s.last_frame_timestamp,
                            "last_scan_timestamp": s.last_scan_timestamp,
                            "last_processed_key": s.last_processed_key,
                        }),
                    )
                })
                .collect::<serde_json::Map<String, serde_json::Value>>()
                .into()
        };

        json!({
            "is_running": self.is_running(),
            "frames_fetched": self.frames_fetched.load(Ordering::Relaxed),
            "frames_failed": self.frames_failed.load(Ordering::Relaxed),
            "last_fetch_timestamp": self.last_fetch_timestamp.load(Ordering::Relaxed),
            "monitored_stations": config.monitored_stations,
            "scan_interval": config.scan_interval_seconds,
            "max_frames_per_station": config.max_frames_per_station,
            "catchup_enabled": config.catchup_enabled,
            "pools": {
                "discovery_available": discovery_available,
                "fetch_available": fetch_available,
                "buffers_available": buffers_available,
                "buffer_count": buffer_count,
            },
            "active_discovery_scans": {
                "count": active.len(),
                "stations": active,
            },
            "station_stats": station_stats,
            "total_disk_usage_bytes": self.storage.total_disk_usage(),
            "frame_count": self.storage.frame_count(),
        })
    }

    // ------------------------------------------------------------------
    // Loops
    // ------------------------------------------------------------------

    async fn discovery_loop(self: Arc<Self>) {
        info!("discovery loop started");
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        while !self.should_stop.load(Ordering::SeqCst) {
            // Reap finished scan/batch tasks so the set stays bounded.
            {
                let mut workers = self.worker_tasks.lock().await;
                while let Some(result) = workers.try_join_next() {
                    if result.is_err() {
                        error!("worker task panicked");
                    }
                }
            }

            let stations = self.resolve_stations().await;

            let discovery_pool = {
                let state = self.state.lock().expect("state lock");
                Arc::clone(&state.discovery_pool)
            };

            for station in stations {
                if self.should_stop.load(Ordering::SeqCst) {
                    break;
                }
                // At most one in-flight scan per station.
                {
                    let mut scans = self.active_scans.lock().expect("active scan lock");
                    if !scans.insert(station.clone()) {
                        continue;
                    }
                }
                let fetcher = Arc::clone(&self);
                let pool = Arc::clone(&discovery_pool);
                self.worker_tasks.lock().await.spawn(async move {
                    let _guard = ScanGuard {
                        fetcher: Arc::clone(&fetcher),
                        station: station.clone(),
                    };
                    let Ok(permit) = pool.acquire_owned().await else {
                        return;
                    };
                    fetcher.scan_station(&station).await;
                    drop(permit);
                });
            }

            self.save_state_snapshot();

            let interval = {
                let state = self.state.lock().expect("state lock");
                state.config.scan_interval_seconds
            };
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(interval.max(1))) => {}
                _ = shutdown_rx.changed() => break,
            }
        }
        info!("discovery loop stopped");
    }

    async fn fetch_loop(self: Arc<Self>) {
        info!("fetch loop started");
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let Some(mut batch_rx) = self.batch_rx.lock().expect("batch rx lock").take() else {
            error!("fetch loop started twice; exiting");
            return;
        };

        loop {
            let batch = tokio::select! {
                batch = batch_rx.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
                _ = shutdown_rx.changed() => break,
            };

            let (fetch_pool, buffer_pool, config) = {
                let state = self.state.lock().expect("state lock");
                (
                    Arc::clone(&state.fetch_pool),
                    state.buffer_pool.clone(),
                    state.config.clone(),
                )
            };

            let permit = tokio::select! {
                permit = fetch_pool.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => continue, // pool replaced mid-acquire
                },
                _ = shutdown_rx.changed() => break,
            };

            let fetcher = Arc::clone(&self);
            self.worker_tasks.lock().await.spawn(async move {
                fetcher.process_batch(batch, config, buffer_pool).await;
                drop(permit);
            });
        }
        info!("fetch loop stopped");
    }

    async fn cleanup_loop(self: Arc<Self>) {
        info!("cleanup loop started");
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            let (interval, enabled, max_frames) = {
                let state = self.state.lock().expect("state lock");
                (
                    state.config.cleanup_interval_seconds,
                    state.config.auto_cleanup_enabled,
                    state.config.max_frames_per_station,
                )
            };

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(interval.max(1))) => {}
                _ = shutdown_rx.changed() => break,
            }

            if !enabled || self.should_stop.load(Ordering::SeqCst) {
                continue;
            }
            debug!("running retention pass");
            let storage = Arc::clone(&self.storage);
            let result =
                tokio::task::spawn_blocking(move || storage.cleanup_old_frames(max_frames)).await;
            match result {
                Ok(Err(err)) => error!(%err, "retention pass failed"),
                Err(err) => error!(%err, "retention task panicked"),
                Ok(Ok(())) => {}
            }
        }
        info!("cleanup loop stopped");
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    /// The station set for this pass, with the `ALL` sentinel expanded
    /// to every station that published today.
    async fn resolve_stations(&self) -> Vec<String> {
        let mut stations: HashSet<String> = {
            let state = self.state.lock().expect("state lock");
            state.config.monitored_stations.iter().cloned().collect()
        };

        if stations.contains(ALL_STATIONS) {
            let prefix = day_prefix(Utc::now(), None);
            match self
                .object_store
                .list(&self.bucket, &prefix, None, Some("/"))
                .await
            {
                Ok(listing) => {
                    for common in &listing.common_prefixes {
                        if let Some(station) = station_from_prefix(common) {
                            stations.insert(station);
                        }
                    }
                    stations.remove(ALL_STATIONS);
                }
                Err(err) => {
                    warn!(%err, "station auto-discovery failed this pass");
                }
            }
        }

        let mut stations: Vec<String> = stations.into_iter().collect();
        stations.sort();
        stations
    }

    /// One discovery scan: list today's keys past the cursor, plan the
    /// targets, batch the new ones and advance the cursor.
    async fn scan_station(&self, station: &str) {
        debug!(station, "starting discovery scan");
        let cursor = {
            let stats = self.stats.lock().expect("stats lock");
            stats
                .get(station)
                .map(|s| s.last_processed_key.clone())
                .unwrap_or_default()
        };

        let prefix = day_prefix(Utc::now(), Some(station));
        let listing = match self
            .object_store
            .list(
                &self.bucket,
                &prefix,
                (!cursor.is_empty()).then_some(cursor.as_str()),
                None,
            )
            .await
        {
            Ok(listing) => listing,
            Err(err) => {
                warn!(station, %err, "listing failed");
                return;
            }
        };
        if listing.keys.is_empty() {
            return;
        }

        let mut keys = listing.keys;
        keys.sort();

        let (catchup, max_frames, products) = {
            let state = self.state.lock().expect("state lock");
            (
                state.config.catchup_enabled,
                state.config.max_frames_per_station,
                state.config.products.clone(),
            )
        };
        let targets = plan_targets(&keys, &cursor, catchup, max_frames);

        let mut batch = DiscoveryBatch {
            station: station.to_string(),
            items: Vec::new(),
        };
        let mut new_cursor = cursor.clone();
        let mut discovered = 0usize;

        for key in targets {
            if self.should_stop.load(Ordering::SeqCst) {
                break;
            }
            if !key_eligible(key) {
                continue;
            }
            let Some(timestamp) = timestamp_from_key(key) else {
                continue;
            };

            let all_stored = products
                .iter()
                .all(|&p| self.storage.has_timestamp_product(station, p, &timestamp));
            if !all_stored {
                batch.items.push(DiscoveryItem {
                    station: station.to_string(),
                    bucket: self.bucket.clone(),
                    key: key.clone(),
                    timestamp,
                });
                discovered += 1;
                if batch.items.len() >= BATCH_SIZE {
                    let full = std::mem::take(&mut batch.items);
                    if self.push_batch(station, full).await.is_err() {
                        return;
                    }
                }
            }
            // The cursor tracks every eligible key, including those
            // already present on disk.
            new_cursor = key.clone();
        }

        if !batch.items.is_empty() && self.push_batch(station, batch.items).await.is_err() {
            return;
        }

        {
            let mut stats = self.stats.lock().expect("stats lock");
            let entry = stats.entry(station.to_string()).or_default();
            entry.last_processed_key = new_cursor;
            entry.last_scan_timestamp = now_nanos();
        }
        if discovered > 0 {
            info!(station, discovered, "discovery scan queued new archives");
        }
    }

    async fn push_batch(
        &self,
        station: &str,
        items: Vec<DiscoveryItem>,
    ) -> Result<(), mpsc::error::SendError<DiscoveryBatch>> {
        self.batch_tx
            .send(DiscoveryBatch {
                station: station.to_string(),
                items,
            })
            .await
    }

    // ------------------------------------------------------------------
    // Fetch / decode
    // ------------------------------------------------------------------

    /// Fetch, decode, project and enqueue storage writes for one batch.
    /// Failures are counted per station and never abort the batch.
    async fn process_batch(
        self: Arc<Self>,
        batch: DiscoveryBatch,
        config: FetcherConfig,
        buffer_pool: BufferPool,
    ) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        for item in batch.items {
            if self.should_stop.load(Ordering::SeqCst) {
                break;
            }

            let mut raw = match self.acquire_buffer(&buffer_pool, &mut shutdown_rx).await {
                Ok(buffer) => buffer,
                Err(err) => {
                    debug!(%err, "abandoning batch without side effects");
                    return;
                }
            };
            raw.clear();

            if let Err(err) = self
                .object_store
                .get_into(&item.bucket, &item.key, &mut raw)
                .await
            {
                warn!(station = %item.station, key = %item.key, %err, "object fetch failed");
                self.record_failure(&item.station);
                continue;
            }
            if raw.is_empty() {
                continue;
            }

            let mut scratch = match self.acquire_buffer(&buffer_pool, &mut shutdown_rx).await {
                Ok(buffer) => buffer,
                Err(err) => {
                    debug!(%err, "abandoning batch without side effects");
                    return;
                }
            };
            scratch.clear();

            let station = item.station.clone();
            let timestamp = item.timestamp.clone();
            let products = config.products.clone();
            let options = self.decode_options.clone();

            // Decode and projection are CPU-bound; keep them off the
            // runtime workers. The pooled buffers ride along and are
            // released when the closure drops them.
            let projected = tokio::task::spawn_blocking(move || {
                let frames =
                    decode_products(&raw, &products, &station, &timestamp, &mut scratch, &options);
                let mut projected: Vec<(Product, ProjectedFrame)> = Vec::new();
                for (product, frame) in frames {
                    if !frame.has_samples() {
                        continue;
                    }
                    if let Some(p) = project_frame(&frame) {
                        projected.push((product, p));
                    }
                }
                projected
            })
            .await;

            let projected = match projected {
                Ok(projected) => projected,
                Err(err) => {
                    error!(station = %item.station, key = %item.key, %err, "decode task panicked");
                    self.record_failure(&item.station);
                    continue;
                }
            };

            let mut tilt_count = 0u64;
            for (product, frame) in projected {
                for artifact in frame.tilts {
                    self.storage.enqueue(WriteTask::Tilt {
                        station: item.station.clone(),
                        product,
                        timestamp: item.timestamp.clone(),
                        artifact,
                    });
                    tilt_count += 1;
                }
                if let Some(artifact) = frame.volumetric {
                    self.storage.enqueue(WriteTask::Volumetric {
                        station: item.station.clone(),
                        product,
                        timestamp: item.timestamp.clone(),
                        artifact,
                    });
                }
            }

            if tilt_count > 0 {
                self.frames_fetched.fetch_add(tilt_count, Ordering::Relaxed);
                let mut stats = self.stats.lock().expect("stats lock");
                let entry = stats.entry(item.station.clone()).or_default();
                entry.frames_fetched += tilt_count;
                entry.last_fetch_timestamp = now_nanos();
                entry.last_frame_timestamp = item.timestamp.clone();
            }
            self.last_fetch_timestamp.store(now_nanos(), Ordering::Relaxed);
            debug!(station = %item.station, key = %item.key, tilts = tilt_count, "archive processed");
        }
    }

    /// Wait for a pooled buffer unless shutdown begins first.
    async fn acquire_buffer(
        &self,
        pool: &BufferPool,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> levelii_core::Result<levelii_pool::PooledBuffer> {
        tokio::select! {
            buffer = pool.acquire() => Ok(buffer),
            _ = shutdown_rx.changed() => Err(levelii_core::LeveliiError::ShutdownInProgress),
        }
    }

    fn record_failure(&self, station: &str) {
        self.frames_failed.fetch_add(1, Ordering::Relaxed);
        let mut stats = self.stats.lock().expect("stats lock");
        let entry = stats.entry(station.to_string()).or_default();
        entry.frames_failed += 1;
        entry.last_fetch_timestamp = now_nanos();
    }

    fn save_state_snapshot(&self) {
        let snapshot = {
            let stats = self.stats.lock().expect("stats lock");
            stats.clone()
        };
        if let Err(err) = save_state(&self.data_path, &snapshot) {
            error!(%err, "station state persistence failed");
        }
    }

    fn persist_config(&self) {
        let config = {
            let state = self.state.lock().expect("state lock");
            state.config.clone()
        };
        if let Err(err) = config.save(&self.data_path) {
            error!(%err, "config persistence failed");
        }
    }

    #[cfg(test)]
    fn take_batch_rx(&self) -> mpsc::Receiver<DiscoveryBatch> {
        self.batch_rx
            .lock()
            .expect("batch rx lock")
            .take()
            .expect("receiver present")
    }

    #[cfg(test)]
    fn station_stats(&self, station: &str) -> Option<StationStats> {
        self.stats.lock().expect("stats lock").get(station).cloned()
    }
}

/// Removes a station from the active-scan set on every exit path.
struct ScanGuard {
    fetcher: Arc<FrameFetcher>,
    station: String,
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        self.fetcher
            .active_scans
            .lock()
            .expect("active scan lock")
            .remove(&self.station);
    }
}

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::MemoryStore;
    use levelii_decode::testutil::{message31, volume_header, wrap_message, MomentSpec};
    use tempfile::TempDir;

    fn small_config() -> FetcherConfig {
        FetcherConfig {
            monitored_stations: ["KTLX".to_string()].into_iter().collect(),
            products: vec![Product::Reflectivity],
            buffer_pool_size: 4,
            buffer_size: 1024 * 1024,
            fetcher_thread_pool_size: 2,
            discovery_parallelism: 2,
            ..FetcherConfig::default()
        }
    }

    /// Synthetic archive whose volume header encodes today's date at
    /// `hhmmss`, so the stored timestamp matches the key's.
    fn archive_bytes(hhmmss: &str) -> Vec<u8> {
        let today = Utc::now().date_naive();
        let julian = (today - chrono::NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()).num_days() + 1;
        let (h, m, s) = (
            hhmmss[0..2].parse::<u32>().unwrap(),
            hhmmss[2..4].parse::<u32>().unwrap(),
            hhmmss[4..6].parse::<u32>().unwrap(),
        );
        let ms = (h * 3600 + m * 60 + s) * 1000;

        let mut file = volume_header("KTLX", julian as u32, ms);
        let payload = message31(
            45.0,
            0.5,
            3, // start of volume
            1,
            &[MomentSpec {
                name: *b"REF",
                num_gates: 64,
                first_gate_m: 500,
                gate_spacing_m: 250,
                scale: 2.0,
                offset: 2.0,
                word_size: 8,
                raw: 128,
            }],
        );
        file.extend_from_slice(&wrap_message(31, 1, &payload));
        file
    }

    fn key_for(station: &str, hhmmss: &str) -> String {
        let prefix = day_prefix(Utc::now(), Some(station));
        format!("{prefix}{station}{}_{hhmmss}_V06", Utc::now().format("%Y%m%d"))
    }

    fn volume_timestamp_for(hhmmss: &str) -> String {
        format!("{}_{hhmmss}", Utc::now().format("%Y%m%d"))
    }

    struct Harness {
        fetcher: Arc<FrameFetcher>,
        memory: Arc<MemoryStore>,
        storage: Arc<FrameStore>,
        rx: mpsc::Receiver<DiscoveryBatch>,
        _dir: TempDir,
    }

    fn harness(config: FetcherConfig) -> Harness {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(FrameStore::open(dir.path().join("levelii")).unwrap());
        let memory = Arc::new(MemoryStore::new());
        let fetcher = FrameFetcher::new(
            Arc::clone(&storage),
            Arc::clone(&memory) as Arc<dyn ObjectStore>,
            config,
            dir.path().join("levelii"),
        );
        let rx = fetcher.take_batch_rx();
        Harness {
            fetcher,
            memory,
            storage,
            rx,
            _dir: dir,
        }
    }

    async fn drain_and_process(h: &mut Harness) {
        let config = h.fetcher.config();
        let pool = BufferPool::new(4, 1024 * 1024);
        while let Ok(batch) = h.rx.try_recv() {
            Arc::clone(&h.fetcher)
                .process_batch(batch, config.clone(), pool.clone())
                .await;
        }
    }

    #[tokio::test]
    async fn cursor_advances_and_only_new_keys_are_discovered() {
        let mut h = harness(small_config());
        let key_a = key_for("KTLX", "100000");
        let key_b = key_for("KTLX", "101000");
        let key_c = key_for("KTLX", "102000");
        for (key, hhmmss) in [(&key_a, "100000"), (&key_b, "101000"), (&key_c, "102000")] {
            h.memory.insert(key.clone(), archive_bytes(hhmmss));
        }

        h.fetcher.scan_station("KTLX").await;
        let batch = h.rx.try_recv().unwrap();
        assert_eq!(batch.items.len(), 3);
        assert_eq!(batch.items[0].key, key_a);
        assert_eq!(
            h.fetcher.station_stats("KTLX").unwrap().last_processed_key,
            key_c
        );

        // Next pass: one new key; only it is discovered.
        let key_d = key_for("KTLX", "103000");
        h.memory.insert(key_d.clone(), archive_bytes("103000"));
        h.fetcher.scan_station("KTLX").await;
        let batch = h.rx.try_recv().unwrap();
        assert_eq!(batch.items.len(), 1);
        assert_eq!(batch.items[0].key, key_d);
        let stats = h.fetcher.station_stats("KTLX").unwrap();
        assert_eq!(stats.last_processed_key, key_d);

        // Cursor survives persistence.
        h.fetcher.save_state_snapshot();
        let reloaded = load_state(h.fetcher.data_path.as_path()).unwrap();
        assert_eq!(reloaded["KTLX"].last_processed_key, key_d);
    }

    #[tokio::test]
    async fn mdm_and_short_keys_are_filtered_without_advancing_cursor() {
        let mut h = harness(small_config());
        let key_a = key_for("KTLX", "100000");
        let mdm = key_for("KTLX", "101000").replace("_V06", "_MDM");
        assert!(mdm > key_a);
        h.memory.insert(key_a.clone(), archive_bytes("100000"));
        h.memory.insert(mdm, archive_bytes("101000"));

        h.fetcher.scan_station("KTLX").await;
        let batch = h.rx.try_recv().unwrap();
        assert_eq!(batch.items.len(), 1);
        assert_eq!(batch.items[0].key, key_a);
        // The metadata companion never advances the cursor.
        assert_eq!(
            h.fetcher.station_stats("KTLX").unwrap().last_processed_key,
            key_a
        );
    }

    #[tokio::test]
    async fn cold_start_without_catchup_takes_only_latest() {
        let mut config = small_config();
        config.catchup_enabled = false;
        let mut h = harness(config);
        for hhmmss in ["100000", "101000", "102000"] {
            h.memory.insert(key_for("KTLX", hhmmss), archive_bytes(hhmmss));
        }

        h.fetcher.scan_station("KTLX").await;
        let batch = h.rx.try_recv().unwrap();
        assert_eq!(batch.items.len(), 1);
        assert_eq!(batch.items[0].key, key_for("KTLX", "102000"));
        // The cursor still lands on the newest key.
        assert_eq!(
            h.fetcher.station_stats("KTLX").unwrap().last_processed_key,
            key_for("KTLX", "102000")
        );
    }

    #[tokio::test]
    async fn stored_timestamps_are_skipped_but_cursor_advances() {
        let mut h = harness(small_config());
        let key_a = key_for("KTLX", "100000");
        let key_b = key_for("KTLX", "101000");
        h.memory.insert(key_a.clone(), archive_bytes("100000"));
        h.memory.insert(key_b.clone(), archive_bytes("101000"));

        h.fetcher.scan_station("KTLX").await;
        drain_and_process(&mut h).await;
        h.storage.shutdown();
        assert!(h.fetcher.station_stats("KTLX").unwrap().frames_fetched > 0);

        // A fresh fetcher with no cursor sees both keys already stored:
        // nothing is queued, yet the cursor advances past them.
        let storage2 = Arc::new(FrameStore::open(h.storage.base_path()).unwrap());
        let fetcher2 = FrameFetcher::new(
            storage2,
            Arc::clone(&h.memory) as Arc<dyn ObjectStore>,
            small_config(),
            h._dir.path().join("fresh-state"),
        );
        let mut rx2 = fetcher2.take_batch_rx();
        fetcher2.scan_station("KTLX").await;
        assert!(rx2.try_recv().is_err());
        assert_eq!(
            fetcher2.station_stats("KTLX").unwrap().last_processed_key,
            key_b
        );
    }

    #[tokio::test]
    async fn batches_split_at_five_items() {
        let mut h = harness(small_config());
        for i in 0..7 {
            h.memory
                .insert(key_for("KTLX", &format!("10{i:02}00")), archive_bytes("100000"));
        }
        h.fetcher.scan_station("KTLX").await;

        let first = h.rx.try_recv().unwrap();
        let second = h.rx.try_recv().unwrap();
        assert_eq!(first.items.len(), 5);
        assert_eq!(second.items.len(), 2);
        assert!(h.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn processing_writes_artifacts_and_counts() {
        let mut h = harness(small_config());
        let key = key_for("KTLX", "100000");
        h.memory.insert(key, archive_bytes("100000"));

        h.fetcher.scan_station("KTLX").await;
        drain_and_process(&mut h).await;
        h.storage.shutdown();

        let timestamp = volume_timestamp_for("100000");
        assert!(h
            .storage
            .has_timestamp_product("KTLX", Product::Reflectivity, &timestamp));
        let loaded = h
            .storage
            .load_tilt("KTLX", Product::Reflectivity, &timestamp, 0.5)
            .unwrap();
        assert_eq!(loaded.metadata.g, 64);
        assert!(loaded.metadata.v > 0);

        let stats = h.fetcher.station_stats("KTLX").unwrap();
        assert_eq!(stats.frames_fetched, 1); // one tilt artifact
        assert_eq!(stats.last_frame_timestamp, timestamp);
        assert_eq!(h.fetcher.frames_fetched.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn fetch_errors_count_against_the_station() {
        let mut h = harness(small_config());
        let batch = DiscoveryBatch {
            station: "KTLX".into(),
            items: vec![DiscoveryItem {
                station: "KTLX".into(),
                bucket: DEFAULT_BUCKET.into(),
                key: "2027/02/13/KTLX/missing".into(),
                timestamp: "20270213_100000".into(),
            }],
        };
        let pool = BufferPool::new(2, 1024);
        Arc::clone(&h.fetcher)
            .process_batch(batch, h.fetcher.config(), pool)
            .await;

        let stats = h.fetcher.station_stats("KTLX").unwrap();
        assert_eq!(stats.frames_failed, 1);
        assert_eq!(h.fetcher.frames_failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn all_sentinel_expands_to_published_stations() {
        let mut config = small_config();
        config.monitored_stations = [ALL_STATIONS.to_string()].into_iter().collect();
        let h = harness(config);
        h.memory.insert(key_for("KTLX", "100000"), vec![]);
        h.memory.insert(key_for("KCRP", "100000"), vec![]);

        let stations = h.fetcher.resolve_stations().await;
        assert_eq!(stations, vec!["KCRP".to_string(), "KTLX".to_string()]);
        // The sentinel stays in the configuration for future passes.
        assert!(h
            .fetcher
            .config()
            .monitored_stations
            .contains(ALL_STATIONS));
    }

    #[tokio::test]
    async fn reconfigure_rebuilds_pools_only_on_sizing_changes() {
        let h = harness(small_config());
        let before = {
            let state = h.fetcher.state.lock().unwrap();
            Arc::as_ptr(&state.fetch_pool)
        };

        let mut same_pools = h.fetcher.config();
        same_pools.scan_interval_seconds = 120;
        h.fetcher.reconfigure(same_pools);
        let unchanged = {
            let state = h.fetcher.state.lock().unwrap();
            Arc::as_ptr(&state.fetch_pool)
        };
        assert_eq!(before, unchanged);
        assert_eq!(h.fetcher.config().scan_interval_seconds, 120);

        let mut resized = h.fetcher.config();
        resized.fetcher_thread_pool_size = 4;
        resized.buffer_pool_size = 2;
        h.fetcher.reconfigure(resized);
        let (rebuilt, permits) = {
            let state = h.fetcher.state.lock().unwrap();
            (
                Arc::as_ptr(&state.fetch_pool),
                state.fetch_pool.available_permits(),
            )
        };
        assert_ne!(before, rebuilt);
        assert_eq!(permits, 4);

        // Mutation persisted the config file.
        let loaded = FetcherConfig::load(&h.fetcher.data_path).unwrap().unwrap();
        assert_eq!(loaded.fetcher_thread_pool_size, 4);
    }

    #[tokio::test]
    async fn statistics_snapshot_has_the_documented_shape() {
        let h = harness(small_config());
        let stats = h.fetcher.statistics();
        assert_eq!(stats["is_running"], false);
        assert!(stats["pools"]["buffer_count"].as_u64().unwrap() > 0);
        assert_eq!(stats["scan_interval"], 30);
        assert!(stats["monitored_stations"]
            .as_array()
            .unwrap()
            .contains(&serde_json::json!("KTLX")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_stop_cycle_shuts_down_cleanly() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(FrameStore::open(dir.path().join("levelii")).unwrap());
        let memory = Arc::new(MemoryStore::new());
        memory.insert(key_for("KTLX", "100000"), archive_bytes("100000"));

        let fetcher = FrameFetcher::new(
            Arc::clone(&storage),
            memory as Arc<dyn ObjectStore>,
            small_config(),
            dir.path().join("levelii"),
        );
        fetcher.start();
        assert!(fetcher.is_running());
        tokio::time::sleep(Duration::from_millis(200)).await;
        fetcher.stop().await;
        assert!(!fetcher.is_running());
        storage.shutdown();

        // The pass that ran fetched and stored the archive.
        assert!(storage.frame_count() > 0);
        assert!(dir.path().join("levelii/state.json").exists());
    }
}
