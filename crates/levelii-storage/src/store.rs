//! On-disk frame store.
//!
//! Layout: `BASE/STATION/TIMESTAMP/PRODUCT/<tilt>.RDA` for per-tilt
//! artifacts and `.../volumetric.RDA` for the 3-D grid. Each `.RDA` is
//! gzip-wrapped `u32-LE metadata length | metadata JSON | bitmask |
//! values`. A gzip-compressed per-product index file lives beside the
//! timestamp directories at `STATION/index_<product>.json`.
//!
//! Writes are serialized through a single background worker consuming a
//! FIFO queue; enqueueing never blocks the caller. Readers share the
//! in-memory index cache under a read-write lock; the worker takes it
//! exclusively when it rewrites an index.

use crate::bitmask::{ArtifactMetadata, BitmaskArtifact};
use crate::projector::{TiltArtifact, VolumeArtifact};
use anyhow::{anyhow, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use levelii_core::Product;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use tracing::{debug, error, info};

/// A unit of work for the write worker.
#[derive(Debug)]
pub enum WriteTask {
    Tilt {
        station: String,
        product: Product,
        timestamp: String,
        artifact: TiltArtifact,
    },
    Volumetric {
        station: String,
        product: Product,
        timestamp: String,
        artifact: VolumeArtifact,
    },
}

/// One index entry: a stored artifact's timestamp and tilt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexEntry {
    /// Volume timestamp.
    pub t: String,
    /// Tilt; 0.0 for volumetric artifacts.
    pub e: f32,
}

/// Per-(station, product) index file contents.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProductIndex {
    /// Station.
    pub s: String,
    /// Product.
    pub p: String,
    /// Update time, nanoseconds since the epoch.
    pub u: i64,
    /// Entry count.
    pub c: usize,
    /// Entries, newest timestamp first.
    pub f: Vec<IndexEntry>,
}

/// A stored artifact read back from disk.
#[derive(Debug, Clone)]
pub struct LoadedArtifact {
    pub metadata: ArtifactMetadata,
    pub bitmask: Vec<u8>,
    pub values: Vec<u8>,
}

/// Metadata for one artifact found by a directory scan.
#[derive(Debug, Clone)]
pub struct FrameEntry {
    pub timestamp: String,
    pub tilt: f32,
    pub path: PathBuf,
    pub file_size: u64,
}

struct StoreInner {
    base_path: PathBuf,
    index_cache: RwLock<HashMap<String, ProductIndex>>,
}

/// The frame store. Share it behind an `Arc`; the write worker and
/// index cache are per-store.
pub struct FrameStore {
    inner: Arc<StoreInner>,
    sender: Mutex<Option<mpsc::Sender<WriteTask>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl FrameStore {
    /// Open (creating if needed) a store rooted at `base_path` and
    /// start its write worker.
    pub fn open(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)
            .with_context(|| format!("creating storage root {}", base_path.display()))?;

        let inner = Arc::new(StoreInner {
            base_path,
            index_cache: RwLock::new(HashMap::new()),
        });

        let (sender, receiver) = mpsc::channel::<WriteTask>();
        let worker_inner = Arc::clone(&inner);
        let worker = thread::Builder::new()
            .name("levelii-storage".into())
            .spawn(move || {
                while let Ok(task) = receiver.recv() {
                    if let Err(err) = process_task(&worker_inner, &task) {
                        error!(%err, "write task failed, artifact dropped");
                    }
                }
                debug!("storage worker drained and exiting");
            })
            .context("spawning storage worker thread")?;

        Ok(Self {
            inner,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue a write. Never blocks; tasks complete in FIFO order on the
    /// worker. Tasks queued after shutdown are dropped with a log line.
    pub fn enqueue(&self, task: WriteTask) {
        let sender = self.sender.lock().expect("sender mutex");
        match sender.as_ref() {
            Some(tx) => {
                if tx.send(task).is_err() {
                    error!("storage worker gone; dropping write task");
                }
            }
            None => debug!("store shut down; dropping write task"),
        }
    }

    /// Stop accepting writes, drain the queue and join the worker.
    pub fn shutdown(&self) {
        let sender = self.sender.lock().expect("sender mutex").take();
        drop(sender);
        if let Some(worker) = self.worker.lock().expect("worker mutex").take() {
            if worker.join().is_err() {
                error!("storage worker panicked during drain");
            }
        }
    }

    /// Synchronous write of a per-tilt artifact. Used by the worker and
    /// by the offline converter; the daemon path goes through
    /// [`FrameStore::enqueue`].
    pub fn save_tilt(
        &self,
        station: &str,
        product: Product,
        timestamp: &str,
        artifact: &TiltArtifact,
    ) -> Result<()> {
        save_tilt(&self.inner, station, product, timestamp, artifact)
    }

    /// Synchronous write of a volumetric artifact.
    pub fn save_volumetric(
        &self,
        station: &str,
        product: Product,
        timestamp: &str,
        artifact: &VolumeArtifact,
    ) -> Result<()> {
        save_volumetric(&self.inner, station, product, timestamp, artifact)
    }

    /// Write a base64-encoded point-cloud export next to a frame's
    /// artifacts, at `STATION/TIMESTAMP/PRODUCT/pointcloud.b64`. Used
    /// by the offline converter's export path.
    pub fn save_pointcloud(
        &self,
        station: &str,
        product: Product,
        timestamp: &str,
        encoded: &str,
    ) -> Result<()> {
        let dir = self.product_dir(station, timestamp, product);
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join("pointcloud.b64");
        fs::write(&path, encoded)
            .with_context(|| format!("writing point cloud {}", path.display()))?;
        debug!(
            station,
            product = %product,
            timestamp,
            bytes = encoded.len(),
            "stored point-cloud export"
        );
        Ok(())
    }

    /// Read back a per-tilt artifact.
    pub fn load_tilt(
        &self,
        station: &str,
        product: Product,
        timestamp: &str,
        tilt: f32,
    ) -> Result<LoadedArtifact> {
        let path = self
            .product_dir(station, timestamp, product)
            .join(tilt_filename(tilt));
        load_artifact(&path)
    }

    /// Read back a volumetric artifact.
    pub fn load_volumetric(
        &self,
        station: &str,
        product: Product,
        timestamp: &str,
    ) -> Result<LoadedArtifact> {
        let path = self
            .product_dir(station, timestamp, product)
            .join("volumetric.RDA");
        load_artifact(&path)
    }

    /// The per-product index, from cache or disk.
    pub fn index(&self, station: &str, product: Product) -> Result<ProductIndex> {
        let key = cache_key(station, product);
        {
            let cache = self.inner.index_cache.read().expect("index lock");
            if let Some(index) = cache.get(&key) {
                return Ok(index.clone());
            }
        }
        let path = index_path(&self.inner.base_path, station, product);
        if !path.exists() {
            return Ok(ProductIndex::default());
        }
        let bytes = gunzip(&fs::read(&path)?)?;
        let index: ProductIndex = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing index {}", path.display()))?;
        self.inner
            .index_cache
            .write()
            .expect("index lock")
            .insert(key, index.clone());
        Ok(index)
    }

    /// Scan the store for every artifact of `(station, product)`,
    /// newest timestamp first.
    pub fn list_frames(&self, station: &str, product: Product) -> Vec<FrameEntry> {
        scan_directory(&self.inner.base_path, station, product)
    }

    /// True when the product already has an artifact directory at this
    /// timestamp; gates discovery so keys are never re-fetched.
    pub fn has_timestamp_product(&self, station: &str, product: Product, timestamp: &str) -> bool {
        self.product_dir(station, timestamp, product).is_dir()
    }

    /// Delete the oldest frames of every station/product beyond
    /// `max_frames` and rewrite the affected indexes.
    pub fn cleanup_old_frames(&self, max_frames: usize) -> Result<()> {
        cleanup_old_frames(&self.inner, max_frames)
    }

    /// Bytes on disk under the storage root.
    pub fn total_disk_usage(&self) -> u64 {
        dir_size(&self.inner.base_path)
    }

    /// Number of `.RDA` artifacts in the store.
    pub fn frame_count(&self) -> usize {
        count_rda_files(&self.inner.base_path)
    }

    /// Storage root.
    pub fn base_path(&self) -> &Path {
        &self.inner.base_path
    }

    fn product_dir(&self, station: &str, timestamp: &str, product: Product) -> PathBuf {
        self.inner
            .base_path
            .join(station)
            .join(timestamp)
            .join(product.as_str())
    }
}

impl Drop for FrameStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn process_task(inner: &Arc<StoreInner>, task: &WriteTask) -> Result<()> {
    match task {
        WriteTask::Tilt {
            station,
            product,
            timestamp,
            artifact,
        } => save_tilt(inner, station, *product, timestamp, artifact),
        WriteTask::Volumetric {
            station,
            product,
            timestamp,
            artifact,
        } => save_volumetric(inner, station, *product, timestamp, artifact),
    }
}

fn tilt_filename(tilt: f32) -> String {
    format!("{tilt:.1}.RDA")
}

fn cache_key(station: &str, product: Product) -> String {
    format!("{station}/{product}")
}

fn index_path(base: &Path, station: &str, product: Product) -> PathBuf {
    base.join(station).join(format!("index_{product}.json"))
}

fn save_tilt(
    inner: &Arc<StoreInner>,
    station: &str,
    product: Product,
    timestamp: &str,
    artifact: &TiltArtifact,
) -> Result<()> {
    let metadata = ArtifactMetadata {
        s: station.to_string(),
        p: product.to_string(),
        t: timestamp.to_string(),
        e: Some(artifact.tilt),
        f: "b".to_string(),
        tilts: None,
        r: artifact.num_rays,
        g: artifact.num_gates,
        gs: artifact.gate_spacing_m,
        fg: artifact.first_gate_m,
        v: artifact.encoded.values.len(),
    };
    write_artifact(
        inner,
        station,
        product,
        timestamp,
        &tilt_filename(artifact.tilt),
        &metadata,
        &artifact.encoded,
    )
}

fn save_volumetric(
    inner: &Arc<StoreInner>,
    station: &str,
    product: Product,
    timestamp: &str,
    artifact: &VolumeArtifact,
) -> Result<()> {
    let metadata = ArtifactMetadata {
        s: station.to_string(),
        p: product.to_string(),
        t: timestamp.to_string(),
        e: None,
        f: "b".to_string(),
        tilts: Some(artifact.tilts.clone()),
        r: artifact.num_rays,
        g: artifact.num_gates,
        gs: artifact.gate_spacing_m,
        fg: artifact.first_gate_m,
        v: artifact.encoded.values.len(),
    };
    write_artifact(
        inner,
        station,
        product,
        timestamp,
        "volumetric.RDA",
        &metadata,
        &artifact.encoded,
    )
}

fn write_artifact(
    inner: &Arc<StoreInner>,
    station: &str,
    product: Product,
    timestamp: &str,
    filename: &str,
    metadata: &ArtifactMetadata,
    encoded: &BitmaskArtifact,
) -> Result<()> {
    let dir = inner
        .base_path
        .join(station)
        .join(timestamp)
        .join(product.as_str());
    fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

    let metadata_json = serde_json::to_vec(metadata).context("encoding artifact metadata")?;
    let mut payload =
        Vec::with_capacity(4 + metadata_json.len() + encoded.bitmask.len() + encoded.values.len());
    payload.extend_from_slice(&(metadata_json.len() as u32).to_le_bytes());
    payload.extend_from_slice(&metadata_json);
    payload.extend_from_slice(&encoded.bitmask);
    payload.extend_from_slice(&encoded.values);

    let path = dir.join(filename);
    fs::write(&path, gzip(&payload)?)
        .with_context(|| format!("writing artifact {}", path.display()))?;

    debug!(
        station,
        product = %product,
        timestamp,
        file = filename,
        values = encoded.values.len(),
        "stored artifact"
    );

    update_index(inner, station, product);
    Ok(())
}

fn load_artifact(path: &Path) -> Result<LoadedArtifact> {
    let compressed =
        fs::read(path).with_context(|| format!("reading artifact {}", path.display()))?;
    let payload = gunzip(&compressed)?;
    if payload.len() < 4 {
        return Err(anyhow!("artifact too small: {}", path.display()));
    }
    let metadata_len = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    let binary_start = 4 + metadata_len;
    if binary_start > payload.len() {
        return Err(anyhow!("artifact metadata overruns file: {}", path.display()));
    }

    let metadata: ArtifactMetadata = serde_json::from_slice(&payload[4..binary_start])
        .with_context(|| format!("parsing artifact metadata {}", path.display()))?;

    let mask_len = metadata.cell_count().div_ceil(8);
    let binary = &payload[binary_start..];
    if binary.len() != mask_len + metadata.v {
        return Err(anyhow!(
            "artifact payload size mismatch in {}: {} != {} + {}",
            path.display(),
            binary.len(),
            mask_len,
            metadata.v
        ));
    }

    Ok(LoadedArtifact {
        bitmask: binary[..mask_len].to_vec(),
        values: binary[mask_len..].to_vec(),
        metadata,
    })
}

/// Rebuild the `(station, product)` index from a directory scan, write
/// it gzip-compressed and refresh the cache. Taken exclusively so
/// readers never observe a half-written cache entry.
fn update_index(inner: &Arc<StoreInner>, station: &str, product: Product) {
    let result: Result<()> = (|| {
        let mut cache = inner.index_cache.write().expect("index lock");
        let frames = scan_directory(&inner.base_path, station, product);

        let index = ProductIndex {
            s: station.to_string(),
            p: product.to_string(),
            u: chrono::Utc::now()
                .timestamp_nanos_opt()
                .unwrap_or_default(),
            c: frames.len(),
            f: frames
                .iter()
                .map(|f| IndexEntry {
                    t: f.timestamp.clone(),
                    e: f.tilt,
                })
                .collect(),
        };

        let json = serde_json::to_vec(&index).context("encoding index")?;
        let path = index_path(&inner.base_path, station, product);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, gzip(&json)?)
            .with_context(|| format!("writing index {}", path.display()))?;

        cache.insert(cache_key(station, product), index);
        Ok(())
    })();

    if let Err(err) = result {
        error!(station, product = %product, %err, "index update failed");
    }
}

fn scan_directory(base: &Path, station: &str, product: Product) -> Vec<FrameEntry> {
    let mut frames = Vec::new();
    let station_dir = base.join(station);
    let Ok(timestamps) = fs::read_dir(&station_dir) else {
        return frames;
    };

    for ts_entry in timestamps.flatten() {
        if !ts_entry.path().is_dir() {
            continue;
        }
        let timestamp = ts_entry.file_name().to_string_lossy().to_string();
        let product_dir = ts_entry.path().join(product.as_str());
        let Ok(files) = fs::read_dir(&product_dir) else {
            continue;
        };
        for file in files.flatten() {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("RDA") {
                continue;
            }
            let tilt = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<f32>().ok())
                .unwrap_or(0.0);
            frames.push(FrameEntry {
                timestamp: timestamp.clone(),
                tilt,
                file_size: file.metadata().map(|m| m.len()).unwrap_or(0),
                path,
            });
        }
    }
    frames.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    frames
}

fn cleanup_old_frames(inner: &Arc<StoreInner>, max_frames: usize) -> Result<()> {
    let Ok(stations) = fs::read_dir(&inner.base_path) else {
        return Ok(());
    };

    for station_entry in stations.flatten() {
        if !station_entry.path().is_dir() {
            continue;
        }
        let station = station_entry.file_name().to_string_lossy().to_string();

        // product -> timestamps that contain it
        let mut products: HashMap<String, Vec<String>> = HashMap::new();
        let Ok(timestamps) = fs::read_dir(station_entry.path()) else {
            continue;
        };
        for ts_entry in timestamps.flatten() {
            if !ts_entry.path().is_dir() {
                continue;
            }
            let timestamp = ts_entry.file_name().to_string_lossy().to_string();
            let Ok(product_dirs) = fs::read_dir(ts_entry.path()) else {
                continue;
            };
            for prod_entry in product_dirs.flatten() {
                if prod_entry.path().is_dir() {
                    products
                        .entry(prod_entry.file_name().to_string_lossy().to_string())
                        .or_default()
                        .push(timestamp.clone());
                }
            }
        }

        for (product_name, mut timestamps) in products {
            timestamps.sort_by(|a, b| b.cmp(a));
            if timestamps.len() <= max_frames {
                continue;
            }
            for stale in &timestamps[max_frames..] {
                let dir = station_entry.path().join(stale).join(&product_name);
                if let Err(err) = fs::remove_dir_all(&dir) {
                    error!(path = %dir.display(), %err, "retention delete failed");
                }
            }
            info!(
                %station,
                product = %product_name,
                removed = timestamps.len() - max_frames,
                "retention pass removed stale frames"
            );
            if let Ok(product) = product_name.parse::<Product>() {
                update_index(inner, &station, product);
            }
        }
    }
    Ok(())
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                dir_size(&path)
            } else {
                entry.metadata().map(|m| m.len()).unwrap_or(0)
            }
        })
        .sum()
}

fn count_rda_files(path: &Path) -> usize {
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                count_rda_files(&path)
            } else if path.extension().and_then(|e| e.to_str()) == Some("RDA") {
                1
            } else {
                0
            }
        })
        .sum()
}

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("gzip write")?;
    encoder.finish().context("gzip finish")
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).context("gzip read")?;
    Ok(out)
}
