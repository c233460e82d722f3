//! Ingestion scheduler for the Level II pipeline.
//!
//! Periodically discovers newly-published archives per station over an
//! [`object_store::ObjectStore`], fetches and decodes them through a
//! two-stage pipeline, and hands artifacts to the storage codec.
//! Progress survives restarts via per-station cursors in `state.json`.

pub mod config;
pub mod discovery;
pub mod fetcher;
pub mod object_store;
pub mod state;

pub use config::{FetcherConfig, ALL_STATIONS};
pub use discovery::{DiscoveryBatch, DiscoveryItem, DEFAULT_BUCKET};
pub use fetcher::FrameFetcher;
pub use object_store::{Listing, MemoryStore, ObjectStore, S3HttpStore};
pub use state::StationStats;
