//! Storage codec for decoded radar frames.
//!
//! [`projector`] turns a decoded frame into quantized per-tilt and
//! volumetric grids, [`bitmask`] packs them, and [`store`] owns the
//! on-disk layout, the per-product indexes, retention and the single
//! write-serializing worker.

pub mod bitmask;
pub mod projector;
pub mod store;

pub use bitmask::{ArtifactMetadata, BitmaskArtifact};
pub use projector::{project_frame, ProjectedFrame, TiltArtifact, VolumeArtifact};
pub use store::{FrameStore, LoadedArtifact, ProductIndex, WriteTask};
