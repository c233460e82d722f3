//! Core types for the NEXRAD Level II ingestion pipeline.
//!
//! This crate holds the vocabulary shared by the decoder, the
//! scheduler and the storage codec: the product catalog with its
//! quantization tables, the frame/sweep/bin data model, volume
//! timestamp derivation and the error taxonomy.

pub mod error;
pub mod frame;
pub mod product;
pub mod timestamp;

pub use error::{LeveliiError, Result};
pub use frame::{tilt_key, Bin, RadarFrame, Sweep, DEFAULT_RANGE_METERS};
pub use product::{dequantize, quantize, round_tenth, Product, QuantParams};
pub use timestamp::volume_timestamp;
