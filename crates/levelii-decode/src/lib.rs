//! Archive II / Message 31 binary decoder.
//!
//! Turns one archive file into per-product frames of azimuth/range/value
//! samples. The pipeline is: container decompression ([`decompress`]),
//! segment reassembly ([`segment`]), wire-layout parsing ([`message`])
//! and the scan/parse state machine ([`decoder`]). All structured reads
//! into untrusted bytes go through [`bytes`].

pub mod bytes;
pub mod decoder;
pub mod decompress;
pub mod geo;
pub mod message;
pub mod segment;
pub mod testutil;

pub use decoder::{decode_products, DecodeOptions};
pub use decompress::auto_decompress;
pub use geo::{encode_pointcloud, project_pointcloud};
pub use message::{RadialMessage, VolumeHeader};
pub use segment::{AssembledMessage, MessageSegmenter};
