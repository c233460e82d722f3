//! Bitmask-over-values grid codec.
//!
//! A quantized grid is mostly empty (cell value 0). The persistent form
//! is a packed occupancy bitmask (one bit per cell, MSB-first within
//! each byte) plus the non-zero cell values in row-major order. The
//! number of set bits always equals the number of emitted values.

use serde::{Deserialize, Serialize};

/// Encoded form of one grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitmaskArtifact {
    /// `ceil(cells / 8)` bytes; bit `7 - (i % 8)` of byte `i / 8` marks
    /// cell `i` occupied.
    pub bitmask: Vec<u8>,
    /// Non-zero cells in row-major traversal order.
    pub values: Vec<u8>,
}

impl BitmaskArtifact {
    /// Encode a flat grid.
    pub fn encode(grid: &[u8]) -> Self {
        let mut bitmask = vec![0u8; grid.len().div_ceil(8)];
        let mut values = Vec::new();
        for (i, &cell) in grid.iter().enumerate() {
            if cell > 0 {
                bitmask[i / 8] |= 1 << (7 - (i % 8));
                values.push(cell);
            }
        }
        Self { bitmask, values }
    }

    /// Reconstruct the flat grid. Returns `None` when the mask and
    /// value count disagree with `cell_count`.
    pub fn decode(bitmask: &[u8], values: &[u8], cell_count: usize) -> Option<Vec<u8>> {
        if bitmask.len() != cell_count.div_ceil(8) {
            return None;
        }
        let mut grid = vec![0u8; cell_count];
        let mut next_value = 0usize;
        for (i, cell) in grid.iter_mut().enumerate() {
            if bitmask[i / 8] & (1 << (7 - (i % 8))) != 0 {
                *cell = *values.get(next_value)?;
                next_value += 1;
            }
        }
        if next_value != values.len() {
            return None;
        }
        Some(grid)
    }

    /// Number of occupied cells.
    pub fn set_bits(&self) -> usize {
        self.bitmask.iter().map(|b| b.count_ones() as usize).sum()
    }
}

/// JSON metadata stored ahead of the binary payload in each artifact
/// file. Keys are deliberately short; these repeat per file across a
/// large retention window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    /// Station ICAO.
    pub s: String,
    /// Product name.
    pub p: String,
    /// Volume timestamp `YYYYMMDD_HHMMSS`.
    pub t: String,
    /// Elevation of a per-tilt artifact; absent on volumetric files.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub e: Option<f32>,
    /// Format tag; always `"b"` for bitmask.
    pub f: String,
    /// Tilt list; present on volumetric files only.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tilts: Option<Vec<f32>>,
    /// Ray count of the grid.
    pub r: u16,
    /// Gate count of the grid.
    pub g: u16,
    /// Gate spacing in meters.
    pub gs: f32,
    /// Range to first gate in meters.
    pub fg: f32,
    /// Number of stored values.
    pub v: usize,
}

impl ArtifactMetadata {
    /// Total grid cells this artifact describes.
    pub fn cell_count(&self) -> usize {
        let tilt_count = self.tilts.as_ref().map_or(1, Vec::len);
        tilt_count * self.r as usize * self.g as usize
    }
}
