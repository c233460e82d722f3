//! Decoded radar frames: sweeps, bins and per-volume metadata.

use crate::product::Product;
use std::collections::HashMap;

/// Fallback range when the archive never reported one (230 km, the
/// standard long-range coverage of the network).
pub const DEFAULT_RANGE_METERS: f32 = 230_000.0;

/// One decoded sample: an azimuth/range/value triple.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bin {
    pub azimuth_deg: f32,
    pub range_m: f32,
    pub value: f32,
}

/// An ordered group of radials at a fixed elevation.
#[derive(Debug, Clone, Default)]
pub struct Sweep {
    /// 0-based position in the volume.
    pub index: usize,
    /// Elevation number from the Message 31 header (0 for legacy data).
    pub elevation_num: u8,
    /// Actual antenna elevation angle in degrees.
    pub elevation_deg: f32,
    /// Radials encountered in this sweep.
    pub ray_count: u32,
    /// Nyquist velocity (m/s) reported for this sweep, 0 if unknown.
    pub nyquist_velocity: f32,
    pub bins: Vec<Bin>,
}

/// Per-product result of decoding one archive file.
///
/// A frame lives only for the duration of one archive's decode; the
/// projector consumes it and the storage codec persists the result.
#[derive(Debug, Clone)]
pub struct RadarFrame {
    /// ICAO identifier from the volume header.
    pub station: String,
    /// `YYYYMMDD_HHMMSS`, derived from the volume header.
    pub timestamp: String,
    pub product: Product,

    pub sweeps: Vec<Sweep>,
    /// Sorted, deduplicated elevation angles present in the volume.
    pub available_tilts: Vec<f32>,

    /// Gate geometry, frozen at the first valid moment block with more
    /// than 10 gates. Zero until then.
    pub num_gates: u16,
    pub gate_spacing_meters: f32,
    pub first_gate_meters: f32,

    /// Total radials decoded across all sweeps.
    pub num_rays: u32,
    pub vcp_number: u16,
    pub unambiguous_range_meters: f32,
    pub max_range_meters: f32,
    /// Radar height above sea level; feeds the point-cloud projection.
    pub radar_height_asl_meters: f32,

    /// Ray counts keyed by [`tilt_key`].
    pub sweep_ray_counts: HashMap<i32, u32>,
    /// Nyquist velocity keyed by [`tilt_key`].
    pub nyquist_velocity: HashMap<i32, f32>,
}

impl RadarFrame {
    pub fn new(station: &str, timestamp: &str, product: Product) -> Self {
        Self {
            station: station.to_string(),
            timestamp: timestamp.to_string(),
            product,
            sweeps: Vec::new(),
            available_tilts: Vec::new(),
            num_gates: 0,
            gate_spacing_meters: 0.0,
            first_gate_meters: 0.0,
            num_rays: 0,
            vcp_number: 0,
            unambiguous_range_meters: 0.0,
            max_range_meters: 0.0,
            radar_height_asl_meters: 0.0,
            sweep_ray_counts: HashMap::new(),
            nyquist_velocity: HashMap::new(),
        }
    }

    /// Record the gate geometry if it is not already frozen. Geometry
    /// is only accepted from blocks with more than 10 gates.
    pub fn freeze_geometry(&mut self, num_gates: u16, gate_spacing_m: f32, first_gate_m: f32) {
        if self.num_gates == 0 && num_gates > 10 {
            self.num_gates = num_gates;
            self.gate_spacing_meters = gate_spacing_m;
            self.first_gate_meters = first_gate_m;
        }
    }

    /// Derive the tilt list and range defaults after the last radial.
    pub fn finalize(&mut self) {
        self.available_tilts = self.sweeps.iter().map(|s| s.elevation_deg).collect();
        self.available_tilts
            .sort_by(|a, b| a.partial_cmp(b).expect("elevation is finite"));
        self.available_tilts.dedup();

        if self.max_range_meters <= 0.0 {
            self.max_range_meters = DEFAULT_RANGE_METERS;
        }
        if self.unambiguous_range_meters <= 0.0 {
            self.unambiguous_range_meters = DEFAULT_RANGE_METERS;
        }
        for sweep in &mut self.sweeps {
            sweep.bins.shrink_to_fit();
        }
    }

    /// Whether any sweep holds samples.
    pub fn has_samples(&self) -> bool {
        self.sweeps.iter().any(|s| !s.bins.is_empty())
    }
}

/// Map an elevation angle to an integral key (hundredths of a degree)
/// for tilt-indexed maps, sidestepping float comparison.
pub fn tilt_key(elevation_deg: f32) -> i32 {
    (elevation_deg * 100.0).round() as i32
}
