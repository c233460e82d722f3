//! Earth-coordinate projection of decoded sweeps.
//!
//! Maps polar samples to `[x, y, z, value]` quadruples in meters from
//! the radar origin using the standard 4/3-earth-radius beam model, and
//! packs them as base64-encoded IEEE float16 for export.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use half::f16;
use levelii_core::RadarFrame;

/// Earth radius in meters.
const EARTH_RADIUS_M: f32 = 6_371_000.0;
/// Effective-radius multiplier accounting for atmospheric refraction.
const REFRACTION_FACTOR: f32 = 4.0 / 3.0;

/// One projected sample: x east, y north, z above the radar, value.
pub type Point = [f32; 4];

/// Project every sweep of a frame into earth coordinates.
///
/// Values at or below -100 are treated as no-data and skipped.
pub fn project_pointcloud(frame: &RadarFrame) -> Vec<Point> {
    let effective_radius = EARTH_RADIUS_M * REFRACTION_FACTOR;
    let radar_height = frame.radar_height_asl_meters;
    let base = effective_radius + radar_height;
    let base_sq = base * base;

    let mut points = Vec::new();
    for sweep in &frame.sweeps {
        let elevation_rad = sweep.elevation_deg.to_radians();
        let cos_elev = elevation_rad.cos();
        let sin_elev = elevation_rad.sin();
        let two_base_sin_elev = 2.0 * base * sin_elev;

        // Bins within a radial share an azimuth; cache the trig.
        let mut last_azimuth = f32::NAN;
        let mut sin_azimuth = 0.0;
        let mut cos_azimuth = 0.0;

        for bin in &sweep.bins {
            if bin.value <= -100.0 {
                continue;
            }
            if bin.azimuth_deg != last_azimuth {
                let azimuth_rad = bin.azimuth_deg.to_radians();
                sin_azimuth = azimuth_rad.sin();
                cos_azimuth = azimuth_rad.cos();
                last_azimuth = bin.azimuth_deg;
            }

            let range = bin.range_m;
            let height_asl =
                (range * range + base_sq + range * two_base_sin_elev).sqrt() - effective_radius;
            let arg = ((range * cos_elev) / (effective_radius + height_asl)).clamp(-1.0, 1.0);
            let ground_distance = effective_radius * arg.asin();

            points.push([
                ground_distance * sin_azimuth,
                ground_distance * cos_azimuth,
                height_asl - radar_height,
                bin.value,
            ]);
        }
    }
    points
}

/// Pack projected points as little-endian float16 and base64-encode.
pub fn encode_pointcloud(points: &[Point]) -> String {
    if points.is_empty() {
        return String::new();
    }
    let mut bytes = Vec::with_capacity(points.len() * 8);
    for point in points {
        for &component in point {
            bytes.extend_from_slice(&f16::from_f32(component).to_le_bytes());
        }
    }
    BASE64.encode(bytes)
}
