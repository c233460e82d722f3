//! Polar-sample projection onto quantized grids.
//!
//! Consumes a decoded frame and produces one 2-D grid per tilt plus a
//! single 3-D volumetric grid, each already bitmask-encoded. Grids are
//! `u8` with 0 as the empty sentinel; overlapping writes keep the
//! maximum value.

use crate::bitmask::BitmaskArtifact;
use levelii_core::{quantize, tilt_key, RadarFrame};

/// The volumetric grid always uses the fine azimuth resolution.
pub const VOLUME_RAY_COUNT: u16 = 720;
/// A sweep with more rays than this is treated as 0.5-degree data.
pub const FINE_RESOLUTION_RAY_THRESHOLD: u32 = 400;
/// Volumetric grids beyond this many cells are skipped outright.
pub const MAX_VOLUME_CELLS: usize = 200_000_000;

/// Encoded 2-D grid for one tilt.
#[derive(Debug, Clone)]
pub struct TiltArtifact {
    pub tilt: f32,
    pub num_rays: u16,
    pub num_gates: u16,
    pub gate_spacing_m: f32,
    pub first_gate_m: f32,
    pub encoded: BitmaskArtifact,
}

/// Encoded 3-D grid covering every tilt.
#[derive(Debug, Clone)]
pub struct VolumeArtifact {
    pub tilts: Vec<f32>,
    pub num_rays: u16,
    pub num_gates: u16,
    pub gate_spacing_m: f32,
    pub first_gate_m: f32,
    pub encoded: BitmaskArtifact,
}

/// Everything the storage codec persists for one frame.
#[derive(Debug, Clone)]
pub struct ProjectedFrame {
    pub tilts: Vec<TiltArtifact>,
    pub volumetric: Option<VolumeArtifact>,
}

/// Compute the gate index for a range, or `None` when it falls outside
/// the grid.
pub fn gate_index(range_m: f32, first_gate_m: f32, gate_spacing_m: f32, num_gates: u16) -> Option<usize> {
    let idx = ((range_m - first_gate_m) / gate_spacing_m).floor() as i64;
    if idx < 0 || idx >= num_gates as i64 {
        return None;
    }
    Some(idx as usize)
}

/// Ray index for an azimuth at the given resolution factor.
///
/// The +0.01 nudge keeps azimuths sitting exactly on a ray boundary
/// from flapping between adjacent rays across radials.
pub fn ray_index(azimuth_deg: f32, resolution_factor: f32, num_rays: u16) -> usize {
    let mut idx = (azimuth_deg * resolution_factor + 0.01).floor() as i64 % num_rays as i64;
    if idx < 0 {
        idx += num_rays as i64;
    }
    idx as usize
}

/// Project one frame onto its per-tilt and volumetric grids.
///
/// Returns `None` when the frame has no tilts or no usable gate
/// geometry; the volumetric grid alone is dropped when it would exceed
/// [`MAX_VOLUME_CELLS`].
pub fn project_frame(frame: &RadarFrame) -> Option<ProjectedFrame> {
    if frame.available_tilts.is_empty() || frame.num_gates == 0 || frame.gate_spacing_meters <= 0.0
    {
        return None;
    }

    let tilts = &frame.available_tilts;
    let num_gates = frame.num_gates as usize;
    let params = frame.product.quant_params();

    let volume_cells = tilts.len() * VOLUME_RAY_COUNT as usize * num_gates;
    let mut volume_grid = if volume_cells <= MAX_VOLUME_CELLS {
        Some(vec![0u8; volume_cells])
    } else {
        tracing::warn!(
            station = %frame.station,
            product = %frame.product,
            cells = volume_cells,
            "volumetric grid over cell cap, skipping"
        );
        None
    };

    let mut tilt_artifacts = Vec::with_capacity(tilts.len());

    for (tilt_idx, &tilt) in tilts.iter().enumerate() {
        // 0.5-degree sweeps get the fine 2-D grid, 1-degree sweeps the
        // coarse one.
        let sweep_rays = frame
            .sweep_ray_counts
            .get(&tilt_key(tilt))
            .copied()
            .unwrap_or(0);
        let (num_rays, resolution_factor) = if sweep_rays > FINE_RESOLUTION_RAY_THRESHOLD {
            (VOLUME_RAY_COUNT, 2.0f32)
        } else {
            (360u16, 1.0f32)
        };

        let mut grid_2d = vec![0u8; num_rays as usize * num_gates];
        let mut populated = false;

        for sweep in &frame.sweeps {
            if (sweep.elevation_deg - tilt).abs() >= 0.01 {
                continue;
            }
            populated = populated || !sweep.bins.is_empty();
            for bin in &sweep.bins {
                let cell = quantize(bin.value, params);
                if cell == 0 {
                    continue;
                }
                let Some(gate) = gate_index(
                    bin.range_m,
                    frame.first_gate_meters,
                    frame.gate_spacing_meters,
                    frame.num_gates,
                ) else {
                    continue;
                };

                let ray_2d = ray_index(bin.azimuth_deg, resolution_factor, num_rays);
                let idx_2d = ray_2d * num_gates + gate;
                grid_2d[idx_2d] = grid_2d[idx_2d].max(cell);

                if let Some(volume) = volume_grid.as_mut() {
                    let ray_3d = ray_index(bin.azimuth_deg, 2.0, VOLUME_RAY_COUNT);
                    let tilt_base = tilt_idx * VOLUME_RAY_COUNT as usize * num_gates;
                    let idx_3d = tilt_base + ray_3d * num_gates + gate;
                    volume[idx_3d] = volume[idx_3d].max(cell);
                    // Coarse-resolution sweeps only fill every other ray
                    // of the fine grid; splat into the neighbor so the
                    // volume reads dense.
                    if resolution_factor < 1.5 {
                        let adjacent = (ray_3d + 1) % VOLUME_RAY_COUNT as usize;
                        let adj_idx = tilt_base + adjacent * num_gates + gate;
                        volume[adj_idx] = volume[adj_idx].max(cell);
                    }
                }
            }
        }

        if !populated {
            continue;
        }
        tilt_artifacts.push(TiltArtifact {
            tilt,
            num_rays,
            num_gates: frame.num_gates,
            gate_spacing_m: frame.gate_spacing_meters,
            first_gate_m: frame.first_gate_meters,
            encoded: BitmaskArtifact::encode(&grid_2d),
        });
    }

    let volumetric = volume_grid.and_then(|grid| {
        let encoded = BitmaskArtifact::encode(&grid);
        if encoded.values.is_empty() {
            return None;
        }
        Some(VolumeArtifact {
            tilts: tilts.clone(),
            num_rays: VOLUME_RAY_COUNT,
            num_gates: frame.num_gates,
            gate_spacing_m: frame.gate_spacing_meters,
            first_gate_m: frame.first_gate_meters,
            encoded,
        })
    });

    Some(ProjectedFrame {
        tilts: tilt_artifacts,
        volumetric,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use levelii_core::{Bin, Product, Sweep};

    fn test_frame(product: Product, sweeps: Vec<Sweep>) -> RadarFrame {
        let mut frame = RadarFrame::new("KTLX", "20270213_162244", product);
        frame.num_gates = 100;
        frame.gate_spacing_meters = 250.0;
        frame.first_gate_meters = 500.0;
        for sweep in &sweeps {
            frame
                .sweep_ray_counts
                .insert(levelii_core::tilt_key(sweep.elevation_deg), sweep.ray_count);
        }
        frame.sweeps = sweeps;
        frame.finalize();
        frame
    }

    fn sweep(elevation: f32, ray_count: u32, bins: Vec<Bin>) -> Sweep {
        Sweep {
            elevation_deg: elevation,
            ray_count,
            bins,
            ..Default::default()
        }
    }

    #[test]
    fn gate_index_boundaries() {
        // first_gate 500, spacing 250
        assert_eq!(gate_index(500.0, 500.0, 250.0, 100), Some(0));
        assert_eq!(gate_index(749.9, 500.0, 250.0, 100), Some(0));
        assert_eq!(gate_index(750.0, 500.0, 250.0, 100), Some(1));
        assert_eq!(gate_index(499.0, 500.0, 250.0, 100), None);
        assert_eq!(gate_index(500.0 + 100.0 * 250.0, 500.0, 250.0, 100), None);
    }

    #[test]
    fn ray_index_wraps() {
        assert_eq!(ray_index(359.9, 2.0, 720), 719);
        assert_eq!(ray_index(360.0, 2.0, 720), 0);
        assert_eq!(ray_index(0.0, 1.0, 360), 0);
        assert_eq!(ray_index(359.9, 1.0, 360), 359);
    }

    #[test]
    fn coarse_sweep_uses_360_rays_and_splats_volume() {
        let bins = vec![Bin {
            azimuth_deg: 45.0,
            range_m: 500.0,
            value: 40.0,
        }];
        let frame = test_frame(Product::Reflectivity, vec![sweep(0.5, 360, bins)]);
        let projected = project_frame(&frame).unwrap();

        assert_eq!(projected.tilts.len(), 1);
        let tilt = &projected.tilts[0];
        assert_eq!(tilt.num_rays, 360);

        let grid = BitmaskArtifact::decode(
            &tilt.encoded.bitmask,
            &tilt.encoded.values,
            360 * 100,
        )
        .unwrap();
        let cell = levelii_core::quantize(40.0, Product::Reflectivity.quant_params());
        assert_eq!(grid[45 * 100], cell);

        // The volume is always 720 rays; the 1-degree source splats
        // into rays 90 and 91.
        let volume = projected.volumetric.unwrap();
        assert_eq!(volume.num_rays, 720);
        let volume_grid = BitmaskArtifact::decode(
            &volume.encoded.bitmask,
            &volume.encoded.values,
            720 * 100,
        )
        .unwrap();
        assert_eq!(volume_grid[90 * 100], cell);
        assert_eq!(volume_grid[91 * 100], cell);
        assert_eq!(volume.encoded.values.len(), 2);
    }

    #[test]
    fn fine_sweep_uses_720_rays_without_splat() {
        let bins = vec![Bin {
            azimuth_deg: 45.0,
            range_m: 500.0,
            value: 40.0,
        }];
        let frame = test_frame(Product::Reflectivity, vec![sweep(0.5, 720, bins)]);
        let projected = project_frame(&frame).unwrap();

        assert_eq!(projected.tilts[0].num_rays, 720);
        let volume = projected.volumetric.unwrap();
        assert_eq!(volume.encoded.values.len(), 1);
    }

    #[test]
    fn max_merge_on_collisions() {
        let bins = vec![
            Bin {
                azimuth_deg: 10.0,
                range_m: 600.0,
                value: 20.0,
            },
            Bin {
                azimuth_deg: 10.0,
                range_m: 610.0,
                value: 35.0,
            },
        ];
        let frame = test_frame(Product::Reflectivity, vec![sweep(0.5, 360, bins)]);
        let projected = project_frame(&frame).unwrap();
        let tilt = &projected.tilts[0];
        let grid =
            BitmaskArtifact::decode(&tilt.encoded.bitmask, &tilt.encoded.values, 360 * 100)
                .unwrap();
        let expected = levelii_core::quantize(35.0, Product::Reflectivity.quant_params());
        assert_eq!(grid[10 * 100], expected);
    }

    #[test]
    fn out_of_range_gates_dropped() {
        let bins = vec![
            Bin {
                azimuth_deg: 0.0,
                range_m: 499.0, // before the first gate
                value: 40.0,
            },
            Bin {
                azimuth_deg: 0.0,
                range_m: 500.0 + 101.0 * 250.0, // past the last gate
                value: 40.0,
            },
        ];
        let frame = test_frame(Product::Reflectivity, vec![sweep(0.5, 360, bins)]);
        let projected = project_frame(&frame).unwrap();
        // The sweep had bins, so a tilt artifact exists, but empty.
        assert_eq!(projected.tilts[0].encoded.values.len(), 0);
        assert!(projected.volumetric.is_none());
    }

    #[test]
    fn frames_without_geometry_are_rejected() {
        let mut frame = RadarFrame::new("KTLX", "20270213_162244", Product::Reflectivity);
        frame.sweeps.push(sweep(0.5, 360, vec![]));
        frame.finalize();
        frame.num_gates = 0;
        assert!(project_frame(&frame).is_none());
    }

    #[test]
    fn elevations_group_within_hundredth_of_degree() {
        // Two sweeps 0.005 degrees apart collapse onto one tilt's grid.
        let mut frame = RadarFrame::new("KTLX", "20270213_162244", Product::Reflectivity);
        frame.num_gates = 100;
        frame.gate_spacing_meters = 250.0;
        frame.first_gate_meters = 500.0;
        frame.sweeps = vec![
            sweep(
                0.5,
                360,
                vec![Bin {
                    azimuth_deg: 1.0,
                    range_m: 500.0,
                    value: 30.0,
                }],
            ),
            sweep(
                0.505,
                360,
                vec![Bin {
                    azimuth_deg: 2.0,
                    range_m: 500.0,
                    value: 30.0,
                }],
            ),
        ];
        frame.sweep_ray_counts.insert(levelii_core::tilt_key(0.5), 360);
        frame.finalize();

        let projected = project_frame(&frame).unwrap();
        // 0.5 and 0.505 dedup to two tilts, but the 0.505 sweep also
        // lands on the 0.5 grid (|0.505 - 0.5| < 0.01).
        let first = &projected.tilts[0];
        assert_eq!(first.tilt, 0.5);
        assert_eq!(first.encoded.values.len(), 2);
    }
}
