//! Depth-map seeding from the sparse point cloud.

use anyhow::{bail, Result};
use tracing::debug;

use crate::config::InitConfig;
use crate::scene::Scene;

use super::depth_data::{DepthData, DepthStage};
use super::grid::Grid;

/// Seed the depth map of `dd` from the sparse points it observes.
///
/// Each visible point is projected onto the working grid, the nearest depth
/// winning when several land on the same pixel. Seeds are then grown in
/// diamond (L1) rings: a pixel at ring `k` takes the mean depth of its valid
/// 4-neighbors from ring `k - 1`. Pixels farther than `seed_fill_radius`
/// from every seed stay invalid.
pub fn init_depth_map(dd: &mut DepthData, scene: &Scene, config: &InitConfig) -> Result<()> {
    let (w, h) = (dd.width(), dd.height());
    if w == 0 || h == 0 {
        bail!("{} has a zero-sized depth map", dd.image_id);
    }
    dd.depth_map.fill(0.0);
    dd.normal_map = None;
    dd.confidence_map = None;

    let mut seeds: Vec<(u32, u32)> = Vec::new();
    let mut projected = 0usize;
    let mut min_depth = f32::MAX;
    let mut max_depth = 0.0f32;
    for &pi in scene.visible_points(dd.image_id) {
        let p = &scene.points()[pi].position;
        let Some((x, y, z)) = dd.view.project_to_pixel(p) else {
            continue;
        };
        let z = z as f32;
        if !(z > 0.0 && z.is_finite()) {
            continue;
        }
        projected += 1;
        min_depth = min_depth.min(z);
        max_depth = max_depth.max(z);
        let current = dd.depth(x, y);
        if current == 0.0 {
            seeds.push((x, y));
            dd.depth_map.set(x, y, z);
        } else if z < current {
            dd.depth_map.set(x, y, z);
        }
    }

    if projected < config.min_seed_points {
        bail!(
            "{} has {} sparse points in view, {} required",
            dd.image_id,
            projected,
            config.min_seed_points
        );
    }

    // Ring-by-ring growth; `reached` marks pixels already assigned to a ring.
    let mut reached = Grid::try_new(w, h, false)?;
    for &(x, y) in &seeds {
        reached.set(x, y, true);
    }
    let mut frontier = seeds;
    for _ in 0..config.seed_fill_radius {
        let mut ring: Vec<(u32, u32)> = Vec::new();
        for &(x, y) in &frontier {
            for (nx, ny) in dd.depth_map.neighbors4(x, y) {
                if !*reached.get(nx, ny) {
                    reached.set(nx, ny, true);
                    ring.push((nx, ny));
                }
            }
        }
        if ring.is_empty() {
            break;
        }
        let filled: Vec<f32> = ring
            .iter()
            .map(|&(x, y)| {
                let (sum, n) = dd
                    .depth_map
                    .neighbors4(x, y)
                    .map(|(nx, ny)| dd.depth(nx, ny))
                    .filter(|&d| d > 0.0)
                    .fold((0.0f32, 0u32), |(s, n), d| (s + d, n + 1));
                if n > 0 {
                    sum / n as f32
                } else {
                    0.0
                }
            })
            .collect();
        for (&(x, y), d) in ring.iter().zip(filled) {
            dd.depth_map.set(x, y, d);
        }
        frontier = ring;
    }

    let margin = config.depth_range_margin.max(0.0) as f32;
    dd.depth_range = Some(((min_depth * (1.0 - margin)).max(f32::MIN_POSITIVE), max_depth * (1.0 + margin)));
    dd.stage = DepthStage::Initialized;

    debug!(
        "[DepthInit] {}: {} seeds, {} valid pixels, range {:?}",
        dd.image_id,
        projected,
        dd.valid_count(),
        dd.depth_range
    );
    Ok(())
}
