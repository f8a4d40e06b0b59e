//! Per-pixel depth refinement by patch matching.
//!
//! Every sweep walks the grid in serpentine order (reversed on odd sweeps).
//! A pixel tests its current depth, the depths of its valid 4-neighbors and
//! a fan of multiplicative perturbations of its own depth. Each hypothesis
//! is scored by the mean normalized cross-correlation between the reference
//! window and its reprojection into every textured neighbor, assuming a
//! fronto-parallel surface. The perturbation halves after each sweep.

use anyhow::{ensure, Result};
use tracing::debug;

use crate::config::PatchConfig;
use crate::depth::{DepthData, Grid};
use crate::geometry::ViewGeometry;
use crate::scene::ImageData;

use super::{DepthEstimator, EstimationContext};

/// Confidence given to seed depths when no pixels are available to refine them.
const SEED_CONFIDENCE: f32 = 0.5;

pub struct PatchEstimator {
    config: PatchConfig,
}

/// Reference window of one pixel: sample positions and zero-mean intensities.
struct RefWindow {
    samples: Vec<(f64, f64, f64)>,
    norm: f64,
}

impl PatchEstimator {
    pub fn new(config: PatchConfig) -> Self {
        Self { config }
    }

    fn ref_window(&self, img: &ImageData, x: u32, y: u32) -> Option<RefWindow> {
        let r = self.config.patch_radius as i64;
        let mut samples = Vec::with_capacity(((2 * r + 1) * (2 * r + 1)) as usize);
        for dy in -r..=r {
            for dx in -r..=r {
                let (sx, sy) = (i64::from(x) + dx, i64::from(y) + dy);
                if sx < 0 || sy < 0 || sx >= i64::from(img.width) || sy >= i64::from(img.height) {
                    continue;
                }
                let v = f64::from(img.gray_at(sx as u32, sy as u32));
                samples.push((sx as f64, sy as f64, v));
            }
        }
        if samples.len() < 3 {
            return None;
        }
        let n = samples.len() as f64;
        let mean = samples.iter().map(|s| s.2).sum::<f64>() / n;
        let mut var = 0.0;
        for s in &mut samples {
            s.2 -= mean;
            var += s.2 * s.2;
        }
        if var / n < self.config.min_variance {
            return None;
        }
        Some(RefWindow {
            samples,
            norm: var.sqrt(),
        })
    }

    /// Mean NCC of the window at `depth` over all neighbors that see it.
    fn score(&self, window: &RefWindow, ref_view: &ViewGeometry, neighbors: &[(&ViewGeometry, &ImageData)], depth: f64) -> Option<f64> {
        let mut total = 0.0;
        let mut used = 0usize;
        let mut values = Vec::with_capacity(window.samples.len());
        'neighbors: for (view, img) in neighbors {
            values.clear();
            for &(u, v, _) in &window.samples {
                let p = ref_view.backproject(u, v, depth);
                let Some((nu, nv, nz)) = view.project_world(&p) else {
                    continue 'neighbors;
                };
                if nz <= 0.0 {
                    continue 'neighbors;
                }
                match img.sample(nu, nv) {
                    Some(val) => values.push(f64::from(val)),
                    None => continue 'neighbors,
                }
            }
            let n = values.len() as f64;
            let mean = values.iter().sum::<f64>() / n;
            let mut cross = 0.0;
            let mut var = 0.0;
            for (s, &val) in window.samples.iter().zip(&values) {
                let d = val - mean;
                cross += s.2 * d;
                var += d * d;
            }
            if var / n < self.config.min_variance {
                continue;
            }
            total += cross / (window.norm * var.sqrt());
            used += 1;
        }
        (used > 0).then(|| total / used as f64)
    }
}

impl DepthEstimator for PatchEstimator {
    fn name(&self) -> &'static str {
        "patch"
    }

    fn estimate(&self, ctx: &EstimationContext<'_>, dd: &mut DepthData) -> Result<()> {
        let (w, h) = (dd.width(), dd.height());
        let neighbors = ctx.textured_neighbors();
        let Some(reference) = ctx.reference.filter(|_| !neighbors.is_empty()) else {
            // Nothing to match against: the seeds are the estimate.
            let mut conf = Grid::try_new(w, h, 0.0f32)?;
            for (c, &d) in conf.as_mut_slice().iter_mut().zip(dd.depth_map.as_slice()) {
                if d > 0.0 {
                    *c = SEED_CONFIDENCE;
                }
            }
            dd.confidence_map = Some(conf);
            return Ok(());
        };
        ensure!(
            reference.width == w && reference.height == h,
            "{} pixels are {}x{}, depth map is {}x{}",
            dd.image_id,
            reference.width,
            reference.height,
            w,
            h
        );
        ensure!(ctx.coords.len() == w as usize * h as usize, "pixel order does not cover the depth map");

        let (lo, hi) = dd
            .depth_range
            .map_or((f32::MIN_POSITIVE, f32::MAX), |(lo, hi)| (lo, hi));
        let windows: Vec<Option<RefWindow>> = (0..h)
            .flat_map(|y| (0..w).map(move |x| (x, y)))
            .map(|(x, y)| self.ref_window(reference, x, y))
            .collect();
        let mut scores = Grid::try_new(w, h, f64::NEG_INFINITY)?;
        let hyps = self.config.hypotheses.max(1);
        let mut candidates: Vec<f32> = Vec::with_capacity(hyps + 5);

        for sweep in 0..self.config.iterations {
            let spread = self.config.depth_perturbation * 0.5f64.powi(sweep as i32);
            let forward = sweep % 2 == 0;
            for i in 0..ctx.coords.len() {
                let (x, y) = if forward { ctx.coords[i] } else { ctx.coords[ctx.coords.len() - 1 - i] };
                let Some(window) = windows[dd.depth_map.index(x, y)].as_ref() else {
                    continue;
                };

                candidates.clear();
                let current = dd.depth(x, y);
                if current > 0.0 {
                    if !scores.get(x, y).is_finite() {
                        candidates.push(current);
                    }
                    for k in 0..hyps {
                        let f = if hyps == 1 { 0.0 } else { -1.0 + 2.0 * k as f64 / (hyps - 1) as f64 };
                        candidates.push((f64::from(current) * (1.0 + spread * f)) as f32);
                    }
                }
                for (nx, ny) in dd.depth_map.neighbors4(x, y) {
                    let d = dd.depth(nx, ny);
                    if d > 0.0 && d != current {
                        candidates.push(d);
                    }
                }

                let mut best = (*scores.get(x, y), current);
                for &d in &candidates {
                    if !(d >= lo && d <= hi) {
                        continue;
                    }
                    if let Some(s) = self.score(window, &dd.view, &neighbors, f64::from(d)) {
                        if s > best.0 {
                            best = (s, d);
                        }
                    }
                }
                if best.1 > 0.0 && best.0.is_finite() {
                    scores.set(x, y, best.0);
                    dd.depth_map.set(x, y, best.1);
                }
            }
        }

        let mut conf = Grid::try_new(w, h, 0.0f32)?;
        let mut rejected = 0usize;
        for y in 0..h {
            for x in 0..w {
                let s = *scores.get(x, y);
                if dd.depth(x, y) > 0.0 && s >= self.config.min_ncc {
                    conf.set(x, y, ((s + 1.0) * 0.5) as f32);
                } else {
                    if dd.depth(x, y) > 0.0 {
                        rejected += 1;
                    }
                    dd.depth_map.set(x, y, 0.0);
                }
            }
        }
        dd.confidence_map = Some(conf);
        debug!(
            "[PatchEstimator] {}: {} valid, {} rejected",
            dd.image_id,
            dd.valid_count(),
            rejected
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FusionMode;
    use crate::matching::test_scene::{render, view_at, PLANE_Z};
    use crate::matching::{zigzag_coords, NeighborImage};
    use crate::scene::ImageId;

    fn seeded(view: &ViewGeometry, seed: f32) -> DepthData {
        let mut dd = DepthData::new(ImageId(0), 0, view.clone(), FusionMode::PerPixel).unwrap();
        dd.depth_map.fill(seed);
        dd.depth_range = Some((4.0, 6.5));
        dd
    }

    #[test]
    fn test_converges_on_textured_plane() {
        let ref_view = view_at(0.0);
        let left = view_at(-1.0);
        let right = view_at(1.0);
        let (ref_img, left_img, right_img) = (render(&ref_view), render(&left), render(&right));
        let coords = zigzag_coords(64, 48);
        let ctx = EstimationContext {
            reference: Some(&ref_img),
            neighbors: vec![
                NeighborImage { image_id: ImageId(1), view: &left, pixels: Some(&left_img) },
                NeighborImage { image_id: ImageId(2), view: &right, pixels: Some(&right_img) },
            ],
            coords: &coords,
        };

        let mut dd = seeded(&ref_view, 5.3);
        PatchEstimator::new(PatchConfig::default()).estimate(&ctx, &mut dd).unwrap();

        let mut errors: Vec<f64> = dd
            .depth_map
            .as_slice()
            .iter()
            .filter(|&&d| d > 0.0)
            .map(|&d| (f64::from(d) - PLANE_Z).abs() / PLANE_Z)
            .collect();
        assert!(errors.len() > 64 * 48 / 2, "only {} valid pixels", errors.len());
        errors.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let median = errors[errors.len() / 2];
        assert!(median < 0.02, "median relative error {}", median);

        let conf = dd.confidence_map.as_ref().unwrap();
        assert!(conf.as_slice().iter().all(|&c| (0.0..=1.0).contains(&c)));
    }

    #[test]
    fn test_without_pixels_keeps_seeds() {
        let ref_view = view_at(0.0);
        let other = view_at(1.0);
        let coords = zigzag_coords(64, 48);
        let ctx = EstimationContext {
            reference: None,
            neighbors: vec![NeighborImage { image_id: ImageId(1), view: &other, pixels: None }],
            coords: &coords,
        };
        let mut dd = seeded(&ref_view, 5.0);
        dd.depth_map.set(0, 0, 0.0);

        PatchEstimator::new(PatchConfig::default()).estimate(&ctx, &mut dd).unwrap();
        assert_eq!(dd.valid_count(), 64 * 48 - 1);
        assert_eq!(dd.confidence(0, 0), 0.0);
        assert_eq!(dd.confidence(1, 0), SEED_CONFIDENCE);
    }

    #[test]
    fn test_textureless_pixels_are_invalidated() {
        let ref_view = view_at(0.0);
        let other = view_at(1.0);
        let flat = ImageData::from_gray(64, 48, vec![0.5; 64 * 48]).unwrap();
        let coords = zigzag_coords(64, 48);
        let ctx = EstimationContext {
            reference: Some(&flat),
            neighbors: vec![NeighborImage { image_id: ImageId(1), view: &other, pixels: Some(&flat) }],
            coords: &coords,
        };
        let mut dd = seeded(&ref_view, 5.0);

        PatchEstimator::new(PatchConfig::default()).estimate(&ctx, &mut dd).unwrap();
        assert_eq!(dd.valid_count(), 0);
    }
}
