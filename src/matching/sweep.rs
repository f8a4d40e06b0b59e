//! Semi-global plane-sweep matching against the best stereo partner.
//!
//! Fronto-parallel planes are placed uniformly in inverse depth over the seed
//! depth range. The matching cost of a plane is the mean absolute intensity
//! difference of a 3x3 window; costs are aggregated along four scanline
//! directions with P1/P2 smoothness penalties, and each pixel takes the
//! plane with the lowest aggregated cost, refined by a parabola fit.

use anyhow::{anyhow, bail, ensure, Context, Result};
use tracing::debug;

use crate::config::SweepConfig;
use crate::depth::{DepthData, Grid};

use super::{DepthEstimator, EstimationContext};

/// Cost of a plane whose reprojection leaves the partner image.
const OUT_OF_VIEW_COST: f32 = 1.0;

/// Half size of the matching window.
const WINDOW_RADIUS: i64 = 1;

/// Number of aggregation paths.
const NUM_PATHS: f32 = 4.0;

pub struct SweepMatcher {
    config: SweepConfig,
}

impl SweepMatcher {
    pub fn new(config: SweepConfig) -> Self {
        Self { config }
    }

    /// Aggregate one scanline in place: `sum += L` along `pixels`.
    fn aggregate_line(
        &self,
        cost: &[f32],
        sum: &mut [f32],
        pixels: impl Iterator<Item = usize>,
        num_depths: usize,
        prev: &mut Vec<f32>,
        cur: &mut Vec<f32>,
    ) {
        let (p1, p2) = (self.config.p1, self.config.p2);
        let mut first = true;
        let mut prev_min = 0.0f32;
        for p in pixels {
            let c = &cost[p * num_depths..(p + 1) * num_depths];
            cur.clear();
            if first {
                cur.extend_from_slice(c);
                first = false;
            } else {
                for k in 0..num_depths {
                    let mut best = prev[k].min(prev_min + p2);
                    if k > 0 {
                        best = best.min(prev[k - 1] + p1);
                    }
                    if k + 1 < num_depths {
                        best = best.min(prev[k + 1] + p1);
                    }
                    cur.push(c[k] + best - prev_min);
                }
            }
            for (s, &l) in sum[p * num_depths..(p + 1) * num_depths].iter_mut().zip(cur.iter()) {
                *s += l;
            }
            prev_min = cur.iter().copied().fold(f32::MAX, f32::min);
            std::mem::swap(prev, cur);
        }
    }
}

impl DepthEstimator for SweepMatcher {
    fn name(&self) -> &'static str {
        "sweep"
    }

    fn estimate(&self, ctx: &EstimationContext<'_>, dd: &mut DepthData) -> Result<()> {
        let reference = ctx
            .reference
            .with_context(|| format!("{} has no pixels for global matching", dd.image_id))?;
        let Some(partner) = ctx.neighbors.first() else {
            bail!("{} has no stereo partner", dd.image_id);
        };
        let partner_img = partner
            .pixels
            .with_context(|| format!("stereo partner {} has no pixels", partner.image_id))?;
        let (lo, hi) = dd
            .depth_range
            .with_context(|| format!("{} has no depth range", dd.image_id))?;
        let (w, h) = (dd.width(), dd.height());
        ensure!(
            reference.width == w && reference.height == h,
            "{} pixels do not match the depth map size",
            dd.image_id
        );

        let num_depths = self.config.num_depths.max(2);
        let num_pixels = w as usize * h as usize;
        let cells = num_pixels
            .checked_mul(num_depths)
            .ok_or_else(|| anyhow!("cost volume size overflows"))?;
        let bytes = cells.saturating_mul(2 * std::mem::size_of::<f32>());
        if bytes > self.config.max_cost_volume_bytes {
            bail!(
                "{} cost volume needs {} bytes, limit is {}",
                dd.image_id,
                bytes,
                self.config.max_cost_volume_bytes
            );
        }

        let inv_far = 1.0 / f64::from(hi);
        let inv_near = 1.0 / f64::from(lo);
        let inv_step = (inv_near - inv_far) / (num_depths - 1) as f64;
        let inv_depth = |k: f64| inv_far + inv_step * k;

        // Pixel-major cost volume.
        let mut cost: Vec<f32> = Vec::new();
        cost.try_reserve_exact(cells)
            .map_err(|e| anyhow!("cannot allocate cost volume: {}", e))?;
        let r = WINDOW_RADIUS;
        for y in 0..h {
            for x in 0..w {
                for k in 0..num_depths {
                    let depth = 1.0 / inv_depth(k as f64);
                    let p = dd.view.backproject(f64::from(x), f64::from(y), depth);
                    let Some((u, v, _)) = partner.view.project_world(&p).filter(|t| t.2 > 0.0) else {
                        cost.push(OUT_OF_VIEW_COST);
                        continue;
                    };
                    let mut sad = 0.0f32;
                    let mut n = 0.0f32;
                    let mut inside = true;
                    'window: for dy in -r..=r {
                        for dx in -r..=r {
                            let rx = (i64::from(x) + dx).clamp(0, i64::from(w) - 1) as u32;
                            let ry = (i64::from(y) + dy).clamp(0, i64::from(h) - 1) as u32;
                            let su = u + (i64::from(rx) - i64::from(x)) as f64;
                            let sv = v + (i64::from(ry) - i64::from(y)) as f64;
                            match partner_img.sample(su, sv) {
                                Some(val) => {
                                    sad += (reference.gray_at(rx, ry) - val).abs();
                                    n += 1.0;
                                }
                                None => {
                                    inside = false;
                                    break 'window;
                                }
                            }
                        }
                    }
                    cost.push(if inside && n > 0.0 { (sad / n).min(OUT_OF_VIEW_COST) } else { OUT_OF_VIEW_COST });
                }
            }
        }

        let mut sum = vec![0.0f32; cells];
        let mut prev = Vec::with_capacity(num_depths);
        let mut cur = Vec::with_capacity(num_depths);
        let (wu, hu) = (w as usize, h as usize);
        for y in 0..hu {
            self.aggregate_line(&cost, &mut sum, (0..wu).map(|x| y * wu + x), num_depths, &mut prev, &mut cur);
            self.aggregate_line(&cost, &mut sum, (0..wu).rev().map(|x| y * wu + x), num_depths, &mut prev, &mut cur);
        }
        for x in 0..wu {
            self.aggregate_line(&cost, &mut sum, (0..hu).map(|y| y * wu + x), num_depths, &mut prev, &mut cur);
            self.aggregate_line(&cost, &mut sum, (0..hu).rev().map(|y| y * wu + x), num_depths, &mut prev, &mut cur);
        }

        // Winner takes all.
        let mut conf = Grid::try_new(w, h, 0.0f32)?;
        for y in 0..h {
            for x in 0..w {
                let p = dd.depth_map.index(x, y);
                let s = &sum[p * num_depths..(p + 1) * num_depths];
                let (best_k, best) = s
                    .iter()
                    .copied()
                    .enumerate()
                    .fold((0, f32::MAX), |acc, (k, c)| if c < acc.1 { (k, c) } else { acc });
                let raw = cost[p * num_depths + best_k];
                if best / NUM_PATHS > self.config.max_cost || raw >= OUT_OF_VIEW_COST {
                    dd.depth_map.set(x, y, 0.0);
                    continue;
                }
                let second = s
                    .iter()
                    .enumerate()
                    .filter(|(k, _)| k.abs_diff(best_k) > 1)
                    .map(|(_, &c)| c)
                    .fold(f32::MAX, f32::min);

                let mut offset = 0.0f64;
                if best_k > 0 && best_k + 1 < num_depths {
                    let (a, b, c) = (s[best_k - 1], s[best_k], s[best_k + 1]);
                    let denom = a - 2.0 * b + c;
                    if denom > f32::EPSILON {
                        offset = f64::from(0.5 * (a - c) / denom).clamp(-0.5, 0.5);
                    }
                }
                let depth = (1.0 / inv_depth(best_k as f64 + offset)) as f32;
                dd.depth_map.set(x, y, depth);
                let uniqueness = if second < f32::MAX && second > 0.0 { 1.0 - best / second } else { 1.0 };
                conf.set(x, y, uniqueness.clamp(0.0, 1.0));
            }
        }
        dd.confidence_map = Some(conf);
        dd.normal_map = None;

        debug!(
            "[SweepMatcher] {} vs {}: {} planes, {} valid pixels",
            dd.image_id,
            partner.image_id,
            num_depths,
            dd.valid_count()
        );
        Ok(())
    }
}
