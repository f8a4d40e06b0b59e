//! Depth-map post-processing: speckle removal, gap filling and cross-view
//! consistency filtering.

use std::collections::VecDeque;

use anyhow::Result;
use nalgebra::Vector3;
use tracing::debug;

use crate::config::FilterConfig;

use super::depth_data::{DepthData, DepthStage};
use super::grid::Grid;

/// Counters reported by [`filter_depth_map`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FilterStats {
    pub checked: usize,
    pub invalidated: usize,
    pub adjusted: usize,
}

#[inline]
fn similar(a: f32, b: f32, tolerance: f64) -> bool {
    f64::from((a - b).abs()) <= tolerance * f64::from(a.min(b))
}

/// Invalidate connected segments smaller than `min_segment_size`.
///
/// Two 4-adjacent valid pixels belong to the same segment when their depths
/// differ by at most `segment_depth_tolerance` relative to the smaller one.
/// Returns the number of pixels invalidated.
pub fn remove_small_segments(dd: &mut DepthData, config: &FilterConfig) -> usize {
    let (w, h) = (dd.width(), dd.height());
    if config.min_segment_size <= 1 || w == 0 || h == 0 {
        return 0;
    }
    let mut visited = vec![false; dd.depth_map.len()];
    let mut queue = VecDeque::new();
    let mut segment: Vec<(u32, u32)> = Vec::new();
    let mut removed = 0;

    for y in 0..h {
        for x in 0..w {
            let start = dd.depth_map.index(x, y);
            if visited[start] || !dd.depth_map.is_valid(x, y) {
                continue;
            }
            visited[start] = true;
            segment.clear();
            queue.push_back((x, y));
            while let Some((cx, cy)) = queue.pop_front() {
                segment.push((cx, cy));
                let d = dd.depth(cx, cy);
                for (nx, ny) in dd.depth_map.neighbors4(cx, cy) {
                    let ni = dd.depth_map.index(nx, ny);
                    if visited[ni] {
                        continue;
                    }
                    let nd = dd.depth(nx, ny);
                    if nd > 0.0 && similar(d, nd, config.segment_depth_tolerance) {
                        visited[ni] = true;
                        queue.push_back((nx, ny));
                    }
                }
            }
            if segment.len() < config.min_segment_size {
                removed += segment.len();
                for &(sx, sy) in &segment {
                    dd.invalidate(sx, sy);
                }
            }
        }
    }
    if removed > 0 {
        debug!("[DepthFilter] {}: removed {} speckle pixels", dd.image_id, removed);
    }
    removed
}

/// Per-pixel accumulation of the fills proposed by the row and column passes.
struct GapFill {
    depth: Grid<f32>,
    count: Grid<u8>,
    confidence: Grid<f32>,
    normal: Option<Grid<Vector3<f32>>>,
}

impl GapFill {
    fn propose(&mut self, x: u32, y: u32, depth: f32, confidence: f32, normal: Option<Vector3<f32>>) {
        *self.depth.get_mut(x, y) += depth;
        *self.count.get_mut(x, y) += 1;
        let c = self.confidence.get_mut(x, y);
        *c = c.min(confidence);
        if let (Some(acc), Some(n)) = (self.normal.as_mut(), normal) {
            *acc.get_mut(x, y) += n;
        }
    }
}

/// Fill short runs of invalid pixels between agreeing valid borders.
///
/// Rows and columns are scanned independently on the unfilled map; a run of
/// at most `max_gap_size` invalid pixels whose two border depths agree within
/// `gap_depth_tolerance` is filled by linear interpolation. Pixels filled by
/// both passes take the mean. Returns the number of pixels filled.
pub fn gap_interpolation(dd: &mut DepthData, config: &FilterConfig) -> Result<usize> {
    let (w, h) = (dd.width(), dd.height());
    if config.max_gap_size == 0 || w == 0 || h == 0 {
        return Ok(0);
    }
    let mut fill = allocate_fill(dd)?;

    // Rows.
    for y in 0..h {
        scan_line(dd, config, &mut fill, w, |i| (i, y));
    }
    // Columns.
    for x in 0..w {
        scan_line(dd, config, &mut fill, h, |i| (x, i));
    }

    let mut filled = 0;
    for y in 0..h {
        for x in 0..w {
            let n = *fill.count.get(x, y);
            if n == 0 {
                continue;
            }
            filled += 1;
            dd.depth_map.set(x, y, *fill.depth.get(x, y) / f32::from(n));
            if let Some(conf) = dd.confidence_map.as_mut() {
                conf.set(x, y, *fill.confidence.get(x, y));
            }
            if let (Some(normals), Some(acc)) = (dd.normal_map.as_mut(), fill.normal.as_ref()) {
                let v = *acc.get(x, y);
                normals.set(x, y, if v.norm() > f32::EPSILON { v.normalize() } else { Vector3::zeros() });
            }
        }
    }
    if filled > 0 {
        debug!("[DepthFilter] {}: interpolated {} gap pixels", dd.image_id, filled);
    }
    Ok(filled)
}

fn allocate_fill(dd: &DepthData) -> Result<GapFill> {
    let (w, h) = (dd.width(), dd.height());
    Ok(GapFill {
        depth: Grid::try_new(w, h, 0.0)?,
        count: Grid::try_new(w, h, 0)?,
        confidence: Grid::try_new(w, h, 1.0)?,
        normal: match dd.normal_map {
            Some(_) => Some(Grid::try_new(w, h, Vector3::zeros())?),
            None => None,
        },
    })
}

/// Scan one line of `len` pixels addressed through `at`.
fn scan_line(dd: &DepthData, config: &FilterConfig, fill: &mut GapFill, len: u32, at: impl Fn(u32) -> (u32, u32)) {
    let mut last_valid: Option<u32> = None;
    for i in 0..len {
        let (x, y) = at(i);
        if !dd.depth_map.is_valid(x, y) {
            continue;
        }
        if let Some(prev) = last_valid {
            let gap = (i - prev - 1) as usize;
            if gap > 0 && gap <= config.max_gap_size {
                let (px, py) = at(prev);
                let (d0, d1) = (dd.depth(px, py), dd.depth(x, y));
                if similar(d0, d1, config.gap_depth_tolerance) {
                    let confidence = dd.confidence(px, py).min(dd.confidence(x, y));
                    let normals = dd
                        .normal_map
                        .as_ref()
                        .map(|n| (*n.get(px, py), *n.get(x, y)));
                    let span = (i - prev) as f32;
                    for j in prev + 1..i {
                        let t = (j - prev) as f32 / span;
                        let (gx, gy) = at(j);
                        let normal = normals.map(|(n0, n1)| n0 * (1.0 - t) + n1 * t);
                        fill.propose(gx, gy, d0 + (d1 - d0) * t, confidence, normal);
                    }
                }
            }
        }
        last_valid = Some(i);
    }
}

/// Depths (in the reference camera) and confidences of the neighbors
/// confirming pixel (x, y).
fn confirmations(dd: &DepthData, x: u32, y: u32, neighbors: &[&DepthData], tolerance: f64) -> Vec<(f32, f32)> {
    let d = dd.depth(x, y);
    let p = dd.view.backproject(f64::from(x), f64::from(y), f64::from(d));
    let mut out = Vec::new();
    for n in neighbors {
        if n.depth_map.is_empty() {
            continue;
        }
        let Some((nx, ny, z)) = n.view.project_to_pixel(&p) else {
            continue;
        };
        let nd = n.depth(nx, ny);
        if nd <= 0.0 || f64::from((nd - z as f32).abs()) > tolerance * z {
            continue;
        }
        // The neighbor's estimate expressed as a depth of the reference camera.
        let q = n.view.backproject(f64::from(nx), f64::from(ny), f64::from(nd));
        let z_ref = dd.view.pose_cw.transform_point(&q).z;
        if z_ref > 0.0 {
            out.push((z_ref as f32, n.confidence(nx, ny)));
        }
    }
    out
}

/// Cross-view consistency filter.
///
/// Every valid pixel is reprojected into each neighbor's depth map; a
/// neighbor confirms the pixel when its depth at the reprojection lies
/// within `consistency_tolerance` of the expected depth. Pixels with fewer
/// than `min_consistent_views` confirmations are invalidated. With `adjust`,
/// confirmed pixels move to the confidence-weighted mean of their own depth
/// and the confirming depths.
pub fn filter_depth_map(dd: &mut DepthData, neighbors: &[&DepthData], config: &FilterConfig, adjust: bool) -> FilterStats {
    let (w, h) = (dd.width(), dd.height());
    let mut stats = FilterStats::default();
    for y in 0..h {
        for x in 0..w {
            let d = dd.depth(x, y);
            if d <= 0.0 {
                continue;
            }
            stats.checked += 1;
            let confirming = confirmations(dd, x, y, neighbors, config.consistency_tolerance);
            if confirming.len() < config.min_consistent_views {
                dd.invalidate(x, y);
                stats.invalidated += 1;
                continue;
            }
            if adjust && !confirming.is_empty() {
                let own = dd.confidence(x, y).max(1e-3);
                let (mut num, mut den) = (d * own, own);
                for &(z, c) in &confirming {
                    let c = c.max(1e-3);
                    num += z * c;
                    den += c;
                }
                let adjusted = num / den;
                if adjusted.is_finite() && adjusted > 0.0 {
                    dd.depth_map.set(x, y, adjusted);
                    stats.adjusted += 1;
                }
            }
        }
    }
    dd.stage = DepthStage::Filtered;
    debug!(
        "[DepthFilter] {}: {} checked, {} invalidated, {} adjusted against {} neighbors",
        dd.image_id,
        stats.checked,
        stats.invalidated,
        stats.adjusted,
        neighbors.len()
    );
    stats
}
