//! Multi-view fusion of filtered depth maps into one point cloud.
//!
//! Images are visited in working-set order. Every valid pixel not yet
//! consumed is back-projected and checked against the depth maps of the
//! image's neighbors: an observation agrees when the neighbor's depth at the
//! reprojection matches within `depth_tolerance` and the neighbor's 3D point
//! reprojects back within `reprojection_tolerance_px` of the source pixel.
//! Agreeing observations are merged into one point and all their pixels are
//! consumed, so a surface point seen by many images is emitted once.

use anyhow::Result;
use nalgebra::Vector3;
use tracing::{debug, info};

use crate::config::FusionConfig;
use crate::point_cloud::{FusedPoint, PointCloud};
use crate::scene::ImageData;

use super::depth_data::DepthData;
use super::grid::Grid;

/// A finalized depth map and its working-resolution pixels.
#[derive(Clone, Copy)]
pub struct FusionInput<'a> {
    pub depth: &'a DepthData,
    pub pixels: Option<&'a ImageData>,
}

/// One pixel that contributes to a fused point.
struct Observation {
    input: usize,
    x: u32,
    y: u32,
    position: Vector3<f64>,
    weight: f64,
}

/// Fuse `inputs` (indexed by local image index, `None` for images that did
/// not finalize).
///
/// Returns an empty cloud when fewer than `min_images` inputs are present,
/// and `None` if `should_abort` fires before fusion completes.
pub fn fuse_depth_maps(
    inputs: &[Option<FusionInput<'_>>],
    config: &FusionConfig,
    estimate_color: bool,
    estimate_normal: bool,
    should_abort: &dyn Fn() -> bool,
) -> Result<Option<PointCloud>> {
    let finalized = inputs.iter().flatten().count();
    if finalized < config.min_images {
        info!(
            "[Fusion] {} finalized depth maps, {} required; returning an empty cloud",
            finalized, config.min_images
        );
        return Ok(Some(PointCloud::default()));
    }

    let mut consumed: Vec<Option<Grid<bool>>> = Vec::with_capacity(inputs.len());
    for input in inputs {
        consumed.push(match input {
            Some(i) => Some(Grid::try_new(i.depth.width(), i.depth.height(), false)?),
            None => None,
        });
    }

    let mut cloud = PointCloud::default();
    let mut observations: Vec<Observation> = Vec::new();
    for (ri, input) in inputs.iter().enumerate() {
        let Some(reference) = input else {
            continue;
        };
        let dd = reference.depth;
        let before = cloud.len();
        for y in 0..dd.height() {
            if should_abort() {
                return Ok(None);
            }
            for x in 0..dd.width() {
                let d = dd.depth(x, y);
                if d <= 0.0 || is_consumed(&consumed, ri, x, y) {
                    continue;
                }
                let p = dd.view.backproject(f64::from(x), f64::from(y), f64::from(d));
                observations.clear();
                observations.push(Observation {
                    input: ri,
                    x,
                    y,
                    position: p,
                    weight: f64::from(dd.confidence(x, y).max(1e-3)),
                });
                collect_agreeing(inputs, &consumed, ri, x, y, &p, config, &mut observations);
                if observations.len() < config.min_views {
                    continue;
                }

                for o in &observations {
                    if let Some(mask) = consumed[o.input].as_mut() {
                        mask.set(o.x, o.y, true);
                    }
                }
                let total: f64 = observations.iter().map(|o| o.weight).sum();
                let position = observations
                    .iter()
                    .fold(Vector3::zeros(), |acc, o| acc + o.position * o.weight)
                    / total;
                cloud.points.push(FusedPoint {
                    position,
                    views: observations
                        .iter()
                        .filter_map(|o| inputs[o.input].map(|i| i.depth.image_id))
                        .collect(),
                    weight: total as f32,
                    color: if estimate_color { average_color(inputs, &observations) } else { None },
                    normal: if estimate_normal { estimate_point_normal(dd, x, y) } else { None },
                });
            }
        }
        debug!("[Fusion] {}: {} points", dd.image_id, cloud.len() - before);
    }

    info!("[Fusion] fused {} depth maps into {} points", finalized, cloud.len());
    Ok(Some(cloud))
}

fn is_consumed(consumed: &[Option<Grid<bool>>], input: usize, x: u32, y: u32) -> bool {
    consumed
        .get(input)
        .and_then(Option::as_ref)
        .map_or(true, |m| *m.get(x, y))
}

#[allow(clippy::too_many_arguments)]
fn collect_agreeing(
    inputs: &[Option<FusionInput<'_>>],
    consumed: &[Option<Grid<bool>>],
    ri: usize,
    x: u32,
    y: u32,
    p: &Vector3<f64>,
    config: &FusionConfig,
    out: &mut Vec<Observation>,
) {
    let Some(reference) = inputs[ri] else {
        return;
    };
    let ref_dd = reference.depth;
    for nb in &ref_dd.neighbors {
        let Some(Some(other)) = inputs.get(nb.local_index) else {
            continue;
        };
        let od = other.depth;
        if od.depth_map.is_empty() {
            continue;
        }
        let Some((nx, ny, z)) = od.view.project_to_pixel(p) else {
            continue;
        };
        if is_consumed(consumed, nb.local_index, nx, ny) {
            continue;
        }
        let nd = f64::from(od.depth(nx, ny));
        if nd <= 0.0 || (nd - z).abs() > config.depth_tolerance * z {
            continue;
        }
        let q = od.view.backproject(f64::from(nx), f64::from(ny), nd);
        let Some((u, v, _)) = ref_dd.view.project_world(&q) else {
            continue;
        };
        let err = ((u - f64::from(x)).powi(2) + (v - f64::from(y)).powi(2)).sqrt();
        if err > config.reprojection_tolerance_px {
            continue;
        }
        out.push(Observation {
            input: nb.local_index,
            x: nx,
            y: ny,
            position: q,
            weight: f64::from(od.confidence(nx, ny).max(1e-3)),
        });
    }
}

fn average_color(inputs: &[Option<FusionInput<'_>>], observations: &[Observation]) -> Option<[u8; 3]> {
    let mut acc = [0u32; 3];
    let mut n = 0u32;
    for o in observations {
        let Some(Some(input)) = inputs.get(o.input) else {
            continue;
        };
        let Some(c) = input.pixels.and_then(|px| px.rgb_at(o.x, o.y)) else {
            continue;
        };
        for k in 0..3 {
            acc[k] += u32::from(c[k]);
        }
        n += 1;
    }
    (n > 0).then(|| [(acc[0] / n) as u8, (acc[1] / n) as u8, (acc[2] / n) as u8])
}

/// World-space normal at (x, y): the stored normal when present, otherwise
/// the cross product of the local depth-map tangents. Faces the camera.
fn estimate_point_normal(dd: &DepthData, x: u32, y: u32) -> Option<Vector3<f64>> {
    if let Some(normals) = dd.normal_map.as_ref() {
        let n = normals.get(x, y);
        if n.norm() > f32::EPSILON {
            let n_cam = Vector3::new(f64::from(n.x), f64::from(n.y), f64::from(n.z)).normalize();
            return Some(dd.view.pose_wc.transform_vector(&n_cam));
        }
    }

    let at = |px: u32, py: u32| -> Option<Vector3<f64>> {
        let d = dd.depth(px, py);
        (d > 0.0).then(|| dd.view.backproject(f64::from(px), f64::from(py), f64::from(d)))
    };
    let center = at(x, y)?;
    let horizontal = if x + 1 < dd.width() { at(x + 1, y).map(|p| p - center) } else { None }
        .or_else(|| x.checked_sub(1).and_then(|lx| at(lx, y)).map(|p| center - p))?;
    let vertical = if y + 1 < dd.height() { at(x, y + 1).map(|p| p - center) } else { None }
        .or_else(|| y.checked_sub(1).and_then(|uy| at(x, uy)).map(|p| center - p))?;

    let n = horizontal.cross(&vertical);
    let norm = n.norm();
    if norm <= f64::EPSILON {
        return None;
    }
    let mut n = n / norm;
    if n.dot(&(dd.view.center() - center)) < 0.0 {
        n = -n;
    }
    Some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FusionMode;
    use crate::depth::NeighborView;
    use crate::geometry::{CameraModel, ViewGeometry, SE3};
    use crate::scene::ImageId;
    use approx::assert_relative_eq;

    const N: usize = 4;

    fn view_at(x: f64) -> ViewGeometry {
        ViewGeometry::new(
            CameraModel::new(100.0, 100.0, 32.0, 32.0, 64, 64),
            SE3::from_quaternion(1.0, 0.0, 0.0, 0.0, Vector3::new(x, 0.0, 0.0)),
        )
    }

    /// N records whose neighbors are all the other records.
    fn records(depth_of: impl Fn(usize, &ViewGeometry, &mut DepthData)) -> Vec<DepthData> {
        (0..N)
            .map(|i| {
                let view = view_at(i as f64 * 0.5);
                let mut dd = DepthData::new(ImageId(i as u32), i, view.clone(), FusionMode::PerPixel).unwrap();
                dd.neighbors = (0..N)
                    .filter(|&j| j != i)
                    .map(|j| NeighborView {
                        image_id: ImageId(j as u32),
                        local_index: j,
                        score: 1.0,
                        angle_deg: 5.0,
                        shared_points: 10,
                    })
                    .collect();
                depth_of(i, &view, &mut dd);
                dd
            })
            .collect()
    }

    fn inputs<'a>(records: &'a [DepthData], pixels: Option<&'a ImageData>) -> Vec<Option<FusionInput<'a>>> {
        records
            .iter()
            .map(|dd| Some(FusionInput { depth: dd, pixels }))
            .collect()
    }

    #[test]
    fn test_single_surface_point_emitted_once() {
        // The point (0.75, 0, 5) lands on exact pixel centers in every image.
        let point = Vector3::new(0.75, 0.0, 5.0);
        let recs = records(|_, view, dd| {
            let (x, y, z) = view.project_to_pixel(&point).unwrap();
            dd.depth_map.set(x, y, z as f32);
        });
        let cloud = fuse_depth_maps(&inputs(&recs, None), &FusionConfig::default(), false, false, &|| false)
            .unwrap()
            .unwrap();

        assert_eq!(cloud.len(), 1);
        assert_eq!(cloud.points[0].views.len(), N);
        assert_relative_eq!(cloud.points[0].position, point, epsilon = 1e-9);
    }

    #[test]
    fn test_plane_fusion_has_no_duplicates() {
        let recs = records(|_, _, dd| dd.depth_map.fill(5.0));
        let cloud = fuse_depth_maps(&inputs(&recs, None), &FusionConfig::default(), false, true, &|| false)
            .unwrap()
            .unwrap();

        assert!(!cloud.is_empty());
        assert!(cloud.has_normals());
        // Every point is at least two views, and all lie on the plane.
        for p in &cloud.points {
            assert!(p.views.len() >= 2);
            assert_relative_eq!(p.position.z, 5.0, epsilon = 1e-9);
            assert_relative_eq!(p.normal.unwrap().z.abs(), 1.0, epsilon = 1e-9);
        }
        // No two points share a position.
        let mut keys: Vec<(i64, i64)> = cloud
            .points
            .iter()
            .map(|p| ((p.position.x * 1e6).round() as i64, (p.position.y * 1e6).round() as i64))
            .collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), cloud.len());
    }

    #[test]
    fn test_color_is_optional() {
        let recs = records(|_, _, dd| dd.depth_map.fill(5.0));
        let gray = ImageData::from_gray(64, 64, vec![0.5; 64 * 64]).unwrap();
        let cloud = fuse_depth_maps(&inputs(&recs, Some(&gray)), &FusionConfig::default(), true, false, &|| false)
            .unwrap()
            .unwrap();
        assert!(!cloud.is_empty());
        assert!(cloud.points.iter().all(|p| p.color.is_none()));

        let rgb = ImageData::from_rgb(64, 64, vec![[10, 20, 30]; 64 * 64]).unwrap();
        let cloud = fuse_depth_maps(&inputs(&recs, Some(&rgb)), &FusionConfig::default(), true, false, &|| false)
            .unwrap()
            .unwrap();
        assert!(cloud.points.iter().all(|p| p.color == Some([10, 20, 30])));
    }

    #[test]
    fn test_too_few_images_gives_empty_cloud() {
        let recs = records(|_, _, dd| dd.depth_map.fill(5.0));
        let mut ins = inputs(&recs, None);
        for slot in ins.iter_mut().skip(1) {
            *slot = None;
        }
        let cloud = fuse_depth_maps(&ins, &FusionConfig::default(), false, false, &|| false)
            .unwrap()
            .unwrap();
        assert!(cloud.is_empty());
    }

    #[test]
    fn test_abort_discards_output() {
        let recs = records(|_, _, dd| dd.depth_map.fill(5.0));
        let result = fuse_depth_maps(&inputs(&recs, None), &FusionConfig::default(), false, false, &|| true).unwrap();
        assert!(result.is_none());
    }
}
