//! Neighbor view selection.
//!
//! A candidate neighbor is scored against a reference image from the sparse
//! points both observe:
//!
//! ```text
//! score = w_dir * Σ_p w_angle(θ_p) * w_scale(p)
//! ```
//!
//! * `θ_p` is the triangulation angle at `p`. Points with `θ_p` outside
//!   `[min_angle, max_angle]` contribute nothing; inside, `w_angle` ramps up as
//!   `(θ/θ_opt)^1.5` and decays as `sqrt(θ_opt/θ)` past the optimum.
//! * `w_scale = min(s, 1/s)` where `s` is the ratio of the pixel footprints of
//!   `p` in both images.
//! * `w_dir = max(cos(angle between optical axes), 0)`.
//!
//! Candidates sharing fewer than `min_shared_points` points are dropped.
//! Ranking is by score descending, ties by ascending `ImageId`.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use anyhow::{bail, Result};
use tracing::debug;

use crate::config::ViewSelectionConfig;
use crate::geometry::ViewGeometry;
use crate::scene::{ImageId, Scene};

use super::depth_data::{DepthData, DepthStage, NeighborView};

/// Images selected for densification with their compact indices.
#[derive(Debug, Clone, Default)]
pub struct WorkingSet {
    /// Local index -> global id, ascending by id.
    pub images: Vec<ImageId>,
    /// Global id -> local index.
    pub images_map: HashMap<ImageId, usize>,
    /// Ranked candidate neighbors per local index, restricted to the working set.
    pub neighbors_map: Vec<Vec<NeighborView>>,
}

impl WorkingSet {
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Highest ranked partner of an image, used by pairwise matching.
    pub fn best_partner(&self, idx: usize) -> Option<&NeighborView> {
        self.neighbors_map.get(idx).and_then(|n| n.first())
    }
}

/// Score of one candidate against a reference image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewScore {
    pub score: f64,
    pub angle_deg: f64,
    pub shared_points: usize,
}

/// Score `candidate` as a stereo partner of `reference`. None if unusable.
pub fn score_view_pair(
    scene: &Scene,
    config: &ViewSelectionConfig,
    reference: ImageId,
    candidate: ImageId,
) -> Option<ViewScore> {
    if reference == candidate {
        return None;
    }
    let ref_img = scene.image(reference)?;
    let cand_img = scene.image(candidate)?;
    if !ref_img.camera.is_valid() || !cand_img.camera.is_valid() {
        return None;
    }

    let shared = intersect_sorted(scene.visible_points(reference), scene.visible_points(candidate));
    if shared.len() < config.min_shared_points.max(1) {
        return None;
    }

    let ref_view = ViewGeometry::new(ref_img.camera, ref_img.pose.clone());
    let cand_view = ViewGeometry::new(cand_img.camera, cand_img.pose.clone());
    let ref_focal = 0.5 * (ref_img.camera.fx + ref_img.camera.fy);
    let cand_focal = 0.5 * (cand_img.camera.fx + cand_img.camera.fy);

    let mut sum = 0.0;
    let mut angle_sum = 0.0;
    let mut counted = 0usize;
    for &pi in &shared {
        let p = &scene.points()[pi].position;
        let angle = ref_view.triangulation_angle_deg(&cand_view, p);
        if angle < config.min_angle_deg || angle > config.max_angle_deg {
            continue;
        }
        let w_angle = if angle <= config.optimal_angle_deg {
            (angle / config.optimal_angle_deg).powf(1.5)
        } else {
            (config.optimal_angle_deg / angle).sqrt()
        };

        let d_ref = (p - ref_view.center()).norm();
        let d_cand = (p - cand_view.center()).norm();
        if d_ref <= f64::EPSILON || d_cand <= f64::EPSILON {
            continue;
        }
        // Ratio of world-space pixel footprints.
        let s = (d_ref * cand_focal) / (d_cand * ref_focal);
        let w_scale = s.min(1.0 / s);

        sum += w_angle * w_scale;
        angle_sum += angle;
        counted += 1;
    }

    let w_dir = ref_view.optical_axis().dot(&cand_view.optical_axis()).max(0.0);
    let score = sum * w_dir;
    if counted == 0 || score <= 0.0 {
        return None;
    }
    Some(ViewScore {
        score,
        angle_deg: angle_sum / counted as f64,
        shared_points: shared.len(),
    })
}

/// Global selection: decide which images are densified and build the
/// initial neighbor map. None if no image qualifies.
pub fn select_views(scene: &Scene, config: &ViewSelectionConfig) -> Option<WorkingSet> {
    let mut ids: Vec<ImageId> = scene
        .images()
        .iter()
        .filter(|img| img.camera.is_valid())
        .filter(|img| scene.visible_points(img.id).len() >= config.min_image_points)
        .map(|img| img.id)
        .collect();
    ids.sort();

    // Candidate scores between every usable pair.
    let mut scored: HashMap<ImageId, Vec<(ImageId, ViewScore)>> = HashMap::new();
    for &reference in &ids {
        let candidates: Vec<(ImageId, ViewScore)> = ids
            .iter()
            .filter_map(|&c| score_view_pair(scene, config, reference, c).map(|s| (c, s)))
            .collect();
        scored.insert(reference, candidates);
    }

    // Dropping an image can starve its candidates, so prune to a fixed point.
    let mut images = ids;
    loop {
        let kept: HashSet<ImageId> = images.iter().copied().collect();
        let before = images.len();
        images.retain(|id| {
            let usable = scored
                .get(id)
                .map_or(0, |c| c.iter().filter(|(cand, _)| kept.contains(cand)).count());
            usable >= config.min_views
        });
        if images.len() == before {
            break;
        }
    }
    if images.is_empty() {
        debug!("[ViewSelection] no image has {} usable neighbors", config.min_views);
        return None;
    }

    let images_map: HashMap<ImageId, usize> = images.iter().enumerate().map(|(i, &id)| (id, i)).collect();
    let neighbors_map = images
        .iter()
        .map(|id| {
            let mut list: Vec<NeighborView> = scored
                .remove(id)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|(cand, s)| {
                    images_map.get(&cand).map(|&local_index| NeighborView {
                        image_id: cand,
                        local_index,
                        score: s.score,
                        angle_deg: s.angle_deg,
                        shared_points: s.shared_points,
                    })
                })
                .collect();
            rank_neighbors(&mut list);
            list
        })
        .collect();

    Some(WorkingSet {
        images,
        images_map,
        neighbors_map,
    })
}

/// Per-image selection: keep the best `max_views` candidates of the working
/// set's neighbor map. Fails when fewer than `min_views` remain.
pub fn select_neighbor_views(dd: &mut DepthData, working: &WorkingSet, config: &ViewSelectionConfig) -> Result<()> {
    let Some(candidates) = working.neighbors_map.get(dd.local_index) else {
        bail!("{} is not in the working set", dd.image_id);
    };

    let mut neighbors: Vec<NeighborView> = candidates
        .iter()
        .filter(|n| n.score > 0.0 && n.angle_deg >= config.min_angle_deg)
        .cloned()
        .collect();
    rank_neighbors(&mut neighbors);
    neighbors.truncate(config.max_views);

    if neighbors.len() < config.min_views {
        bail!(
            "{} has {} usable neighbors, {} required",
            dd.image_id,
            neighbors.len(),
            config.min_views
        );
    }

    debug!(
        "[ViewSelection] {} neighbors: {:?}",
        dd.image_id,
        neighbors.iter().map(|n| n.image_id.0).collect::<Vec<_>>()
    );
    dd.neighbors = neighbors;
    dd.active.clear();
    dd.stage = DepthStage::ViewsSelected;
    Ok(())
}

/// Activate `neighbors[idx_neighbor .. idx_neighbor + num_neighbors]`,
/// clamped to the available neighbors. False if nothing is active.
pub fn init_views(dd: &mut DepthData, idx_neighbor: usize, num_neighbors: usize) -> bool {
    let len = dd.neighbors.len();
    let start = idx_neighbor.min(len);
    let end = start.saturating_add(num_neighbors).min(len);
    dd.active = dd.neighbors[start..end].to_vec();
    !dd.active.is_empty()
}

fn rank_neighbors(list: &mut [NeighborView]) {
    list.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(a.image_id.cmp(&b.image_id))
    });
}

fn intersect_sorted(a: &[usize], b: &[usize]) -> Vec<usize> {
    let (mut i, mut j) = (0, 0);
    let mut out = Vec::new();
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            Ordering::Less => i += 1,
            Ordering::Greater => j += 1,
            Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FusionMode;
    use crate::geometry::{CameraModel, SE3};
    use crate::scene::{SceneImage, SparsePoint};
    use nalgebra::Vector3;

    fn camera() -> CameraModel {
        CameraModel::new(100.0, 100.0, 32.0, 24.0, 64, 48)
    }

    fn image_at(id: u32, x: f64) -> SceneImage {
        SceneImage::new(
            ImageId(id),
            camera(),
            SE3::from_quaternion(1.0, 0.0, 0.0, 0.0, Vector3::new(x, 0.0, 0.0)),
        )
    }

    /// Points on the plane z = 5 seen by all listed images.
    fn plane_points(n: usize, views: &[u32]) -> Vec<SparsePoint> {
        (0..n)
            .map(|i| {
                let x = (i % 10) as f64 * 0.2 - 1.0;
                let y = (i / 10) as f64 * 0.2 - 0.5;
                SparsePoint::new(Vector3::new(x, y, 5.0), views.iter().map(|&v| ImageId(v)).collect())
            })
            .collect()
    }

    fn line_scene(xs: &[f64]) -> Scene {
        let images: Vec<_> = xs.iter().enumerate().map(|(i, &x)| image_at(i as u32, x)).collect();
        let ids: Vec<u32> = (0..xs.len() as u32).collect();
        Scene::new(images, plane_points(50, &ids)).unwrap()
    }

    fn depth_data(ws: &WorkingSet, scene: &Scene, idx: usize) -> DepthData {
        let img = scene.image(ws.images[idx]).unwrap();
        DepthData::new(img.id, idx, ViewGeometry::new(img.camera, img.pose.clone()), FusionMode::PerPixel).unwrap()
    }

    #[test]
    fn test_three_views_select_each_other() {
        let scene = line_scene(&[0.0, 0.5, 1.0]);
        let config = ViewSelectionConfig::default();
        let ws = select_views(&scene, &config).unwrap();

        assert_eq!(ws.len(), 3);
        for idx in 0..3 {
            let mut dd = depth_data(&ws, &scene, idx);
            select_neighbor_views(&mut dd, &ws, &config).unwrap();
            assert_eq!(dd.neighbors.len(), 2);
            assert!(dd.neighbors.iter().all(|n| n.local_index != idx));
        }
    }

    #[test]
    fn test_neighbor_count_bounds_and_determinism() {
        let scene = line_scene(&[0.0, 0.4, 0.8, 1.2, 1.6, 2.0]);
        let config = ViewSelectionConfig {
            max_views: 3,
            ..Default::default()
        };

        let ws_a = select_views(&scene, &config).unwrap();
        let ws_b = select_views(&scene, &config).unwrap();
        for idx in 0..ws_a.len() {
            let mut a = depth_data(&ws_a, &scene, idx);
            let mut b = depth_data(&ws_b, &scene, idx);
            select_neighbor_views(&mut a, &ws_a, &config).unwrap();
            select_neighbor_views(&mut b, &ws_b, &config).unwrap();

            assert!(a.neighbors.len() >= config.min_views && a.neighbors.len() <= config.max_views);
            assert_eq!(a.neighbors, b.neighbors);
            assert!(a.neighbors.windows(2).all(|w| w[0].score >= w[1].score));
        }
    }

    #[test]
    fn test_ties_broken_by_lower_id() {
        // Images 0 and 2 sit symmetrically around image 1 and the points
        // lie on the mirror plane, so both scores are exactly equal.
        let images = vec![image_at(0, -0.5), image_at(1, 0.0), image_at(2, 0.5)];
        let points = (0..50)
            .map(|i| {
                SparsePoint::new(
                    Vector3::new(0.0, i as f64 * 0.05 - 1.25, 5.0),
                    vec![ImageId(0), ImageId(1), ImageId(2)],
                )
            })
            .collect();
        let scene = Scene::new(images, points).unwrap();
        let config = ViewSelectionConfig::default();
        let ws = select_views(&scene, &config).unwrap();

        let mut dd = depth_data(&ws, &scene, 1);
        select_neighbor_views(&mut dd, &ws, &config).unwrap();
        assert_eq!(dd.neighbors[0].image_id, ImageId(0));
        assert_eq!(dd.neighbors[1].image_id, ImageId(2));
    }

    #[test]
    fn test_pruning_cascades_through_chain() {
        // Image 0 only overlaps 1, so dropping 0 leaves 1 with a single candidate.
        let images = (0..5).map(|i| image_at(i, 0.5 * f64::from(i))).collect();
        let pairs = [(0, 1), (1, 2), (2, 3), (2, 4), (3, 4)];
        let mut points = Vec::new();
        for (k, &(a, b)) in pairs.iter().enumerate() {
            for i in 0..10 {
                let x = 0.25 * f64::from(a + b) + 0.05 * f64::from(i);
                let y = 0.1 * k as f64 - 0.25;
                points.push(SparsePoint::new(Vector3::new(x, y, 5.0), vec![ImageId(a), ImageId(b)]));
            }
        }
        let scene = Scene::new(images, points).unwrap();
        let config = ViewSelectionConfig::default();
        let ws = select_views(&scene, &config).unwrap();

        assert_eq!(ws.images, vec![ImageId(2), ImageId(3), ImageId(4)]);
        for idx in 0..ws.len() {
            assert!(ws.neighbors_map[idx].len() >= config.min_views);
            let mut dd = depth_data(&ws, &scene, idx);
            select_neighbor_views(&mut dd, &ws, &config).unwrap();
            assert!(dd.neighbors.len() >= config.min_views && dd.neighbors.len() <= config.max_views);
        }
    }

    #[test]
    fn test_isolated_image_has_no_working_set() {
        let scene = Scene::new(vec![image_at(0, 0.0)], plane_points(50, &[0])).unwrap();
        assert!(select_views(&scene, &ViewSelectionConfig::default()).is_none());
    }

    #[test]
    fn test_degenerate_baseline_scores_zero() {
        // Identical centers give zero triangulation angle.
        let scene = line_scene(&[0.0, 0.0]);
        let config = ViewSelectionConfig::default();
        assert!(score_view_pair(&scene, &config, ImageId(0), ImageId(1)).is_none());
        assert!(select_views(&scene, &config).is_none());
    }

    #[test]
    fn test_per_image_selection_requires_min_views() {
        let scene = line_scene(&[0.0, 0.5]);
        let config = ViewSelectionConfig {
            min_views: 1,
            ..Default::default()
        };
        let ws = select_views(&scene, &config).unwrap();
        let mut dd = depth_data(&ws, &scene, 0);

        let strict = ViewSelectionConfig::default();
        assert!(select_neighbor_views(&mut dd, &ws, &strict).is_err());
        assert!(select_neighbor_views(&mut dd, &ws, &config).is_ok());
    }

    #[test]
    fn test_init_views_clamps() {
        let scene = line_scene(&[0.0, 0.5, 1.0]);
        let config = ViewSelectionConfig::default();
        let ws = select_views(&scene, &config).unwrap();
        let mut dd = depth_data(&ws, &scene, 0);
        select_neighbor_views(&mut dd, &ws, &config).unwrap();

        assert!(init_views(&mut dd, 0, 10));
        assert_eq!(dd.active.len(), 2);
        assert!(init_views(&mut dd, 1, 1));
        assert_eq!(dd.active[0], dd.neighbors[1]);
        assert!(!init_views(&mut dd, 5, 2));
        assert!(dd.active.is_empty());
    }
}
