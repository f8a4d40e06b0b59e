//! Per-image depth record driven through select, init, estimate and filter.

use anyhow::Result;

use crate::config::FusionMode;
use crate::geometry::ViewGeometry;
use crate::scene::ImageId;

use super::grid::{ConfidenceMap, DepthMap, Grid, NormalMap};

/// A ranked stereo partner of an image.
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborView {
    pub image_id: ImageId,
    /// Index of the neighbor in the working set.
    pub local_index: usize,
    pub score: f64,
    /// Mean triangulation angle over the shared sparse points, in degrees.
    pub angle_deg: f64,
    pub shared_points: usize,
}

/// How far an image has progressed through the per-image pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DepthStage {
    Created,
    ViewsSelected,
    Initialized,
    Estimated,
    Filtered,
}

/// Depth, normal and confidence maps of one working-set image.
#[derive(Debug, Clone)]
pub struct DepthData {
    pub image_id: ImageId,
    pub local_index: usize,
    /// Reference view at working resolution; the maps have its size.
    pub view: ViewGeometry,
    /// Ranked candidate neighbors after per-image selection.
    pub neighbors: Vec<NeighborView>,
    /// Neighbors used by estimation and filtering.
    pub active: Vec<NeighborView>,
    pub depth_map: DepthMap,
    pub normal_map: Option<NormalMap>,
    pub confidence_map: Option<ConfidenceMap>,
    /// Depth bounds derived from the sparse seeds.
    pub depth_range: Option<(f32, f32)>,
    pub mode: FusionMode,
    pub stage: DepthStage,
}

impl DepthData {
    /// Create a record with an all-invalid depth map of the view's size.
    pub fn new(image_id: ImageId, local_index: usize, view: ViewGeometry, mode: FusionMode) -> Result<Self> {
        let depth_map = Grid::try_new(view.camera.width, view.camera.height, 0.0f32)?;
        Ok(Self {
            image_id,
            local_index,
            view,
            neighbors: Vec::new(),
            active: Vec::new(),
            depth_map,
            normal_map: None,
            confidence_map: None,
            depth_range: None,
            mode,
            stage: DepthStage::Created,
        })
    }

    pub fn width(&self) -> u32 {
        self.depth_map.width()
    }

    pub fn height(&self) -> u32 {
        self.depth_map.height()
    }

    #[inline]
    pub fn depth(&self, x: u32, y: u32) -> f32 {
        *self.depth_map.get(x, y)
    }

    /// Confidence of a pixel; a map without confidence trusts every valid pixel equally.
    #[inline]
    pub fn confidence(&self, x: u32, y: u32) -> f32 {
        if !self.depth_map.is_valid(x, y) {
            return 0.0;
        }
        self.confidence_map
            .as_ref()
            .map_or(1.0, |c| *c.get(x, y))
    }

    /// Invalidate one pixel in every map.
    pub fn invalidate(&mut self, x: u32, y: u32) {
        self.depth_map.set(x, y, 0.0);
        if let Some(c) = self.confidence_map.as_mut() {
            c.set(x, y, 0.0);
        }
        if let Some(n) = self.normal_map.as_mut() {
            n.set(x, y, nalgebra::Vector3::zeros());
        }
    }

    pub fn active_indices(&self) -> Vec<usize> {
        self.active.iter().map(|n| n.local_index).collect()
    }

    pub fn valid_count(&self) -> usize {
        self.depth_map.count_valid()
    }

    /// Drop the maps once they are no longer needed.
    pub fn release(&mut self) {
        self.depth_map = Grid::empty();
        self.normal_map = None;
        self.confidence_map = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{CameraModel, SE3};

    fn data() -> DepthData {
        let view = ViewGeometry::new(CameraModel::new(10.0, 10.0, 2.0, 2.0, 5, 4), SE3::identity());
        DepthData::new(ImageId(3), 0, view, FusionMode::PerPixel).unwrap()
    }

    #[test]
    fn test_new_matches_view_size() {
        let dd = data();
        assert_eq!((dd.width(), dd.height()), (5, 4));
        assert_eq!(dd.valid_count(), 0);
        assert_eq!(dd.stage, DepthStage::Created);
    }

    #[test]
    fn test_confidence_defaults() {
        let mut dd = data();
        dd.depth_map.set(1, 1, 2.0);
        assert_eq!(dd.confidence(1, 1), 1.0);
        assert_eq!(dd.confidence(0, 0), 0.0);

        dd.confidence_map = Some(Grid::try_new(5, 4, 0.25).unwrap());
        assert_eq!(dd.confidence(1, 1), 0.25);

        dd.invalidate(1, 1);
        assert_eq!(dd.depth(1, 1), 0.0);
        assert_eq!(dd.confidence(1, 1), 0.0);
    }

    #[test]
    fn test_release() {
        let mut dd = data();
        dd.release();
        assert!(dd.depth_map.is_empty());
    }
}
