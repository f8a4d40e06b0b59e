//! Depth-map engine shared by the workers of one densification run.
//!
//! Holds one record per working-set image behind its own lock, so workers
//! touching different images never contend. Estimated maps are published as
//! immutable snapshots that neighbors filter against while the owner is
//! being filtered itself.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use anyhow::{ensure, Context, Result};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::{DensifyConfig, FusionMode};
use crate::geometry::ViewGeometry;
use crate::matching::{build_estimator, zigzag_coords, DepthEstimator, EstimationContext, NeighborImage};
use crate::point_cloud::PointCloud;
use crate::scene::{ImageData, ImageId, Scene};

use super::depth_data::{DepthData, DepthStage};
use super::filter::{self, FilterStats};
use super::fusion::{fuse_depth_maps, FusionInput};
use super::view_selection::{init_views, select_neighbor_views, WorkingSet};
use super::{estimate, init};

/// Serpentine pixel orders keyed by grid size.
type CoordsCache = HashMap<(u32, u32), Arc<Vec<(u32, u32)>>>;

pub struct DepthMapsData<'a> {
    scene: &'a Scene,
    config: &'a DensifyConfig,
    working: WorkingSet,
    /// Working-resolution views by local index.
    views: Vec<ViewGeometry>,
    /// Working-resolution pixels, loaded on first use.
    pixels: Vec<OnceLock<Option<Arc<ImageData>>>>,
    records: Vec<RwLock<Option<DepthData>>>,
    snapshots: Vec<RwLock<Option<Arc<DepthData>>>>,
    coords: Mutex<CoordsCache>,
    estimator: Box<dyn DepthEstimator>,
}

impl<'a> DepthMapsData<'a> {
    pub fn new(scene: &'a Scene, config: &'a DensifyConfig, working: WorkingSet) -> Result<Self> {
        let mut views = Vec::with_capacity(working.len());
        for &id in &working.images {
            let image = scene
                .image(id)
                .with_context(|| format!("{} is not part of the scene", id))?;
            views.push(ViewGeometry::new(
                image.camera.scaled(config.resolution_level),
                image.pose.clone(),
            ));
        }
        let n = working.len();
        let estimator = build_estimator(config);
        debug!("[DepthMaps] {} images, estimator '{}'", n, estimator.name());
        Ok(Self {
            scene,
            config,
            working,
            views,
            pixels: (0..n).map(|_| OnceLock::new()).collect(),
            records: (0..n).map(|_| RwLock::new(None)).collect(),
            snapshots: (0..n).map(|_| RwLock::new(None)).collect(),
            coords: Mutex::new(HashMap::new()),
            estimator,
        })
    }

    pub fn working_set(&self) -> &WorkingSet {
        &self.working
    }

    pub fn len(&self) -> usize {
        self.working.len()
    }

    pub fn is_empty(&self) -> bool {
        self.working.is_empty()
    }

    pub fn image_id(&self, idx: usize) -> Option<ImageId> {
        self.working.images.get(idx).copied()
    }

    pub fn stage(&self, idx: usize) -> Option<DepthStage> {
        self.records.get(idx)?.read().as_ref().map(|dd| dd.stage)
    }

    /// Local indices of the active neighbors of an image.
    pub fn active_neighbors(&self, idx: usize) -> Vec<usize> {
        self.records
            .get(idx)
            .and_then(|r| r.read().as_ref().map(DepthData::active_indices))
            .unwrap_or_default()
    }

    /// Serpentine visiting order for a grid size, built once per size.
    pub fn coords(&self, width: u32, height: u32) -> Arc<Vec<(u32, u32)>> {
        let mut cache = self.coords.lock();
        Arc::clone(
            cache
                .entry((width, height))
                .or_insert_with(|| Arc::new(zigzag_coords(width, height))),
        )
    }

    fn pixels(&self, idx: usize) -> Option<&ImageData> {
        self.pixels
            .get(idx)?
            .get_or_init(|| self.load_pixels(idx))
            .as_deref()
    }

    fn load_pixels(&self, idx: usize) -> Option<Arc<ImageData>> {
        let id = self.image_id(idx)?;
        let source = self.scene.image(id)?.pixels.as_ref()?;
        let level = self.config.resolution_level;
        let img = if level == 0 {
            Arc::clone(source)
        } else {
            Arc::new(source.downscaled(level))
        };
        let cam = &self.views[idx].camera;
        if img.width != cam.width || img.height != cam.height {
            warn!(
                "[DepthMaps] {}: pixels are {}x{} but the working grid is {}x{}, ignoring them",
                id, img.width, img.height, cam.width, cam.height
            );
            return None;
        }
        Some(img)
    }

    fn with_record<T>(&self, idx: usize, f: impl FnOnce(&mut DepthData) -> Result<T>) -> Result<T> {
        let slot = self
            .records
            .get(idx)
            .with_context(|| format!("local index {} is outside the working set", idx))?;
        let mut guard = slot.write();
        let dd = guard
            .as_mut()
            .with_context(|| format!("image #{} has no depth record", idx))?;
        f(dd)
    }

    /// Create the record of an image, rank its neighbors and activate all of them.
    pub fn select_views(&self, idx: usize) -> Result<()> {
        let id = self
            .image_id(idx)
            .with_context(|| format!("local index {} is outside the working set", idx))?;
        let mut dd = DepthData::new(id, idx, self.views[idx].clone(), self.config.fusion_mode)?;
        select_neighbor_views(&mut dd, &self.working, &self.config.views)?;
        let count = dd.neighbors.len();
        ensure!(init_views(&mut dd, 0, count), "{} has no neighbor to activate", id);
        *self.records[idx].write() = Some(dd);
        Ok(())
    }

    pub fn init_depth_map(&self, idx: usize) -> Result<()> {
        self.with_record(idx, |dd| init::init_depth_map(dd, self.scene, &self.config.init))
    }

    pub fn estimate_depth_map(&self, idx: usize) -> Result<()> {
        self.with_record(idx, |dd| {
            let coords = self.coords(dd.width(), dd.height());
            let neighbors = self.estimation_neighbors(dd);
            let ctx = EstimationContext {
                reference: self.pixels(idx),
                neighbors,
                coords: &coords,
            };
            estimate::estimate_depth_map(dd, &ctx, self.estimator.as_ref())
        })
    }

    /// Active neighbors handed to the estimator. In global mode the working
    /// set's best partner leads; the sweep matcher pairs with the first neighbor.
    fn estimation_neighbors(&self, dd: &DepthData) -> Vec<NeighborImage<'_>> {
        let mut neighbors: Vec<NeighborImage<'_>> = dd
            .active
            .iter()
            .map(|n| NeighborImage {
                image_id: n.image_id,
                view: &self.views[n.local_index],
                pixels: self.pixels(n.local_index),
            })
            .collect();
        if dd.mode == FusionMode::Global {
            if let Some(best) = self.working.best_partner(dd.local_index) {
                if let Some(pos) = neighbors.iter().position(|n| n.image_id == best.image_id) {
                    neighbors[..=pos].rotate_right(1);
                }
            }
        }
        neighbors
    }

    pub fn remove_small_segments(&self, idx: usize) -> Result<usize> {
        self.with_record(idx, |dd| Ok(filter::remove_small_segments(dd, &self.config.filter)))
    }

    pub fn gap_interpolation(&self, idx: usize) -> Result<usize> {
        self.with_record(idx, |dd| filter::gap_interpolation(dd, &self.config.filter))
    }

    /// Freeze the estimated map of an image for neighbor filtering.
    pub fn publish(&self, idx: usize) -> Result<()> {
        let snapshot = {
            let slot = self
                .records
                .get(idx)
                .with_context(|| format!("local index {} is outside the working set", idx))?;
            let guard = slot.read();
            let dd = guard
                .as_ref()
                .with_context(|| format!("image #{} has no depth record", idx))?;
            ensure!(
                dd.stage == DepthStage::Estimated,
                "{} is not estimated (stage {:?})",
                dd.image_id,
                dd.stage
            );
            Arc::new(dd.clone())
        };
        *self.snapshots[idx].write() = Some(snapshot);
        Ok(())
    }

    /// Cross-view filter of an image against the published maps of `idx_neighbors`.
    ///
    /// Neighbors without a published map (skipped images) are ignored.
    pub fn filter_depth_map(&self, idx: usize, idx_neighbors: &[usize], adjust: bool) -> Result<FilterStats> {
        let snapshots: Vec<Arc<DepthData>> = idx_neighbors
            .iter()
            .filter(|&&n| n != idx)
            .filter_map(|&n| self.snapshots.get(n).and_then(|s| s.read().clone()))
            .collect();
        let neighbors: Vec<&DepthData> = snapshots.iter().map(Arc::as_ref).collect();
        self.with_record(idx, |dd| {
            ensure!(
                dd.stage == DepthStage::Estimated,
                "{} is not estimated (stage {:?})",
                dd.image_id,
                dd.stage
            );
            if neighbors.len() < idx_neighbors.len() {
                debug!(
                    "[DepthMaps] {}: filtering against {} of {} neighbors",
                    dd.image_id,
                    neighbors.len(),
                    idx_neighbors.len()
                );
            }
            Ok(filter::filter_depth_map(dd, &neighbors, &self.config.filter, adjust))
        })
    }

    /// Drop the record of an image that will not be fused.
    ///
    /// A published snapshot stays until its readers release it.
    pub fn discard(&self, idx: usize) {
        if let Some(slot) = self.records.get(idx) {
            *slot.write() = None;
        }
    }

    /// Drop the published map of one image.
    pub fn release_snapshot(&self, idx: usize) {
        if let Some(slot) = self.snapshots.get(idx) {
            *slot.write() = None;
        }
    }

    /// Number of published maps still held.
    pub fn snapshot_count(&self) -> usize {
        self.snapshots.iter().filter(|s| s.read().is_some()).count()
    }

    pub fn release_snapshots(&self) {
        for slot in &self.snapshots {
            *slot.write() = None;
        }
    }

    /// Fuse every filtered depth map. None if `should_abort` fired.
    pub fn fuse_depth_maps(
        &self,
        estimate_color: bool,
        estimate_normal: bool,
        should_abort: &dyn Fn() -> bool,
    ) -> Result<Option<PointCloud>> {
        let guards: Vec<_> = self.records.iter().map(|r| r.read()).collect();
        let inputs: Vec<Option<FusionInput<'_>>> = guards
            .iter()
            .enumerate()
            .map(|(idx, guard)| {
                guard
                    .as_ref()
                    .filter(|dd| dd.stage == DepthStage::Filtered)
                    .map(|dd| FusionInput {
                        depth: dd,
                        pixels: if estimate_color { self.pixels(idx) } else { None },
                    })
            })
            .collect();
        fuse_depth_maps(&inputs, &self.config.fusion, estimate_color, estimate_normal, should_abort)
    }

    /// Free the maps of every record once fusion no longer needs them.
    pub fn release_depth_maps(&self) {
        for slot in &self.records {
            if let Some(dd) = slot.write().as_mut() {
                dd.release();
            }
        }
    }

    /// Filtered depth maps in local-index order.
    pub fn into_depth_maps(self) -> Vec<DepthData> {
        self.records
            .into_iter()
            .filter_map(|record| record.into_inner())
            .filter(|dd| dd.stage == DepthStage::Filtered)
            .collect()
    }
}
