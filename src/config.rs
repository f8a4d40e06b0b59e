//! Densification configuration.
//!
//! Every section has defaults, so a YAML file only needs the options it
//! changes:
//!
//! ```yaml
//! num_workers: 4
//! fusion_mode: global
//! views:
//!   max_views: 6
//! filter:
//!   min_consistent_views: 1
//! ```

use std::path::Path;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

/// Which depth estimator drives stage 2 for every image of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionMode {
    /// Local per-pixel photometric refinement over all active neighbors.
    #[default]
    PerPixel,
    /// Semi-global matching against the best stereo partner.
    Global,
}

/// Neighbor view selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ViewSelectionConfig {
    /// Maximum number of neighbors kept per image.
    pub max_views: usize,
    /// Minimum number of neighbors required to process an image.
    pub min_views: usize,
    /// Images observing fewer sparse points are not densified.
    pub min_image_points: usize,
    /// Candidate neighbors sharing fewer sparse points are ignored.
    pub min_shared_points: usize,
    /// Triangulation angles below this (degrees) carry no weight.
    pub min_angle_deg: f64,
    /// Angle at which the angle weight saturates.
    pub optimal_angle_deg: f64,
    /// Triangulation angles above this carry no weight.
    pub max_angle_deg: f64,
}

impl Default for ViewSelectionConfig {
    fn default() -> Self {
        Self {
            max_views: 8,
            min_views: 2,
            min_image_points: 10,
            min_shared_points: 3,
            min_angle_deg: 2.0,
            optimal_angle_deg: 10.0,
            max_angle_deg: 60.0,
        }
    }
}

/// Depth-map seeding from the sparse cloud.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InitConfig {
    /// Minimum number of sparse points projecting into the image.
    pub min_seed_points: usize,
    /// Maximum L1 distance (pixels) a seed depth is propagated.
    pub seed_fill_radius: u32,
    /// Relative margin added around the seed depth range.
    pub depth_range_margin: f64,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            min_seed_points: 3,
            seed_fill_radius: 16,
            depth_range_margin: 0.2,
        }
    }
}

/// Post-processing and cross-view filtering.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Connected segments with fewer pixels are removed.
    pub min_segment_size: usize,
    /// Relative depth step that still connects two adjacent pixels.
    pub segment_depth_tolerance: f64,
    /// Longest run of invalid pixels that gap interpolation fills.
    pub max_gap_size: usize,
    /// Relative depth difference allowed between the two gap borders.
    pub gap_depth_tolerance: f64,
    /// Relative depth difference for a neighbor to confirm a pixel.
    pub consistency_tolerance: f64,
    /// Minimum number of confirming neighbors to keep a pixel.
    pub min_consistent_views: usize,
    /// Move confirmed depths toward the confirming estimates.
    pub adjust: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_segment_size: 100,
            segment_depth_tolerance: 0.05,
            max_gap_size: 7,
            gap_depth_tolerance: 0.05,
            consistency_tolerance: 0.01,
            min_consistent_views: 2,
            adjust: true,
        }
    }
}

/// Multi-view fusion into the dense point cloud.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub estimate_colors: bool,
    pub estimate_normals: bool,
    /// Minimum number of agreeing images (reference included) to emit a point.
    pub min_views: usize,
    /// Maximum round-trip reprojection error in pixels.
    pub reprojection_tolerance_px: f64,
    /// Relative depth difference for two observations to agree.
    pub depth_tolerance: f64,
    /// Fusion returns an empty cloud when fewer images finalized.
    pub min_images: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            estimate_colors: true,
            estimate_normals: false,
            min_views: 2,
            reprojection_tolerance_px: 1.5,
            depth_tolerance: 0.01,
            min_images: 2,
        }
    }
}

/// Per-pixel patch-matching estimator.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PatchConfig {
    /// Half size of the square matching window.
    pub patch_radius: u32,
    /// Number of refinement sweeps over the image.
    pub iterations: usize,
    /// Initial relative perturbation of the depth hypotheses; halves every sweep.
    pub depth_perturbation: f64,
    /// Perturbed hypotheses tested per pixel and sweep.
    pub hypotheses: usize,
    /// Pixels whose best mean NCC stays below this become invalid.
    pub min_ncc: f64,
    /// Windows with lower intensity variance are treated as textureless.
    pub min_variance: f64,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            patch_radius: 3,
            iterations: 3,
            depth_perturbation: 0.1,
            hypotheses: 6,
            min_ncc: 0.5,
            min_variance: 1e-5,
        }
    }
}

/// Semi-global plane-sweep matcher.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Number of inverse-depth planes.
    pub num_depths: usize,
    /// Penalty for a one-plane change between adjacent pixels.
    pub p1: f32,
    /// Penalty for larger changes.
    pub p2: f32,
    /// Pixels whose aggregated best cost per path exceeds this become invalid.
    pub max_cost: f32,
    /// Upper bound on the cost volume allocation.
    pub max_cost_volume_bytes: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            num_depths: 64,
            p1: 0.03,
            p2: 0.25,
            max_cost: 0.35,
            max_cost_volume_bytes: 512 * 1024 * 1024,
        }
    }
}

/// Complete configuration of one densification run.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DensifyConfig {
    /// Worker threads; 0 uses the available parallelism.
    pub num_workers: usize,
    pub fusion_mode: FusionMode,
    /// Depth maps are computed at image size / 2^resolution_level.
    pub resolution_level: u32,
    /// Keep the filtered depth maps in the run result for export.
    pub retain_depth_maps: bool,
    pub views: ViewSelectionConfig,
    pub init: InitConfig,
    pub filter: FilterConfig,
    pub fusion: FusionConfig,
    pub patch: PatchConfig,
    pub sweep: SweepConfig,
}

impl DensifyConfig {
    /// Load from a YAML file. Missing keys take their defaults.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let v = &self.views;
        ensure!(v.min_views >= 1, "views.min_views must be at least 1");
        ensure!(
            v.max_views >= v.min_views,
            "views.max_views ({}) is below views.min_views ({})",
            v.max_views,
            v.min_views
        );
        ensure!(
            0.0 <= v.min_angle_deg
                && v.min_angle_deg < v.optimal_angle_deg
                && v.optimal_angle_deg <= v.max_angle_deg
                && v.max_angle_deg < 180.0,
            "view angles must satisfy 0 <= min < optimal <= max < 180"
        );
        ensure!(self.resolution_level < 8, "resolution_level must be below 8");

        let f = &self.filter;
        ensure!(
            f.consistency_tolerance > 0.0 && f.segment_depth_tolerance > 0.0 && f.gap_depth_tolerance > 0.0,
            "filter tolerances must be positive"
        );

        let fu = &self.fusion;
        ensure!(fu.min_views >= 1, "fusion.min_views must be at least 1");
        ensure!(
            fu.depth_tolerance > 0.0 && fu.reprojection_tolerance_px > 0.0,
            "fusion tolerances must be positive"
        );

        ensure!(self.patch.hypotheses > 0, "patch.hypotheses must be positive");
        ensure!(self.sweep.num_depths >= 2, "sweep.num_depths must be at least 2");
        ensure!(self.sweep.p2 >= self.sweep.p1, "sweep.p2 must not be below sweep.p1");
        Ok(())
    }

    /// Effective worker count.
    pub fn worker_count(&self) -> usize {
        if self.num_workers > 0 {
            return self.num_workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = DensifyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fusion_mode, FusionMode::PerPixel);
        assert_eq!(config.views.min_views, 2);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "num_workers: 3\nfusion_mode: global\nfilter:\n  min_segment_size: 20\n";
        let config = DensifyConfig::from_yaml_str(yaml).unwrap();

        assert_eq!(config.num_workers, 3);
        assert_eq!(config.worker_count(), 3);
        assert_eq!(config.fusion_mode, FusionMode::Global);
        assert_eq!(config.filter.min_segment_size, 20);
        assert_eq!(config.filter.max_gap_size, 7);
        assert_eq!(config.views.max_views, 8);
    }

    #[test]
    fn test_rejects_inconsistent_view_bounds() {
        let yaml = "views:\n  max_views: 1\n  min_views: 2\n";
        assert!(DensifyConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_worker_count_auto() {
        let config = DensifyConfig::default();
        assert!(config.worker_count() >= 1);
    }

    #[test]
    fn test_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("densify.yaml");
        std::fs::write(&path, "retain_depth_maps: true\n").unwrap();

        let config = DensifyConfig::from_yaml_file(&path).unwrap();
        assert!(config.retain_depth_maps);
        assert!(DensifyConfig::from_yaml_file(dir.path().join("missing.yaml")).is_err());
    }
}
