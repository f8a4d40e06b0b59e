//! Depth estimators driven by the depth-map engine.
//!
//! Both fusion modes implement [`DepthEstimator`]; the run builds one
//! instance up front and shares it across all workers.

pub mod patch;
pub mod sweep;

use anyhow::Result;

use crate::config::{DensifyConfig, FusionMode};
use crate::depth::DepthData;
use crate::geometry::ViewGeometry;
use crate::scene::{ImageData, ImageId};

pub use patch::PatchEstimator;
pub use sweep::SweepMatcher;

/// An active neighbor as seen by an estimator, at working resolution.
pub struct NeighborImage<'a> {
    pub image_id: ImageId,
    pub view: &'a ViewGeometry,
    pub pixels: Option<&'a ImageData>,
}

/// Everything an estimator may read besides the depth record itself.
pub struct EstimationContext<'a> {
    /// Reference pixels at working resolution.
    pub reference: Option<&'a ImageData>,
    /// Active neighbors in rank order.
    pub neighbors: Vec<NeighborImage<'a>>,
    /// Serpentine pixel order of the working grid.
    pub coords: &'a [(u32, u32)],
}

impl<'a> EstimationContext<'a> {
    /// Neighbors that carry pixel data.
    pub fn textured_neighbors(&self) -> Vec<(&'a ViewGeometry, &'a ImageData)> {
        self.neighbors
            .iter()
            .filter_map(|n| n.pixels.map(|p| (n.view, p)))
            .collect()
    }
}

/// Refines an initialized depth map in place.
///
/// Implementations may leave pixels invalid (`0.0`) where they cannot
/// estimate depth; errors are reserved for unusable input.
pub trait DepthEstimator: Send + Sync {
    fn name(&self) -> &'static str;

    fn estimate(&self, ctx: &EstimationContext<'_>, dd: &mut DepthData) -> Result<()>;
}

/// Build the estimator for the configured fusion mode.
pub fn build_estimator(config: &DensifyConfig) -> Box<dyn DepthEstimator> {
    match config.fusion_mode {
        FusionMode::PerPixel => Box::new(PatchEstimator::new(config.patch.clone())),
        FusionMode::Global => Box::new(SweepMatcher::new(config.sweep.clone())),
    }
}

/// Serpentine visiting order: even rows left to right, odd rows right to left.
pub fn zigzag_coords(width: u32, height: u32) -> Vec<(u32, u32)> {
    let mut coords = Vec::with_capacity(width as usize * height as usize);
    for y in 0..height {
        if y % 2 == 0 {
            coords.extend((0..width).map(|x| (x, y)));
        } else {
            coords.extend((0..width).rev().map(|x| (x, y)));
        }
    }
    coords
}

#[cfg(test)]
pub(crate) mod test_scene {
    //! Procedurally textured fronto-parallel plane seen by translated cameras.

    use nalgebra::Vector3;

    use crate::geometry::{CameraModel, ViewGeometry, SE3};
    use crate::scene::{ImageData, ImageId, Scene, SceneImage, SparsePoint};

    pub const PLANE_Z: f64 = 5.0;

    pub fn camera() -> CameraModel {
        CameraModel::new(100.0, 100.0, 32.0, 24.0, 64, 48)
    }

    pub fn view_at(x: f64) -> ViewGeometry {
        ViewGeometry::new(
            camera(),
            SE3::from_quaternion(1.0, 0.0, 0.0, 0.0, Vector3::new(x, 0.0, 0.0)),
        )
    }

    pub fn texture(x: f64, y: f64) -> f32 {
        let v = 0.5
            + 0.15 * (12.3 * x).sin()
            + 0.15 * (9.1 * y).sin()
            + 0.1 * (7.7 * (x + y)).sin() * (5.3 * (x - y)).cos();
        v as f32
    }

    /// Render the plane into `view`.
    pub fn render(view: &ViewGeometry) -> ImageData {
        let cam = view.camera;
        let mut gray = Vec::with_capacity((cam.width * cam.height) as usize);
        for y in 0..cam.height {
            for x in 0..cam.width {
                let p = view.backproject(f64::from(x), f64::from(y), PLANE_Z - view.center().z);
                gray.push(texture(p.x, p.y));
            }
        }
        ImageData::from_gray(cam.width, cam.height, gray).unwrap()
    }

    /// Textured cameras at `xs` and a 6x5 grid of sparse plane points seen by all of them.
    pub fn plane_scene(xs: &[f64]) -> Scene {
        let images = xs
            .iter()
            .enumerate()
            .map(|(i, &x)| {
                let view = view_at(x);
                SceneImage::new(ImageId(i as u32), view.camera, view.pose_wc.clone()).with_pixels(render(&view))
            })
            .collect();
        let ids: Vec<ImageId> = (0..xs.len() as u32).map(ImageId).collect();
        let lo = xs.iter().copied().fold(f64::MAX, f64::min);
        let hi = xs.iter().copied().fold(f64::MIN, f64::max);
        let mut points = Vec::new();
        for j in 0..5 {
            for i in 0..6 {
                let x = lo - 0.4 + (hi - lo + 0.8) * f64::from(i) / 5.0;
                let y = -0.9 + 0.45 * f64::from(j);
                points.push(SparsePoint::new(Vector3::new(x, y, PLANE_Z), ids.clone()));
            }
        }
        Scene::new(images, points).unwrap()
    }
}
