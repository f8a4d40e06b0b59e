//! A posed camera: intrinsics at working resolution plus both pose directions.

use nalgebra::Vector3;

use super::{CameraModel, SE3};

/// Projection between world space and one image's pixel grid.
///
/// Depth is the camera-frame z coordinate, not the ray length.
#[derive(Debug, Clone)]
pub struct ViewGeometry {
    pub camera: CameraModel,
    /// Camera-to-world (T_wc).
    pub pose_wc: SE3,
    /// World-to-camera (T_cw).
    pub pose_cw: SE3,
}

impl ViewGeometry {
    pub fn new(camera: CameraModel, pose_wc: SE3) -> Self {
        let pose_cw = pose_wc.inverse();
        Self {
            camera,
            pose_wc,
            pose_cw,
        }
    }

    /// Camera center in world coordinates.
    pub fn center(&self) -> Vector3<f64> {
        self.pose_wc.translation
    }

    /// Viewing direction (camera +z) in world coordinates.
    pub fn optical_axis(&self) -> Vector3<f64> {
        self.pose_wc.transform_vector(&Vector3::z())
    }

    /// Project a world point to `(u, v, depth)`. None if behind the camera.
    pub fn project_world(&self, p_world: &Vector3<f64>) -> Option<(f64, f64, f64)> {
        let p_cam = self.pose_cw.transform_point(p_world);
        let uv = self.camera.project(&p_cam)?;
        Some((uv.x, uv.y, p_cam.z))
    }

    /// Project a world point and round to the containing pixel.
    pub fn project_to_pixel(&self, p_world: &Vector3<f64>) -> Option<(u32, u32, f64)> {
        let (u, v, z) = self.project_world(p_world)?;
        if !self.camera.contains(u, v) {
            return None;
        }
        let x = (u.round().max(0.0) as u32).min(self.camera.width - 1);
        let y = (v.round().max(0.0) as u32).min(self.camera.height - 1);
        Some((x, y, z))
    }

    /// World point seen at pixel (u, v) with the given depth.
    pub fn backproject(&self, u: f64, v: f64, depth: f64) -> Vector3<f64> {
        self.pose_wc
            .transform_point(&self.camera.unproject(u, v, depth))
    }

    /// Angle in degrees between the rays from both camera centers to `p_world`.
    pub fn triangulation_angle_deg(&self, other: &ViewGeometry, p_world: &Vector3<f64>) -> f64 {
        let a = self.center() - p_world;
        let b = other.center() - p_world;
        let denom = a.norm() * b.norm();
        if denom <= f64::EPSILON {
            return 0.0;
        }
        (a.dot(&b) / denom).clamp(-1.0, 1.0).acos().to_degrees()
    }
}
