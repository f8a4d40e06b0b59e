//! Pinhole camera model.

use nalgebra::{Vector2, Vector3};

/// Pinhole intrinsics plus the image size they apply to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub width: u32,
    pub height: u32,
}

impl CameraModel {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            width,
            height,
        }
    }

    /// Focal lengths finite and positive, principal point finite, non-empty image.
    pub fn is_valid(&self) -> bool {
        self.fx.is_finite()
            && self.fy.is_finite()
            && self.fx > 0.0
            && self.fy > 0.0
            && self.cx.is_finite()
            && self.cy.is_finite()
            && self.width > 0
            && self.height > 0
    }

    /// Camera downscaled by `2^level`.
    ///
    /// Pixel centers are kept aligned: a pixel center `u` at full resolution
    /// maps to `(u + 0.5) / s - 0.5` at the scaled one.
    pub fn scaled(&self, level: u32) -> Self {
        if level == 0 {
            return *self;
        }
        let s = f64::from(1u32 << level.min(16));
        Self {
            fx: self.fx / s,
            fy: self.fy / s,
            cx: (self.cx + 0.5) / s - 0.5,
            cy: (self.cy + 0.5) / s - 0.5,
            width: (self.width >> level.min(31)).max(1),
            height: (self.height >> level.min(31)).max(1),
        }
    }

    /// Project a camera-frame point. Returns None behind the camera.
    pub fn project(&self, p: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p.z <= f64::EPSILON {
            return None;
        }
        Some(Vector2::new(
            self.fx * p.x / p.z + self.cx,
            self.fy * p.y / p.z + self.cy,
        ))
    }

    /// Back-project pixel (u, v) at depth z into the camera frame.
    pub fn unproject(&self, u: f64, v: f64, z: f64) -> Vector3<f64> {
        Vector3::new((u - self.cx) * z / self.fx, (v - self.cy) * z / self.fy, z)
    }

    /// True if (u, v) lies inside the image, with pixel centers at integer coordinates.
    pub fn contains(&self, u: f64, v: f64) -> bool {
        u >= -0.5 && v >= -0.5 && u < f64::from(self.width) - 0.5 && v < f64::from(self.height) - 0.5
    }
}
