//! Posed images and their (optional) pixel buffers.

use std::sync::Arc;

use anyhow::{ensure, Result};

use crate::geometry::{CameraModel, SE3};

use super::ImageId;

/// Decoded, undistorted pixels of one image.
///
/// Intensities are stored as `f32` in `[0, 1]`, row-major.
#[derive(Debug, Clone)]
pub struct ImageData {
    pub width: u32,
    pub height: u32,
    pub gray: Vec<f32>,
    pub rgb: Option<Vec<[u8; 3]>>,
}

impl ImageData {
    pub fn from_gray(width: u32, height: u32, gray: Vec<f32>) -> Result<Self> {
        ensure!(
            gray.len() == width as usize * height as usize,
            "gray buffer has {} values, expected {}x{}",
            gray.len(),
            width,
            height
        );
        Ok(Self {
            width,
            height,
            gray,
            rgb: None,
        })
    }

    /// Build from RGB pixels; the gray channel is derived with Rec. 601 weights.
    pub fn from_rgb(width: u32, height: u32, rgb: Vec<[u8; 3]>) -> Result<Self> {
        ensure!(
            rgb.len() == width as usize * height as usize,
            "rgb buffer has {} pixels, expected {}x{}",
            rgb.len(),
            width,
            height
        );
        let gray = rgb
            .iter()
            .map(|c| {
                (0.299 * f32::from(c[0]) + 0.587 * f32::from(c[1]) + 0.114 * f32::from(c[2]))
                    / 255.0
            })
            .collect();
        Ok(Self {
            width,
            height,
            gray,
            rgb: Some(rgb),
        })
    }

    #[inline]
    pub fn gray_at(&self, x: u32, y: u32) -> f32 {
        self.gray[y as usize * self.width as usize + x as usize]
    }

    pub fn rgb_at(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.rgb
            .as_ref()
            .map(|rgb| rgb[y as usize * self.width as usize + x as usize])
    }

    /// Bilinear intensity lookup. None outside the sampling domain.
    pub fn sample(&self, u: f64, v: f64) -> Option<f32> {
        if !(u >= 0.0 && v >= 0.0) {
            return None;
        }
        let x0 = u.floor() as u32;
        let y0 = v.floor() as u32;
        if x0 + 1 >= self.width || y0 + 1 >= self.height {
            return None;
        }
        let fx = (u - f64::from(x0)) as f32;
        let fy = (v - f64::from(y0)) as f32;
        let top = self.gray_at(x0, y0) * (1.0 - fx) + self.gray_at(x0 + 1, y0) * fx;
        let bottom = self.gray_at(x0, y0 + 1) * (1.0 - fx) + self.gray_at(x0 + 1, y0 + 1) * fx;
        Some(top * (1.0 - fy) + bottom * fy)
    }

    /// 2x2 box-filter pyramid level `level`.
    pub fn downscaled(&self, level: u32) -> Self {
        let mut img = self.clone();
        for _ in 0..level {
            if img.width < 2 || img.height < 2 {
                break;
            }
            img = img.half();
        }
        img
    }

    fn half(&self) -> Self {
        let w = self.width / 2;
        let h = self.height / 2;
        let mut gray = Vec::with_capacity(w as usize * h as usize);
        let mut rgb = self.rgb.as_ref().map(|_| Vec::with_capacity(w as usize * h as usize));
        for y in 0..h {
            for x in 0..w {
                let (sx, sy) = (2 * x, 2 * y);
                let g = self.gray_at(sx, sy)
                    + self.gray_at(sx + 1, sy)
                    + self.gray_at(sx, sy + 1)
                    + self.gray_at(sx + 1, sy + 1);
                gray.push(g * 0.25);
                if let (Some(out), Some(src)) = (rgb.as_mut(), self.rgb.as_ref()) {
                    let idx = |xx: u32, yy: u32| yy as usize * self.width as usize + xx as usize;
                    let mut acc = [0u32; 3];
                    for &(xx, yy) in &[(sx, sy), (sx + 1, sy), (sx, sy + 1), (sx + 1, sy + 1)] {
                        for c in 0..3 {
                            acc[c] += u32::from(src[idx(xx, yy)][c]);
                        }
                    }
                    out.push([(acc[0] / 4) as u8, (acc[1] / 4) as u8, (acc[2] / 4) as u8]);
                }
            }
        }
        Self {
            width: w,
            height: h,
            gray,
            rgb,
        }
    }
}

/// One calibrated, posed image of the scene.
#[derive(Debug, Clone)]
pub struct SceneImage {
    pub id: ImageId,
    pub name: String,
    pub camera: CameraModel,
    /// Camera-to-world pose (T_wc).
    pub pose: SE3,
    pub pixels: Option<Arc<ImageData>>,
}

impl SceneImage {
    pub fn new(id: ImageId, camera: CameraModel, pose: SE3) -> Self {
        Self {
            id,
            name: id.to_string(),
            camera,
            pose,
            pixels: None,
        }
    }

    pub fn with_pixels(mut self, pixels: ImageData) -> Self {
        self.pixels = Some(Arc::new(pixels));
        self
    }
}
