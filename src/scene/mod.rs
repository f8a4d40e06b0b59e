//! Scene: posed calibrated images and the sparse point cloud that seeds them.
//!
//! Read-only for the duration of a densification run.

pub mod image;
pub mod types;

use std::collections::HashMap;

use anyhow::{bail, Result};
use nalgebra::Vector3;

pub use image::{ImageData, SceneImage};
pub use types::ImageId;

/// Sparse 3D point with the images that observe it.
#[derive(Debug, Clone)]
pub struct SparsePoint {
    pub position: Vector3<f64>,
    pub views: Vec<ImageId>,
    pub color: Option<[u8; 3]>,
}

impl SparsePoint {
    pub fn new(position: Vector3<f64>, views: Vec<ImageId>) -> Self {
        Self {
            position,
            views,
            color: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct Scene {
    images: Vec<SceneImage>,
    points: Vec<SparsePoint>,
    image_index: HashMap<ImageId, usize>,
    /// Sparse point indices observed by each image.
    visibility: HashMap<ImageId, Vec<usize>>,
}

impl Scene {
    /// Build a scene. Fails on duplicate image ids or points referencing unknown images.
    pub fn new(images: Vec<SceneImage>, points: Vec<SparsePoint>) -> Result<Self> {
        let mut image_index = HashMap::with_capacity(images.len());
        for (i, img) in images.iter().enumerate() {
            if image_index.insert(img.id, i).is_some() {
                bail!("duplicate image id {}", img.id);
            }
        }

        let mut visibility: HashMap<ImageId, Vec<usize>> = HashMap::new();
        for (pi, point) in points.iter().enumerate() {
            for id in &point.views {
                if !image_index.contains_key(id) {
                    bail!("sparse point {} references unknown image {}", pi, id);
                }
                let list = visibility.entry(*id).or_default();
                // Repeated observations of the same point count once.
                if list.last() != Some(&pi) {
                    list.push(pi);
                }
            }
        }

        Ok(Self {
            images,
            points,
            image_index,
            visibility,
        })
    }

    pub fn images(&self) -> &[SceneImage] {
        &self.images
    }

    pub fn points(&self) -> &[SparsePoint] {
        &self.points
    }

    pub fn image(&self, id: ImageId) -> Option<&SceneImage> {
        self.image_index.get(&id).map(|&i| &self.images[i])
    }

    /// Indices into `points()` of the sparse points observed by `id`.
    pub fn visible_points(&self, id: ImageId) -> &[usize] {
        self.visibility.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{CameraModel, SE3};

    fn image(id: u32) -> SceneImage {
        SceneImage::new(
            ImageId::new(id),
            CameraModel::new(50.0, 50.0, 16.0, 16.0, 32, 32),
            SE3::identity(),
        )
    }

    #[test]
    fn test_visibility_index() {
        let points = vec![
            SparsePoint::new(Vector3::new(0.0, 0.0, 1.0), vec![ImageId(1), ImageId(2)]),
            SparsePoint::new(Vector3::new(0.0, 0.0, 2.0), vec![ImageId(2), ImageId(2)]),
        ];
        let scene = Scene::new(vec![image(1), image(2)], points).unwrap();

        assert_eq!(scene.visible_points(ImageId(1)), &[0]);
        assert_eq!(scene.visible_points(ImageId(2)), &[0, 1]);
        assert!(scene.visible_points(ImageId(9)).is_empty());
    }

    #[test]
    fn test_rejects_duplicates_and_unknown_views() {
        assert!(Scene::new(vec![image(1), image(1)], vec![]).is_err());

        let bad = vec![SparsePoint::new(Vector3::zeros(), vec![ImageId(5)])];
        assert!(Scene::new(vec![image(1)], bad).is_err());
    }
}
