//! Fused dense point cloud.

use nalgebra::Vector3;

use crate::scene::ImageId;

/// One fused surface sample.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedPoint {
    pub position: Vector3<f64>,
    /// Images whose depth maps agreed on this point, reference first.
    pub views: Vec<ImageId>,
    /// Sum of the confidences of the merged observations.
    pub weight: f32,
    pub color: Option<[u8; 3]>,
    /// Unit normal in world coordinates, facing the reference camera.
    pub normal: Option<Vector3<f64>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointCloud {
    pub points: Vec<FusedPoint>,
}

impl PointCloud {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// True if every point carries a color.
    pub fn has_colors(&self) -> bool {
        !self.points.is_empty() && self.points.iter().all(|p| p.color.is_some())
    }

    /// True if every point carries a normal.
    pub fn has_normals(&self) -> bool {
        !self.points.is_empty() && self.points.iter().all(|p| p.normal.is_some())
    }

    /// Axis-aligned bounds (min, max). None for an empty cloud.
    pub fn bounds(&self) -> Option<(Vector3<f64>, Vector3<f64>)> {
        let first = self.points.first()?.position;
        Some(self.points.iter().fold((first, first), |(lo, hi), p| {
            (lo.inf(&p.position), hi.sup(&p.position))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(x: f64, color: Option<[u8; 3]>) -> FusedPoint {
        FusedPoint {
            position: Vector3::new(x, -x, 1.0),
            views: vec![ImageId(0), ImageId(1)],
            weight: 2.0,
            color,
            normal: None,
        }
    }

    #[test]
    fn test_bounds() {
        let cloud = PointCloud {
            points: vec![point(1.0, None), point(-2.0, None)],
        };
        let (lo, hi) = cloud.bounds().unwrap();
        assert_eq!(lo, Vector3::new(-2.0, -1.0, 1.0));
        assert_eq!(hi, Vector3::new(1.0, 2.0, 1.0));
        assert!(PointCloud::default().bounds().is_none());
    }

    #[test]
    fn test_attribute_flags() {
        let mut cloud = PointCloud {
            points: vec![point(0.0, Some([1, 2, 3]))],
        };
        assert!(cloud.has_colors());
        assert!(!cloud.has_normals());
        cloud.points.push(point(1.0, None));
        assert!(!cloud.has_colors());
    }
}
