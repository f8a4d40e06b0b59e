//! Core ID types for scene images.

/// Externally assigned identifier of a scene image.
///
/// ImageIds are the stable, global handle of an image. The densification
/// engine maps them to compact local indices for its internal arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImageId(pub u32);

impl ImageId {
    /// Create a new ImageId with the given value.
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ImageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IMG{}", self.0)
    }
}
