//! Geometry utilities: SE3 transforms, pinhole camera, posed views.

pub mod camera;
pub mod se3;
pub mod view;

pub use camera::CameraModel;
pub use se3::SE3;
pub use view::ViewGeometry;
