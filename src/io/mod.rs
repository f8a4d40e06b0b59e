//! File formats: scene input, point cloud and depth map output.

pub mod depth_map_file;
pub mod ply;
pub mod scene_file;

pub use depth_map_file::{read_depth_map, write_depth_map, DepthMapFile};
pub use ply::write_ply;
pub use scene_file::load_scene;
