pub mod config;
pub mod depth;
pub mod geometry;
pub mod io;
pub mod matching;
pub mod point_cloud;
pub mod scene;
pub mod system;
