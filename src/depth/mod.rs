//! Depth-map computation: view selection, seeding, estimation,
//! post-processing and fusion.

pub mod depth_data;
pub mod depth_maps;
pub mod estimate;
pub mod filter;
pub mod fusion;
pub mod grid;
pub mod init;
pub mod view_selection;

pub use depth_data::{DepthData, DepthStage, NeighborView};
pub use depth_maps::DepthMapsData;
pub use filter::FilterStats;
pub use fusion::{fuse_depth_maps, FusionInput};
pub use grid::{ConfidenceMap, DepthMap, Grid, NormalMap};
pub use view_selection::{select_views, WorkingSet};
