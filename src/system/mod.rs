//! Run orchestration: worker pool, event queue and shared run state.

mod densifier;
pub mod events;
pub mod report;
pub mod shared_state;

pub use densifier::{DenseDepthMapData, Densifier};
pub use events::DepthEvent;
pub use report::{DensifyOutcome, DensifyReport, DensifyResult, SkipReason};
pub use shared_state::{CancelToken, ImageState, Progress, ProgressSink, StageBoard, WorkCursor};
