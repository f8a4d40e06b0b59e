//! Outcome and bookkeeping of a densification run.

use std::fmt;
use std::time::Duration;

use crate::depth::DepthData;
use crate::point_cloud::PointCloud;
use crate::scene::ImageId;

/// Why an image dropped out of the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    ViewSelection(String),
    Estimation(String),
    Filtering(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::ViewSelection(msg) => write!(f, "view selection: {}", msg),
            SkipReason::Estimation(msg) => write!(f, "estimation: {}", msg),
            SkipReason::Filtering(msg) => write!(f, "filtering: {}", msg),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DensifyReport {
    /// Images in the working set.
    pub images: usize,
    pub finalized: usize,
    pub skipped: Vec<(ImageId, SkipReason)>,
    pub points: usize,
    pub elapsed: Duration,
}

impl DensifyReport {
    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }
}

#[derive(Debug, Default)]
pub struct DensifyResult {
    pub cloud: PointCloud,
    pub report: DensifyReport,
    /// Filtered depth maps, kept only when `retain_depth_maps` is set.
    pub depth_maps: Vec<DepthData>,
}

#[derive(Debug)]
pub enum DensifyOutcome {
    Completed(DensifyResult),
    Cancelled,
}

impl DensifyOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DensifyOutcome::Cancelled)
    }

    pub fn into_result(self) -> Option<DensifyResult> {
        match self {
            DensifyOutcome::Completed(result) => Some(result),
            DensifyOutcome::Cancelled => None,
        }
    }
}
