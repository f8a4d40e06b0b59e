//! Work items exchanged between densification workers.

use std::fmt;

/// One unit of per-image work, tagged with the image's local index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthEvent {
    /// Rank and activate the neighbors of an image.
    ScoreNeighbors(usize),
    /// Seed, estimate, clean up and publish the depth map.
    EstimateDepth(usize),
    /// Cross-view filter; finalizes the image.
    FilterDepth(usize),
}

impl DepthEvent {
    pub fn index(&self) -> usize {
        match *self {
            DepthEvent::ScoreNeighbors(idx) | DepthEvent::EstimateDepth(idx) | DepthEvent::FilterDepth(idx) => idx,
        }
    }
}

impl fmt::Display for DepthEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DepthEvent::ScoreNeighbors(idx) => write!(f, "ScoreNeighbors(#{})", idx),
            DepthEvent::EstimateDepth(idx) => write!(f, "EstimateDepth(#{})", idx),
            DepthEvent::FilterDepth(idx) => write!(f, "FilterDepth(#{})", idx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_and_display() {
        assert_eq!(DepthEvent::FilterDepth(4).index(), 4);
        assert_eq!(DepthEvent::EstimateDepth(2).to_string(), "EstimateDepth(#2)");
    }
}
