//! Estimation step of the per-image pipeline.

use anyhow::{bail, ensure, Result};
use tracing::debug;

use crate::matching::{DepthEstimator, EstimationContext};

use super::depth_data::{DepthData, DepthStage};

/// Run `estimator` on an initialized record and enforce the depth contract.
///
/// Fails on malformed input (invalid calibration, empty map, no active
/// neighbors) or when the estimator itself fails. Pixels the estimator could
/// not resolve are invalid, not errors.
pub fn estimate_depth_map(dd: &mut DepthData, ctx: &EstimationContext<'_>, estimator: &dyn DepthEstimator) -> Result<()> {
    ensure!(dd.view.camera.is_valid(), "{} has invalid calibration", dd.image_id);
    ensure!(!dd.depth_map.is_empty(), "{} has a zero-sized depth map", dd.image_id);
    if dd.stage != DepthStage::Initialized {
        bail!("{} is not initialized (stage {:?})", dd.image_id, dd.stage);
    }
    ensure!(!dd.active.is_empty(), "{} has no active neighbors", dd.image_id);

    estimator.estimate(ctx, dd)?;
    let invalidated = enforce_depth_contract(dd);
    if invalidated > 0 {
        debug!(
            "[DepthEstimate] {}: {} non-finite or non-positive depths dropped",
            dd.image_id,
            invalidated
        );
    }
    dd.stage = DepthStage::Estimated;
    Ok(())
}

/// Valid depths are finite and strictly positive, confidences lie in
/// `[0, 1]`, and invalid pixels carry no confidence or normal.
///
/// Returns the number of pixels invalidated.
pub fn enforce_depth_contract(dd: &mut DepthData) -> usize {
    let (w, h) = (dd.width(), dd.height());
    if let Some(conf) = dd.confidence_map.as_ref() {
        if conf.width() != w || conf.height() != h {
            dd.confidence_map = None;
        }
    }
    if let Some(normals) = dd.normal_map.as_ref() {
        if normals.width() != w || normals.height() != h {
            dd.normal_map = None;
        }
    }

    let mut invalidated = 0;
    for y in 0..h {
        for x in 0..w {
            let d = dd.depth(x, y);
            if d != 0.0 && !(d.is_finite() && d > 0.0) {
                invalidated += 1;
            }
            if !(d.is_finite() && d > 0.0) {
                dd.invalidate(x, y);
                continue;
            }
            if let Some(conf) = dd.confidence_map.as_mut() {
                let c = *conf.get(x, y);
                conf.set(x, y, if c.is_finite() { c.clamp(0.0, 1.0) } else { 0.0 });
            }
        }
    }
    invalidated
}
