//! Parallel scheduling of the per-image depth pipeline.
//!
//! A fixed pool of scoped worker threads shares one event queue. Stage 1
//! (neighbor scoring) is claimed through the work cursor; estimation and
//! filtering flow through the queue, and workers drain queued events before
//! claiming new images. A filter task waits on the stage board until every
//! active neighbor has published its estimate or been skipped. Fusion runs
//! on the calling thread once the pool has joined.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::DensifyConfig;
use crate::depth::{select_views, DepthMapsData};
use crate::scene::Scene;

use super::events::DepthEvent;
use super::report::{DensifyOutcome, DensifyReport, DensifyResult, SkipReason};
use super::shared_state::{CancelToken, ImageState, Progress, ProgressSink, StageBoard, WorkCursor};

/// Timeout for receiving events. Allows periodic cancellation and completion checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Scheduling state of one run over the working set.
pub struct DenseDepthMapData<'a> {
    engine: DepthMapsData<'a>,
    config: &'a DensifyConfig,
    cursor: WorkCursor,
    board: Mutex<StageBoard>,
    skipped: Mutex<Vec<(usize, SkipReason)>>,
    progress: Arc<Progress>,
    cancel: CancelToken,
    sender: Sender<DepthEvent>,
    receiver: Receiver<DepthEvent>,
}

impl<'a> DenseDepthMapData<'a> {
    pub fn new(engine: DepthMapsData<'a>, config: &'a DensifyConfig, progress: Arc<Progress>, cancel: CancelToken) -> Self {
        let total = engine.len();
        let candidates: Vec<Vec<usize>> = engine
            .working_set()
            .neighbors_map
            .iter()
            .map(|list| list.iter().map(|n| n.local_index).collect())
            .collect();
        let (sender, receiver) = unbounded();
        progress.start(total);
        Self {
            engine,
            config,
            cursor: WorkCursor::new(total),
            board: Mutex::new(StageBoard::new(&candidates)),
            skipped: Mutex::new(Vec::new()),
            progress,
            cancel,
            sender,
            receiver,
        }
    }

    pub fn engine(&self) -> &DepthMapsData<'a> {
        &self.engine
    }

    /// Every image is finalized or skipped.
    pub fn is_complete(&self) -> bool {
        self.board.lock().is_complete()
    }

    /// Worker body: runs until the work is complete, the run is cancelled or
    /// the queue closes.
    pub fn run_worker(&self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if let Ok(event) = self.receiver.try_recv() {
                self.handle(event);
                continue;
            }
            if let Some(idx) = self.cursor.claim() {
                self.handle(DepthEvent::ScoreNeighbors(idx));
                continue;
            }
            if self.is_complete() {
                break;
            }
            match self.receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(event) => self.handle(event),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn handle(&self, event: DepthEvent) {
        if self.cancel.is_cancelled() {
            return;
        }
        let idx = event.index();
        let outcome = match event {
            DepthEvent::ScoreNeighbors(_) => self.score_neighbors(idx).map_err(|e| SkipReason::ViewSelection(format!("{:#}", e))),
            DepthEvent::EstimateDepth(_) => self.estimate_depth(idx).map_err(|e| SkipReason::Estimation(format!("{:#}", e))),
            DepthEvent::FilterDepth(_) => self.filter_depth(idx).map_err(|e| SkipReason::Filtering(format!("{:#}", e))),
        };
        if let Err(reason) = outcome {
            self.skip(idx, reason);
        }
    }

    fn push(&self, event: DepthEvent) -> Result<()> {
        self.sender
            .send(event)
            .with_context(|| format!("event queue closed while sending {}", event))
    }

    /// Stage 1: rank and activate neighbors.
    fn score_neighbors(&self, idx: usize) -> Result<()> {
        self.engine.select_views(idx)?;
        self.push(DepthEvent::EstimateDepth(idx))
    }

    /// Stage 2: seed, estimate, clean up, publish.
    fn estimate_depth(&self, idx: usize) -> Result<()> {
        let engine = &self.engine;
        engine.init_depth_map(idx)?;
        engine.estimate_depth_map(idx)?;
        let removed = engine.remove_small_segments(idx)?;
        let filled = engine.gap_interpolation(idx)?;
        engine.publish(idx)?;
        debug!(
            "[Densifier] image #{} estimated: {} pixels in small segments removed, {} gap pixels filled",
            idx, removed, filled
        );

        let deps = engine.active_neighbors(idx);
        let (released, unused) = {
            let mut board = self.board.lock();
            let mut released = board.mark_estimated(idx);
            if board.request_filter(idx, deps) {
                released.push(idx);
            }
            (released, board.take_unused_estimates())
        };
        self.release_estimates(&unused);
        for task in released {
            self.push(DepthEvent::FilterDepth(task))?;
        }
        Ok(())
    }

    /// Stage 3: cross-view filter, then finalize.
    fn filter_depth(&self, idx: usize) -> Result<()> {
        let deps = self.engine.active_neighbors(idx);
        let stats = self
            .engine
            .filter_depth_map(idx, &deps, self.config.filter.adjust)?;
        debug!(
            "[Densifier] image #{} filtered: {} checked, {} invalidated, {} adjusted",
            idx, stats.checked, stats.invalidated, stats.adjusted
        );
        self.signal_complete_depthmap_filter(idx);
        Ok(())
    }

    /// Mark an image finalized and advance the progress counter.
    pub fn signal_complete_depthmap_filter(&self, idx: usize) {
        let unused = {
            let mut board = self.board.lock();
            board.mark_finalized(idx);
            board.take_unused_estimates()
        };
        self.release_estimates(&unused);
        let done = self.progress.advance();
        debug!("[Densifier] image #{} finalized ({}/{})", idx, done, self.progress.total());
    }

    fn skip(&self, idx: usize, reason: SkipReason) {
        let name = self
            .engine
            .image_id(idx)
            .map_or_else(|| format!("#{}", idx), |id| id.to_string());
        warn!("[Densifier] skipping {}: {}", name, reason);
        self.engine.discard(idx);
        self.skipped.lock().push((idx, reason));

        let (released, unused) = {
            let mut board = self.board.lock();
            let released = board.mark_skipped(idx);
            (released, board.take_unused_estimates())
        };
        self.release_estimates(&unused);
        for task in released {
            if let Err(e) = self.push(DepthEvent::FilterDepth(task)) {
                warn!("[Densifier] {:#}", e);
            }
        }
        self.progress.advance();
    }

    fn release_estimates(&self, unused: &[usize]) {
        for &idx in unused {
            self.engine.release_snapshot(idx);
        }
        if !unused.is_empty() {
            debug!("[Densifier] released estimates of {:?}", unused);
        }
    }

    fn report(&self) -> DensifyReport {
        let board = self.board.lock();
        let mut skipped: Vec<_> = self
            .skipped
            .lock()
            .iter()
            .filter_map(|(idx, reason)| self.engine.image_id(*idx).map(|id| (id, reason.clone())))
            .collect();
        skipped.sort_by_key(|(id, _)| *id);
        DensifyReport {
            images: self.engine.len(),
            finalized: board.count(ImageState::Finalized),
            skipped,
            ..Default::default()
        }
    }

    pub fn into_engine(self) -> DepthMapsData<'a> {
        self.engine
    }
}

/// Computes and fuses the depth maps of a scene.
pub struct Densifier<'a> {
    scene: &'a Scene,
    config: DensifyConfig,
    cancel: CancelToken,
    progress: Arc<Progress>,
}

impl<'a> Densifier<'a> {
    pub fn new(scene: &'a Scene, config: DensifyConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            scene,
            config,
            cancel: CancelToken::new(),
            progress: Progress::new(None),
        })
    }

    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Progress::new(Some(sink));
        self
    }

    /// Token that cancels the run from any thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn progress(&self) -> Arc<Progress> {
        Arc::clone(&self.progress)
    }

    pub fn config(&self) -> &DensifyConfig {
        &self.config
    }

    pub fn run(&self) -> Result<DensifyOutcome> {
        let start = Instant::now();
        let config = &self.config;
        info!(
            "[Densifier] {} images, {} sparse points",
            self.scene.images().len(),
            self.scene.points().len()
        );

        let Some(working) = select_views(self.scene, &config.views) else {
            info!("[Densifier] no image qualifies for densification");
            self.progress.start(0);
            return Ok(DensifyOutcome::Completed(DensifyResult {
                report: DensifyReport {
                    elapsed: start.elapsed(),
                    ..Default::default()
                },
                ..Default::default()
            }));
        };

        let engine = DepthMapsData::new(self.scene, config, working)?;
        let data = DenseDepthMapData::new(engine, config, Arc::clone(&self.progress), self.cancel.clone());
        let workers = config.worker_count().clamp(1, data.engine().len().max(1));
        info!(
            "[Densifier] computing {} depth maps on {} workers",
            data.engine().len(),
            workers
        );

        thread::scope(|s| -> Result<()> {
            for w in 0..workers {
                let data = &data;
                thread::Builder::new()
                    .name(format!("densify-{}", w))
                    .spawn_scoped(s, move || data.run_worker())
                    .with_context(|| format!("Failed to spawn worker {}", w))?;
            }
            Ok(())
        })?;

        if self.cancel.is_cancelled() {
            info!("[Densifier] cancelled after {} of {} images", self.progress.done(), self.progress.total());
            return Ok(DensifyOutcome::Cancelled);
        }

        let mut report = data.report();
        let engine = data.into_engine();
        let held = engine.snapshot_count();
        if held > 0 {
            debug!("[Densifier] {} estimates still held after the pool joined", held);
        }
        engine.release_snapshots();
        let cancel = self.cancel.clone();
        let fused = engine.fuse_depth_maps(
            config.fusion.estimate_colors,
            config.fusion.estimate_normals,
            &move || cancel.is_cancelled(),
        )?;
        let Some(cloud) = fused else {
            info!("[Densifier] cancelled during fusion");
            return Ok(DensifyOutcome::Cancelled);
        };
        let depth_maps = if config.retain_depth_maps {
            engine.into_depth_maps()
        } else {
            engine.release_depth_maps();
            Vec::new()
        };
        if let Some((lo, hi)) = cloud.bounds() {
            debug!(
                "[Densifier] cloud bounds [{:.3}, {:.3}, {:.3}] .. [{:.3}, {:.3}, {:.3}]",
                lo.x, lo.y, lo.z, hi.x, hi.y, hi.z
            );
        }

        report.points = cloud.len();
        report.elapsed = start.elapsed();
        info!(
            "[Densifier] {} of {} depth maps finalized, {} skipped, {} points in {:.2?}",
            report.finalized,
            report.images,
            report.skipped_count(),
            report.points,
            report.elapsed
        );
        Ok(DensifyOutcome::Completed(DensifyResult {
            cloud,
            report,
            depth_maps,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FusionMode;
    use crate::matching::test_scene::{plane_scene, render, view_at, PLANE_Z};
    use crate::scene::{ImageId, SceneImage, SparsePoint};
    use nalgebra::Vector3;

    fn config(workers: usize) -> DensifyConfig {
        let mut config = DensifyConfig::default();
        config.num_workers = workers;
        config.filter.consistency_tolerance = 0.05;
        config.filter.min_consistent_views = 1;
        config.fusion.depth_tolerance = 0.05;
        config
    }

    #[test]
    fn test_run_fuses_plane() {
        let scene = plane_scene(&[0.0, 0.5, 1.0]);
        for workers in [1, 3] {
            let densifier = Densifier::new(&scene, config(workers)).unwrap();
            let result = densifier.run().unwrap().into_result().unwrap();

            assert_eq!(result.report.images, 3);
            assert_eq!(result.report.finalized, 3);
            assert!(result.report.skipped.is_empty());
            assert!(!result.cloud.is_empty());
            assert_eq!(result.report.points, result.cloud.len());
            assert!(result.depth_maps.is_empty());
            assert_eq!(densifier.progress().done(), 3);

            let near_plane = result
                .cloud
                .points
                .iter()
                .filter(|p| (p.position.z - PLANE_Z).abs() < 0.15)
                .count();
            assert!(near_plane * 2 > result.cloud.len());
        }
    }

    #[test]
    fn test_global_mode_fuses_plane() {
        let scene = plane_scene(&[0.0, 0.5, 1.0]);
        let mut config = config(2);
        config.fusion_mode = FusionMode::Global;
        let result = Densifier::new(&scene, config).unwrap().run().unwrap().into_result().unwrap();

        assert_eq!(result.report.finalized, 3);
        assert!(result.report.skipped.is_empty());
        assert!(!result.cloud.is_empty());
        let near_plane = result
            .cloud
            .points
            .iter()
            .filter(|p| (p.position.z - PLANE_Z).abs() < 0.15)
            .count();
        assert!(near_plane * 10 >= result.cloud.len() * 9);
    }

    #[test]
    fn test_estimates_released_once_readers_finish() {
        let scene = plane_scene(&[0.0, 0.5, 1.0, 1.5]);
        let config = config(1);
        let working = select_views(&scene, &config.views).unwrap();
        let engine = DepthMapsData::new(&scene, &config, working).unwrap();
        let data = DenseDepthMapData::new(engine, &config, Progress::new(None), CancelToken::new());

        data.run_worker();
        assert!(data.is_complete());
        assert_eq!(data.engine().snapshot_count(), 0);
        let report = data.report();
        assert_eq!(report.finalized + report.skipped_count(), 4);
    }

    #[test]
    fn test_records_released_after_fusion() {
        let scene = plane_scene(&[0.0, 0.5, 1.0]);
        let config = config(1);
        let working = select_views(&scene, &config.views).unwrap();
        let engine = DepthMapsData::new(&scene, &config, working).unwrap();
        let data = DenseDepthMapData::new(engine, &config, Progress::new(None), CancelToken::new());
        data.run_worker();

        let engine = data.into_engine();
        assert!(!engine.fuse_depth_maps(false, false, &|| false).unwrap().unwrap().is_empty());
        engine.release_depth_maps();
        let maps = engine.into_depth_maps();
        assert_eq!(maps.len(), 3);
        assert!(maps.iter().all(|dd| dd.depth_map.is_empty() && dd.confidence_map.is_none()));
    }

    #[test]
    fn test_retained_depth_maps() {
        let scene = plane_scene(&[0.0, 0.5, 1.0]);
        let mut config = config(2);
        config.retain_depth_maps = true;
        let result = Densifier::new(&scene, config).unwrap().run().unwrap().into_result().unwrap();

        let ids: Vec<ImageId> = result.depth_maps.iter().map(|dd| dd.image_id).collect();
        assert_eq!(ids, vec![ImageId(0), ImageId(1), ImageId(2)]);
    }

    #[test]
    fn test_isolated_image_gives_empty_cloud() {
        let scene = plane_scene(&[0.0]);
        let result = Densifier::new(&scene, config(2)).unwrap().run().unwrap().into_result().unwrap();
        assert!(result.cloud.is_empty());
        assert_eq!(result.report.images, 0);
    }

    #[test]
    fn test_cancel_before_run() {
        let scene = plane_scene(&[0.0, 0.5, 1.0]);
        let densifier = Densifier::new(&scene, config(2)).unwrap();
        densifier.cancel_token().cancel();
        assert!(densifier.run().unwrap().is_cancelled());
    }

    struct CancelAfterFirst(CancelToken);

    impl ProgressSink for CancelAfterFirst {
        fn on_progress(&self, _done: usize, _total: usize) {
            self.0.cancel();
        }
    }

    #[test]
    fn test_cancel_from_progress_sink() {
        let scene = plane_scene(&[0.0, 0.5, 1.0]);
        let densifier = Densifier::new(&scene, config(1)).unwrap();
        let sink = Arc::new(CancelAfterFirst(densifier.cancel_token()));
        let densifier = densifier.with_progress_sink(sink);

        assert!(densifier.run().unwrap().is_cancelled());
        assert!(densifier.progress().done() >= 1);
        assert!(densifier.progress().done() < 3);
    }

    #[test]
    fn test_failed_image_is_skipped_and_releases_neighbors() {
        // Image 2 observes only half of the sparse points.
        let xs = [0.0, 0.5, 1.0];
        let images = xs
            .iter()
            .enumerate()
            .map(|(i, &x)| {
                let view = view_at(x);
                SceneImage::new(ImageId(i as u32), view.camera, view.pose_wc.clone()).with_pixels(render(&view))
            })
            .collect();
        let mut points = Vec::new();
        for j in 0..5 {
            for i in 0..6 {
                let position = Vector3::new(-0.4 + 0.36 * f64::from(i), -0.9 + 0.45 * f64::from(j), PLANE_Z);
                let views = if (i + j) % 2 == 0 {
                    vec![ImageId(0), ImageId(1), ImageId(2)]
                } else {
                    vec![ImageId(0), ImageId(1)]
                };
                points.push(SparsePoint::new(position, views));
            }
        }
        let scene = Scene::new(images, points).unwrap();

        let mut config = config(2);
        config.init.min_seed_points = 20;
        let result = Densifier::new(&scene, config).unwrap().run().unwrap().into_result().unwrap();

        assert_eq!(result.report.images, 3);
        assert_eq!(result.report.finalized, 2);
        assert_eq!(result.report.skipped.len(), 1);
        let (id, reason) = &result.report.skipped[0];
        assert_eq!(*id, ImageId(2));
        assert!(matches!(reason, SkipReason::Estimation(_)));
        assert!(!result.cloud.is_empty());
        assert!(result.cloud.points.iter().all(|p| !p.views.contains(&ImageId(2))));
    }
}
