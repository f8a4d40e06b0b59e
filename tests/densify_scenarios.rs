//! End-to-end densification runs on a synthetic textured plane.

use std::sync::Arc;

use nalgebra::Vector3;

use rust_mvs::config::DensifyConfig;
use rust_mvs::geometry::{CameraModel, ViewGeometry, SE3};
use rust_mvs::scene::{ImageData, ImageId, Scene, SceneImage, SparsePoint};
use rust_mvs::system::{CancelToken, DensifyOutcome, Densifier, ProgressSink};

const PLANE_Z: f64 = 5.0;
const WIDTH: u32 = 64;
const HEIGHT: u32 = 48;

fn camera() -> CameraModel {
    CameraModel::new(100.0, 100.0, 32.0, 24.0, WIDTH, HEIGHT)
}

fn texture(x: f64, y: f64) -> f32 {
    (0.5 + 0.15 * (11.0 * x).sin() + 0.15 * (8.5 * y).sin() + 0.1 * (6.1 * (x + y)).sin() * (4.7 * (x - y)).cos()) as f32
}

fn image_at(id: u32, x: f64) -> SceneImage {
    let pose = SE3::from_quaternion(1.0, 0.0, 0.0, 0.0, Vector3::new(x, 0.0, 0.0));
    let view = ViewGeometry::new(camera(), pose.clone());
    let mut gray = Vec::with_capacity((WIDTH * HEIGHT) as usize);
    for v in 0..HEIGHT {
        for u in 0..WIDTH {
            let p = view.backproject(f64::from(u), f64::from(v), PLANE_Z);
            gray.push(texture(p.x, p.y));
        }
    }
    SceneImage::new(ImageId(id), camera(), pose).with_pixels(ImageData::from_gray(WIDTH, HEIGHT, gray).unwrap())
}

/// Three cameras along x and 50 plane points seen by all of them.
fn three_view_scene() -> Scene {
    let images = vec![image_at(0, 0.0), image_at(1, 0.5), image_at(2, 1.0)];
    let views = vec![ImageId(0), ImageId(1), ImageId(2)];
    let mut points = Vec::new();
    for j in 0..5 {
        for i in 0..10 {
            let position = Vector3::new(-0.4 + 0.2 * f64::from(i), -0.9 + 0.45 * f64::from(j), PLANE_Z);
            points.push(SparsePoint::new(position, views.clone()));
        }
    }
    assert_eq!(points.len(), 50);
    Scene::new(images, points).unwrap()
}

fn config() -> DensifyConfig {
    let mut config = DensifyConfig::default();
    config.num_workers = 3;
    config.views.min_views = 2;
    config.filter.consistency_tolerance = 0.05;
    config.filter.min_consistent_views = 1;
    config.fusion.depth_tolerance = 0.05;
    config
}

#[test]
fn three_overlapping_images_are_densified() {
    let scene = three_view_scene();
    let mut config = config();
    config.retain_depth_maps = true;

    let result = match Densifier::new(&scene, config).unwrap().run().unwrap() {
        DensifyOutcome::Completed(result) => result,
        DensifyOutcome::Cancelled => panic!("run was not cancelled"),
    };

    assert_eq!(result.report.images, 3);
    assert_eq!(result.report.finalized, 3);
    assert!(result.report.skipped.is_empty());

    assert_eq!(result.depth_maps.len(), 3);
    for dd in &result.depth_maps {
        let mut neighbors: Vec<ImageId> = dd.neighbors.iter().map(|n| n.image_id).collect();
        neighbors.sort();
        let expected: Vec<ImageId> = (0..3).map(ImageId).filter(|&id| id != dd.image_id).collect();
        assert_eq!(neighbors, expected);
        assert_eq!((dd.width(), dd.height()), (WIDTH, HEIGHT));
        assert!(dd.depth_map.as_slice().iter().all(|&d| d == 0.0 || (d.is_finite() && d > 0.0)));
    }

    // Every fused point consumes at least two pixels.
    let pixel_budget = 3 * (WIDTH * HEIGHT) as usize / 2;
    assert!(!result.cloud.is_empty());
    assert!(result.cloud.len() <= pixel_budget);
    assert!(result.cloud.points.iter().all(|p| p.views.len() >= 2));
}

#[test]
fn isolated_image_yields_empty_cloud() {
    let images = vec![image_at(0, 0.0)];
    let points = (0..20)
        .map(|i| SparsePoint::new(Vector3::new(-0.5 + 0.05 * f64::from(i), 0.0, PLANE_Z), vec![ImageId(0)]))
        .collect();
    let scene = Scene::new(images, points).unwrap();

    let result = Densifier::new(&scene, config())
        .unwrap()
        .run()
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(result.report.images, 0);
    assert_eq!(result.report.finalized, 0);
    assert!(result.cloud.is_empty());
    assert!(result.depth_maps.is_empty());
}

struct CancelOnFirst(CancelToken);

impl ProgressSink for CancelOnFirst {
    fn on_progress(&self, done: usize, _total: usize) {
        if done >= 1 {
            self.0.cancel();
        }
    }
}

#[test]
fn cancellation_after_first_image_skips_fusion() {
    let scene = three_view_scene();
    let mut config = config();
    config.num_workers = 1;
    let densifier = Densifier::new(&scene, config).unwrap();
    let token = densifier.cancel_token();
    let densifier = densifier.with_progress_sink(Arc::new(CancelOnFirst(token)));

    let outcome = densifier.run().unwrap();
    assert!(outcome.is_cancelled());
    assert!(outcome.into_result().is_none());
    assert_eq!(densifier.progress().done(), 1);
}
