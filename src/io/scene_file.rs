//! Scene loading: a YAML image list plus a CSV sparse point file.
//!
//! Image list:
//!
//! ```yaml
//! images:
//!   - id: 0
//!     name: left_000
//!     image: images/left_000.png   # optional, relative to the YAML file
//!     width: 640
//!     height: 480
//!     intrinsics: [fx, fy, cx, cy]
//!     T_WC: [r00, r01, r02, tx, r10, r11, r12, ty, r20, r21, r22, tz, 0, 0, 0, 1]
//! ```
//!
//! Sparse points, one per row with a header line:
//!
//! ```text
//! x,y,z,r,g,b,views
//! 0.1,0.2,5.0,120,80,60,0;1;2
//! ```
//!
//! Color columns may be empty.

use std::fs::File;
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use csv::ReaderBuilder;
use nalgebra::{Matrix3, Matrix4, Vector3};
use serde::Deserialize;
use tracing::info;

use crate::geometry::{CameraModel, SE3};
use crate::scene::{ImageData, ImageId, Scene, SceneImage, SparsePoint};

#[derive(Debug, Deserialize)]
struct SceneYaml {
    images: Vec<ImageYaml>,
}

#[derive(Debug, Deserialize)]
struct ImageYaml {
    id: u32,
    #[serde(default)]
    name: Option<String>,
    /// Pixel file, relative to the YAML file.
    #[serde(default)]
    image: Option<String>,
    width: u32,
    height: u32,
    /// [fx, fy, cx, cy]
    intrinsics: Vec<f64>,
    /// Camera-to-world, row-major 4x4.
    #[serde(rename = "T_WC")]
    t_wc: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct PointRow {
    x: f64,
    y: f64,
    z: f64,
    r: Option<u8>,
    g: Option<u8>,
    b: Option<u8>,
    views: String,
}

/// Load images and sparse points and build the scene.
pub fn load_scene<P: AsRef<Path>, Q: AsRef<Path>>(images_yaml: P, points_csv: Q) -> Result<Scene> {
    let images = load_images(images_yaml.as_ref())?;
    let points = load_points(points_csv.as_ref())?;
    info!(
        "[SceneFile] {} images ({} with pixels), {} sparse points",
        images.len(),
        images.iter().filter(|i| i.pixels.is_some()).count(),
        points.len()
    );
    Scene::new(images, points)
}

pub fn load_images(path: &Path) -> Result<Vec<SceneImage>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let doc: SceneYaml = serde_yaml::from_reader(file)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    let mut images = Vec::with_capacity(doc.images.len());
    for entry in doc.images {
        let id = ImageId(entry.id);
        let camera = camera_from(&entry.intrinsics, entry.width, entry.height)
            .with_context(|| format!("Bad intrinsics for {}", id))?;
        let pose = transform_from(&entry.t_wc).with_context(|| format!("Bad T_WC for {}", id))?;
        let mut image = SceneImage::new(id, camera, pose);
        if let Some(name) = entry.name {
            image.name = name;
        }
        if let Some(file) = entry.image {
            let pixels_path = base.join(&file);
            let pixels = load_pixels(&pixels_path, entry.width, entry.height)
                .with_context(|| format!("Failed to load pixels of {}", id))?;
            image = image.with_pixels(pixels);
        }
        images.push(image);
    }
    Ok(images)
}

pub fn load_points(path: &Path) -> Result<Vec<SparsePoint>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut points = Vec::new();
    for (line, row) in rdr.deserialize::<PointRow>().enumerate() {
        let row = row.with_context(|| format!("{}: bad point record {}", path.display(), line + 1))?;
        let views = parse_views(&row.views)
            .with_context(|| format!("{}: bad view list in record {}", path.display(), line + 1))?;
        let mut point = SparsePoint::new(Vector3::new(row.x, row.y, row.z), views);
        if let (Some(r), Some(g), Some(b)) = (row.r, row.g, row.b) {
            point.color = Some([r, g, b]);
        }
        points.push(point);
    }
    Ok(points)
}

fn parse_views(text: &str) -> Result<Vec<ImageId>> {
    let mut views = Vec::new();
    for part in text.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        views.push(ImageId(part.parse()?));
    }
    Ok(views)
}

/// Accepted deviation of a loaded rotation from orthonormality.
const ROTATION_TOLERANCE: f64 = 1e-6;

fn camera_from(intrinsics: &[f64], width: u32, height: u32) -> Result<CameraModel> {
    if intrinsics.len() != 4 {
        bail!(
            "Expected 4 intrinsics [fx, fy, cx, cy], got {}",
            intrinsics.len()
        );
    }
    Ok(CameraModel::new(
        intrinsics[0],
        intrinsics[1],
        intrinsics[2],
        intrinsics[3],
        width,
        height,
    ))
}

fn transform_from(data: &[f64]) -> Result<SE3> {
    if data.len() != 16 {
        bail!("Expected 16 elements for transform, got {}", data.len());
    }
    let mat = Matrix4::from_row_slice(data);
    ensure!(
        mat.row(3)
            .iter()
            .zip([0.0, 0.0, 0.0, 1.0])
            .all(|(a, b)| (a - b).abs() <= ROTATION_TOLERANCE),
        "Last transform row must be [0, 0, 0, 1]"
    );
    let r = mat.fixed_view::<3, 3>(0, 0).into_owned();
    let orthogonality = (r.transpose() * r - Matrix3::identity()).amax();
    ensure!(
        orthogonality <= ROTATION_TOLERANCE,
        "Rotation is not orthonormal (max |R^T R - I| = {:.3e})",
        orthogonality
    );
    let det = r.determinant();
    ensure!(
        (det - 1.0).abs() <= ROTATION_TOLERANCE,
        "Rotation determinant is {:.6}, expected 1",
        det
    );
    Ok(SE3::from_matrix(mat))
}

fn load_pixels(path: &Path, width: u32, height: u32) -> Result<ImageData> {
    let img = image::open(path)
        .with_context(|| format!("Failed to read image {}", path.display()))?
        .to_rgb8();
    ensure!(
        img.width() == width && img.height() == height,
        "{} is {}x{}, calibration says {}x{}",
        path.display(),
        img.width(),
        img.height(),
        width,
        height
    );
    let rgb = img
        .into_raw()
        .chunks_exact(3)
        .map(|c| [c[0], c[1], c[2]])
        .collect();
    ImageData::from_rgb(width, height, rgb)
}
