use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rust_mvs::config::DensifyConfig;
use rust_mvs::io::{load_scene, write_depth_map, write_ply};
use rust_mvs::system::{DensifyOutcome, Densifier};

const USAGE: &str = "usage: densify <scene.yaml> <points.csv> <out.ply> [config.yaml]";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 3 || args.len() > 4 {
        bail!(USAGE);
    }
    let scene_path = PathBuf::from(&args[0]);
    let points_path = PathBuf::from(&args[1]);
    let output_path = PathBuf::from(&args[2]);

    let config = match args.get(3) {
        Some(path) => DensifyConfig::from_yaml_file(path)?,
        None => DensifyConfig::default(),
    };

    let scene = load_scene(&scene_path, &points_path)?;
    let densifier = Densifier::new(&scene, config)?;
    let result = match densifier.run()? {
        DensifyOutcome::Completed(result) => result,
        DensifyOutcome::Cancelled => {
            info!("Densification cancelled, nothing written");
            return Ok(());
        }
    };

    for (id, reason) in &result.report.skipped {
        info!("Skipped {}: {}", id, reason);
    }

    write_ply(&output_path, &result.cloud)?;
    info!("Wrote {} points to {}", result.cloud.len(), output_path.display());

    if !result.depth_maps.is_empty() {
        let dir = depth_map_dir(&output_path);
        std::fs::create_dir_all(&dir)?;
        for dd in &result.depth_maps {
            write_depth_map(dir.join(format!("{}.dmap", dd.image_id.0)), dd)?;
        }
        info!("Wrote {} depth maps to {}", result.depth_maps.len(), dir.display());
    }
    Ok(())
}

/// `out.ply` -> `out_depth/`
fn depth_map_dir(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map_or_else(|| "densify".to_string(), |s| s.to_string_lossy().into_owned());
    output.with_file_name(format!("{}_depth", stem))
}
