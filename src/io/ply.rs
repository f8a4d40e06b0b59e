//! ASCII PLY export of the fused point cloud.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};

use crate::point_cloud::PointCloud;

/// Write `cloud` to `path`. Normals and colors are written only when every
/// point carries them.
pub fn write_ply<P: AsRef<Path>>(path: P, cloud: &PointCloud) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut out = BufWriter::new(file);
    write_ply_to(&mut out, cloud).with_context(|| format!("Failed to write {}", path.display()))?;
    out.flush()?;
    Ok(())
}

pub fn write_ply_to<W: Write>(out: &mut W, cloud: &PointCloud) -> Result<()> {
    let normals = cloud.has_normals();
    let colors = cloud.has_colors();

    writeln!(out, "ply")?;
    writeln!(out, "format ascii 1.0")?;
    writeln!(out, "element vertex {}", cloud.len())?;
    for axis in ["x", "y", "z"] {
        writeln!(out, "property float {}", axis)?;
    }
    if normals {
        for axis in ["nx", "ny", "nz"] {
            writeln!(out, "property float {}", axis)?;
        }
    }
    if colors {
        for channel in ["red", "green", "blue"] {
            writeln!(out, "property uchar {}", channel)?;
        }
    }
    writeln!(out, "end_header")?;

    for p in &cloud.points {
        write!(out, "{} {} {}", p.position.x, p.position.y, p.position.z)?;
        if let (true, Some(n)) = (normals, p.normal.as_ref()) {
            write!(out, " {} {} {}", n.x, n.y, n.z)?;
        }
        if let (true, Some(c)) = (colors, p.color) {
            write!(out, " {} {} {}", c[0], c[1], c[2])?;
        }
        writeln!(out)?;
    }
    Ok(())
}
