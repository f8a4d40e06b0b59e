//! Binary export of filtered depth maps.
//!
//! Layout, all little-endian:
//!
//! ```text
//! magic "DMAP" | version u16 | image id u32 | width u32 | height u32
//! | flags u8 (bit 0: confidence present) | depth min f32 | depth max f32
//! | depth f32 * width * height | [confidence f32 * width * height]
//! ```
//!
//! A missing depth range is stored as `0.0, 0.0`.

use std::path::Path;

use anyhow::{bail, ensure, Context, Result};

use crate::depth::{ConfidenceMap, DepthData, DepthMap, Grid};
use crate::scene::ImageId;

const MAGIC: &[u8; 4] = b"DMAP";
const VERSION: u16 = 1;
const HEADER_LEN: usize = 4 + 2 + 4 + 4 + 4 + 1 + 4 + 4;
const FLAG_CONFIDENCE: u8 = 1;

/// A depth map read back from disk.
#[derive(Debug, Clone)]
pub struct DepthMapFile {
    pub image_id: ImageId,
    pub depth: DepthMap,
    pub confidence: Option<ConfidenceMap>,
    pub depth_range: Option<(f32, f32)>,
}

pub fn encode_depth_map(dd: &DepthData) -> Vec<u8> {
    let n = dd.depth_map.len();
    let confidence = dd
        .confidence_map
        .as_ref()
        .filter(|c| c.len() == n);
    let mut data = Vec::with_capacity(HEADER_LEN + n * 4 * if confidence.is_some() { 2 } else { 1 });
    data.extend_from_slice(MAGIC);
    data.extend_from_slice(&VERSION.to_le_bytes());
    data.extend_from_slice(&dd.image_id.0.to_le_bytes());
    data.extend_from_slice(&dd.width().to_le_bytes());
    data.extend_from_slice(&dd.height().to_le_bytes());
    data.push(if confidence.is_some() { FLAG_CONFIDENCE } else { 0 });
    let (lo, hi) = dd.depth_range.unwrap_or((0.0, 0.0));
    data.extend_from_slice(&lo.to_le_bytes());
    data.extend_from_slice(&hi.to_le_bytes());
    for val in dd.depth_map.as_slice() {
        data.extend_from_slice(&val.to_le_bytes());
    }
    if let Some(conf) = confidence {
        for val in conf.as_slice() {
            data.extend_from_slice(&val.to_le_bytes());
        }
    }
    data
}

pub fn decode_depth_map(data: &[u8]) -> Result<DepthMapFile> {
    ensure!(data.len() >= HEADER_LEN, "depth map file is truncated ({} bytes)", data.len());
    if &data[0..4] != MAGIC {
        bail!("not a depth map file");
    }
    let mut offset = 4;
    let version = u16::from_le_bytes([data[offset], data[offset + 1]]);
    offset += 2;
    ensure!(version == VERSION, "unsupported depth map version {}", version);
    let image_id = ImageId(read_u32(data, &mut offset));
    let width = read_u32(data, &mut offset);
    let height = read_u32(data, &mut offset);
    let flags = data[offset];
    offset += 1;
    let lo = read_f32(data, &mut offset);
    let hi = read_f32(data, &mut offset);

    let n = (width as usize)
        .checked_mul(height as usize)
        .context("depth map size overflows")?;
    let planes = if flags & FLAG_CONFIDENCE != 0 { 2 } else { 1 };
    let expected = n
        .checked_mul(4 * planes)
        .and_then(|b| b.checked_add(HEADER_LEN))
        .context("depth map size overflows")?;
    ensure!(
        data.len() == expected,
        "depth map file has {} bytes, expected {}",
        data.len(),
        expected
    );

    let depth = read_plane(data, &mut offset, width, height)?;
    let confidence = if planes == 2 {
        Some(read_plane(data, &mut offset, width, height)?)
    } else {
        None
    };
    Ok(DepthMapFile {
        image_id,
        depth,
        confidence,
        depth_range: (hi > 0.0).then_some((lo, hi)),
    })
}

pub fn write_depth_map<P: AsRef<Path>>(path: P, dd: &DepthData) -> Result<()> {
    let path = path.as_ref();
    std::fs::write(path, encode_depth_map(dd)).with_context(|| format!("Failed to write {}", path.display()))
}

pub fn read_depth_map<P: AsRef<Path>>(path: P) -> Result<DepthMapFile> {
    let path = path.as_ref();
    let data = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    decode_depth_map(&data).with_context(|| format!("Invalid depth map {}", path.display()))
}

// Callers check the total length first.
fn read_u32(data: &[u8], offset: &mut usize) -> u32 {
    let b = &data[*offset..*offset + 4];
    *offset += 4;
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn read_f32(data: &[u8], offset: &mut usize) -> f32 {
    f32::from_bits(read_u32(data, offset))
}

fn read_plane(data: &[u8], offset: &mut usize, width: u32, height: u32) -> Result<Grid<f32>> {
    let n = width as usize * height as usize;
    let values: Vec<f32> = (0..n).map(|_| read_f32(data, offset)).collect();
    Grid::from_vec(width, height, values).context("depth plane size mismatch")
}
