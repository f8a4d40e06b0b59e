//! Row-major per-pixel storage shared by depth, normal and confidence maps.

use anyhow::{anyhow, Result};
use nalgebra::Vector3;

/// Dense 2D grid laid out row by row in a single vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid<T> {
    width: u32,
    height: u32,
    data: Vec<T>,
}

/// Depth per pixel; `0.0` marks an invalid pixel.
pub type DepthMap = Grid<f32>;
/// Unit normal per pixel in the reference camera frame; zero where unknown.
pub type NormalMap = Grid<Vector3<f32>>;
/// Reliability in `[0, 1]` per pixel.
pub type ConfidenceMap = Grid<f32>;

impl<T: Clone> Grid<T> {
    /// Allocate a `width x height` grid filled with `fill`.
    ///
    /// Allocation failure is reported as an error instead of aborting, so an
    /// oversized image fails on its own.
    pub fn try_new(width: u32, height: u32, fill: T) -> Result<Self> {
        let len = (width as usize)
            .checked_mul(height as usize)
            .ok_or_else(|| anyhow!("grid size {}x{} overflows", width, height))?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|e| anyhow!("cannot allocate {}x{} grid: {}", width, height, e))?;
        data.resize(len, fill);
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn fill(&mut self, value: T) {
        self.data.iter_mut().for_each(|v| *v = value.clone());
    }
}

impl<T> Grid<T> {
    /// Zero-sized grid.
    pub fn empty() -> Self {
        Self {
            width: 0,
            height: 0,
            data: Vec::new(),
        }
    }

    /// Wrap an existing buffer. None if the length does not match.
    pub fn from_vec(width: u32, height: u32, data: Vec<T>) -> Option<Self> {
        (data.len() == width as usize * height as usize).then_some(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> &T {
        &self.data[self.index(x, y)]
    }

    #[inline]
    pub fn get_mut(&mut self, x: u32, y: u32) -> &mut T {
        let i = self.index(x, y);
        &mut self.data[i]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, value: T) {
        let i = self.index(x, y);
        self.data[i] = value;
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// 4-connected neighbors of (x, y) inside the grid.
    pub fn neighbors4(&self, x: u32, y: u32) -> impl Iterator<Item = (u32, u32)> {
        let (w, h) = (self.width, self.height);
        let candidates = [
            (x.checked_sub(1), Some(y)),
            ((x + 1 < w).then_some(x + 1), Some(y)),
            (Some(x), y.checked_sub(1)),
            (Some(x), (y + 1 < h).then_some(y + 1)),
        ];
        candidates
            .into_iter()
            .filter_map(|(nx, ny)| Some((nx?, ny?)))
    }
}

impl Grid<f32> {
    /// Number of strictly positive entries.
    pub fn count_valid(&self) -> usize {
        self.data.iter().filter(|&&d| d > 0.0).count()
    }

    #[inline]
    pub fn is_valid(&self, x: u32, y: u32) -> bool {
        *self.get(x, y) > 0.0
    }
}
