//! Tile-wise accumulation of the SSB reconstruction.
//!
//! A tile carries a batch of scan positions and their raw frames. Each frame is
//! Fourier transformed and projected onto the trotter mask of its position; the
//! resulting scalar lands in that position's cell of a partial [`ResultGrid`].
//! Partial grids from different tiles have disjoint support and are combined
//! by addition, in any order.

use log::debug;
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Zip};
use num_complex::Complex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{SsbError, SsbResult};
use crate::fft2::Fft2;
use crate::geometry::Geometry;
use crate::trotter::MaskSource;

/// Complex reconstruction over the full scan raster.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultGrid {
    values: Array2<Complex<f64>>,
}

impl ResultGrid {
    pub fn zeros(scan_shape: [usize; 2]) -> Self {
        ResultGrid {
            values: Array2::zeros(scan_shape),
        }
    }

    pub fn shape(&self) -> [usize; 2] {
        [self.values.shape()[0], self.values.shape()[1]]
    }

    pub fn values(&self) -> ArrayView2<Complex<f64>> {
        self.values.view()
    }

    pub fn into_values(self) -> Array2<Complex<f64>> {
        self.values
    }

    pub fn get(&self, p: usize, q: usize) -> Option<Complex<f64>> {
        self.values.get((p, q)).copied()
    }

    fn check_shape(&self, other: &ResultGrid) -> SsbResult<()> {
        if self.values.shape() != other.values.shape() {
            return Err(SsbError::ShapeMismatch {
                expected: self.values.shape().to_vec(),
                found: other.values.shape().to_vec(),
            });
        }
        Ok(())
    }

    /// Element-wise sum of two grids of the same shape.
    pub fn merge(mut self, other: &ResultGrid) -> SsbResult<ResultGrid> {
        self.add_assign(other)?;
        Ok(self)
    }

    pub fn add_assign(&mut self, other: &ResultGrid) -> SsbResult<()> {
        self.check_shape(other)?;
        Zip::from(&mut self.values)
            .and(&other.values)
            .for_each(|a, &b| *a += b);
        Ok(())
    }
}

/// Boolean selection of scan positions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionOfInterest {
    selected: Array2<bool>,
}

impl RegionOfInterest {
    pub fn new(selected: Array2<bool>) -> Self {
        RegionOfInterest { selected }
    }

    /// Every position selected.
    pub fn full(scan_shape: [usize; 2]) -> Self {
        RegionOfInterest::new(Array2::from_elem(scan_shape, true))
    }

    pub fn shape(&self) -> [usize; 2] {
        [self.selected.shape()[0], self.selected.shape()[1]]
    }

    pub fn contains(&self, p: usize, q: usize) -> bool {
        self.selected.get((p, q)).copied().unwrap_or(false)
    }

    pub fn complement(&self) -> Self {
        RegionOfInterest::new(self.selected.mapv(|s| !s))
    }

    pub fn count(&self) -> usize {
        self.selected.iter().filter(|&&s| s).count()
    }

    pub fn check_shape(&self, scan_shape: [usize; 2]) -> SsbResult<()> {
        if self.shape() != scan_shape {
            return Err(SsbError::ShapeMismatch {
                expected: scan_shape.to_vec(),
                found: self.shape().to_vec(),
            });
        }
        Ok(())
    }
}

/// A batch of scan positions with one raw frame each, `frames[i]` belonging to `positions[i]`.
#[derive(Clone, Debug)]
pub struct Tile {
    pub positions: Vec<(usize, usize)>,
    pub frames: Array3<f64>,
}

impl Tile {
    pub fn new(positions: Vec<(usize, usize)>, frames: Array3<f64>) -> Self {
        Tile { positions, frames }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn frames(&self) -> ArrayView3<f64> {
        self.frames.view()
    }
}

/// Working precision of frames and results.
///
/// `Float32` rounds every frame and every projection through `f32`; the
/// transform and the accumulation still run in `f64`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    Float32,
    Float64,
}

impl Default for Dtype {
    fn default() -> Self {
        Dtype::Float64
    }
}

impl Dtype {
    fn round(self, v: f64) -> f64 {
        match self {
            Dtype::Float32 => v as f32 as f64,
            Dtype::Float64 => v,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelState {
    Empty,
    Accumulating,
    Finalized,
}

/// Applies trotter masks to tiles of frames and owns the merged result of a run.
///
/// [`process_tile`](Self::process_tile) only needs `&self` and can be called
/// from any number of threads at once. The partial grids it returns are
/// combined with [`ResultGrid::merge`] and handed to
/// [`merge_into`](Self::merge_into).
pub struct SsbReconstruction<M> {
    masks: M,
    fft: Fft2,
    dtype: Dtype,
    result: ResultGrid,
    state: KernelState,
}

impl<M: MaskSource> SsbReconstruction<M> {
    pub fn with_masks(masks: M) -> Self {
        let raster = masks.geometry().raster;
        SsbReconstruction {
            fft: Fft2::new(raster.frame_shape),
            dtype: Dtype::Float64,
            result: ResultGrid::zeros(raster.scan_shape),
            state: KernelState::Empty,
            masks,
        }
    }

    pub fn with_dtype(mut self, dtype: Dtype) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn masks(&self) -> &M {
        &self.masks
    }

    pub fn geometry(&self) -> &Geometry {
        self.masks.geometry()
    }

    pub fn state(&self) -> KernelState {
        self.state
    }

    fn validate(&self, tile: &Tile) -> SsbResult<()> {
        let raster = self.geometry().raster;
        let dim = tile.frames.dim();
        if dim.0 != tile.positions.len() {
            return Err(SsbError::ShapeMismatch {
                expected: vec![tile.positions.len(), raster.frame_shape[0], raster.frame_shape[1]],
                found: tile.frames.shape().to_vec(),
            });
        }
        if [dim.1, dim.2] != raster.frame_shape {
            return Err(SsbError::ShapeMismatch {
                expected: raster.frame_shape.to_vec(),
                found: vec![dim.1, dim.2],
            });
        }
        if let Some(&(p, q)) = tile.positions.iter().find(|&&(p, q)| !raster.contains(p, q)) {
            return Err(SsbError::IndexOutOfBounds {
                p,
                q,
                rows: raster.scan_shape[0],
                cols: raster.scan_shape[1],
            });
        }
        let mut seen = HashSet::with_capacity(tile.positions.len());
        if let Some(&(p, q)) = tile.positions.iter().find(|&&pos| !seen.insert(pos)) {
            return Err(SsbError::DuplicatePosition { p, q });
        }
        Ok(())
    }

    /// Partial grid holding the projections of every frame in `tile` at its scan position, zero elsewhere.
    ///
    /// The whole tile is rejected if any position lies outside the raster or
    /// appears twice, or if any frame has the wrong shape.
    pub fn process_tile(&self, tile: &Tile) -> SsbResult<ResultGrid> {
        if self.state == KernelState::Finalized {
            return Err(SsbError::Finalized);
        }
        self.validate(tile)?;

        let mut partial = ResultGrid::zeros(self.geometry().raster.scan_shape);
        for (&(p, q), frame) in tile.positions.iter().zip(tile.frames.outer_iter()) {
            let fft_frame = match self.dtype {
                Dtype::Float64 => self.fft.process_real(frame)?,
                Dtype::Float32 => {
                    let rounded = frame.mapv(|v| self.dtype.round(v));
                    self.fft.process_real(rounded.view())?
                }
            };
            let value = self.masks.project(p, q, fft_frame.view())?;
            partial.values[[p, q]] =
                Complex::new(self.dtype.round(value.re), self.dtype.round(value.im));
        }
        debug!("processed tile of {} frames", tile.len());
        Ok(partial)
    }

    /// Adds a partial grid into the run's result.
    pub fn merge_into(&mut self, partial: &ResultGrid) -> SsbResult<()> {
        if self.state == KernelState::Finalized {
            return Err(SsbError::Finalized);
        }
        self.result.add_assign(partial)?;
        self.state = KernelState::Accumulating;
        Ok(())
    }

    /// Processes a tile and merges it straight away.
    pub fn update(&mut self, tile: &Tile) -> SsbResult<()> {
        let partial = self.process_tile(tile)?;
        self.merge_into(&partial)
    }

    /// Closes the run and hands out the reconstruction. Later calls fail with [`SsbError::Finalized`].
    pub fn finalize(&mut self) -> SsbResult<ResultGrid> {
        if self.state == KernelState::Finalized {
            return Err(SsbError::Finalized);
        }
        self.state = KernelState::Finalized;
        let empty = ResultGrid::zeros(self.result.shape());
        Ok(std::mem::replace(&mut self.result, empty))
    }
}
