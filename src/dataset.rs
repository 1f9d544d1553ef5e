//! In-memory 4D dataset split into partitions and tiles, and a parallel executor over it.
//!
//! Partitions are contiguous ranges of scan positions in row-major order and
//! are processed in parallel. Each partition is walked tile by tile; a tile
//! holds up to `tile_depth` consecutive positions, restricted to the ROI.

use log::{debug, info};
use ndarray::parallel::prelude::{IntoParallelIterator, ParallelIterator};
use ndarray::{s, Array3, Array4};
use std::ops::Range;

use crate::error::{SsbError, SsbResult};
use crate::reconstruction::{RegionOfInterest, ResultGrid, SsbReconstruction, Tile};
use crate::trotter::MaskSource;

/// Frames indexed as `(row, col, y, x)`.
#[derive(Clone, Debug)]
pub struct MemoryDataset {
    data: Array4<f64>,
    tile_depth: usize,
    num_partitions: usize,
}

impl MemoryDataset {
    pub fn new(data: Array4<f64>, tile_depth: usize, num_partitions: usize) -> SsbResult<Self> {
        if tile_depth == 0 {
            return Err(SsbError::InvalidParameter(
                "tile depth must be positive".to_string(),
            ));
        }
        if num_partitions == 0 {
            return Err(SsbError::InvalidParameter(
                "number of partitions must be positive".to_string(),
            ));
        }
        if data.shape().iter().any(|&n| n == 0) {
            return Err(SsbError::InvalidParameter(format!(
                "dataset shape must be positive, got {:?}",
                data.shape()
            )));
        }
        Ok(MemoryDataset {
            data,
            tile_depth,
            num_partitions,
        })
    }

    pub fn scan_shape(&self) -> [usize; 2] {
        [self.data.shape()[0], self.data.shape()[1]]
    }

    pub fn frame_shape(&self) -> [usize; 2] {
        [self.data.shape()[2], self.data.shape()[3]]
    }

    /// Contiguous, near equal ranges of flat scan indices covering the raster.
    pub fn partitions(&self) -> Vec<Range<usize>> {
        let n = self.scan_shape()[0] * self.scan_shape()[1];
        let parts = self.num_partitions.min(n);
        (0..parts)
            .map(|i| (i * n / parts)..((i + 1) * n / parts))
            .collect()
    }

    /// Tiles of one partition. Tiles with no selected position are skipped.
    pub fn tiles<'a>(
        &'a self,
        partition: Range<usize>,
        roi: Option<&'a RegionOfInterest>,
    ) -> impl Iterator<Item = Tile> + 'a {
        let cols = self.scan_shape()[1];
        let tile_depth = self.tile_depth;
        let starts = partition.clone().step_by(tile_depth);
        starts.filter_map(move |start| {
            let end = (start + tile_depth).min(partition.end);
            let positions: Vec<_> = (start..end)
                .map(|i| (i / cols, i % cols))
                .filter(|&(p, q)| roi.map_or(true, |roi| roi.contains(p, q)))
                .collect();
            if positions.is_empty() {
                None
            } else {
                Some(self.gather(positions))
            }
        })
    }

    fn gather(&self, positions: Vec<(usize, usize)>) -> Tile {
        let [height, width] = self.frame_shape();
        let mut frames = Array3::zeros((positions.len(), height, width));
        for (mut frame, &(p, q)) in frames.outer_iter_mut().zip(&positions) {
            frame.assign(&self.data.slice(s![p, q, .., ..]));
        }
        Tile::new(positions, frames)
    }
}

/// Reconstructs `dataset`, optionally restricted to `roi`, and finalizes `kernel`.
///
/// Partitions run in parallel and their partial grids are summed with a
/// reduction tree. Positions outside the ROI stay zero. The first error aborts
/// the run and leaves `kernel` untouched.
pub fn run<M: MaskSource>(
    kernel: &mut SsbReconstruction<M>,
    dataset: &MemoryDataset,
    roi: Option<&RegionOfInterest>,
) -> SsbResult<ResultGrid> {
    let scan_shape = kernel.geometry().raster.scan_shape;
    if dataset.scan_shape() != scan_shape {
        return Err(SsbError::ShapeMismatch {
            expected: scan_shape.to_vec(),
            found: dataset.scan_shape().to_vec(),
        });
    }
    if let Some(roi) = roi {
        roi.check_shape(scan_shape)?;
    }

    let partitions = dataset.partitions();
    info!(
        "reconstructing {:?} scan over {} partitions",
        scan_shape,
        partitions.len()
    );

    let shared: &SsbReconstruction<M> = kernel;
    let total = partitions
        .into_par_iter()
        .map(|partition| -> SsbResult<ResultGrid> {
            let mut partial = ResultGrid::zeros(scan_shape);
            let mut tiles = 0;
            for tile in dataset.tiles(partition.clone(), roi) {
                partial.add_assign(&shared.process_tile(&tile)?)?;
                tiles += 1;
            }
            debug!("partition {:?} done in {} tiles", partition, tiles);
            Ok(partial)
        })
        .try_reduce(|| ResultGrid::zeros(scan_shape), |a, b| a.merge(&b))?;

    kernel.merge_into(&total)?;
    kernel.finalize()
}
