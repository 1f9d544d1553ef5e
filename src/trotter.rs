//! Trotter masks: the per scan position filters of the single-side-band method.
//!
//! For a scan frequency `(p, q)` the primary beam interferes with two copies of
//! itself shifted by `±s(p, q)`. The regions of the central disk overlapped by
//! only one of the copies ("trotters") carry the side bands. The mask averages
//! the FFT'd frame over each trotter and takes half their difference.
//!
//! Masks for rows past `rows / 2` are the negated masks of the mirrored scan
//! frequency, since mirroring the frequency swaps the two shifted copies. Only
//! the upper half of the raster is stored, see [`resolve`].

use log::{debug, info, trace};
use ndarray::parallel::prelude::{IntoParallelIterator, ParallelIterator};
use ndarray::{Array1, Array2, ArrayView2, ArrayView3, Zip};
use num_complex::Complex;
use rustfft::num_traits::Zero;
use serde::{Deserialize, Serialize};

use crate::error::{SsbError, SsbResult};
use crate::geometry::Geometry;
use crate::mask::circular;

/// Sparse real filter over one diffraction frame.
///
/// Entries are `(flat pixel index, weight)` in ascending pixel order, the flat
/// index being `y * width + x`.
#[derive(Clone, Debug, PartialEq)]
pub struct TrotterMask {
    pub frame_shape: [usize; 2],
    pub indices: Vec<usize>,
    pub weights: Vec<f64>,
}

impl TrotterMask {
    pub fn empty(frame_shape: [usize; 2]) -> Self {
        TrotterMask {
            frame_shape,
            indices: Vec::new(),
            weights: Vec::new(),
        }
    }

    /// Keeps the nonzero pixels of a dense filter.
    pub fn from_dense(dense: ArrayView2<f64>) -> Self {
        let frame_shape = [dense.shape()[0], dense.shape()[1]];
        let width = frame_shape[1];
        let mut mask = TrotterMask::empty(frame_shape);
        for ((y, x), &w) in dense.indexed_iter() {
            if w != 0.0 {
                mask.indices.push(y * width + x);
                mask.weights.push(w);
            }
        }
        mask
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn nnz(&self) -> usize {
        self.indices.len()
    }

    pub fn sum(&self) -> f64 {
        self.weights.iter().sum()
    }

    pub fn negated(&self) -> Self {
        TrotterMask {
            frame_shape: self.frame_shape,
            indices: self.indices.clone(),
            weights: self.weights.iter().map(|w| -w).collect(),
        }
    }

    pub fn to_dense(&self) -> Array2<f64> {
        let mut dense = Array2::zeros(self.frame_shape);
        let width = self.frame_shape[1];
        for (&i, &w) in self.indices.iter().zip(&self.weights) {
            dense[[i / width, i % width]] = w;
        }
        dense
    }

    /// Sum of the FFT'd frame weighted by the mask.
    pub fn project(&self, fft_frame: ArrayView2<Complex<f64>>) -> SsbResult<Complex<f64>> {
        if fft_frame.shape() != &self.frame_shape[..] {
            return Err(SsbError::ShapeMismatch {
                expected: self.frame_shape.to_vec(),
                found: fft_frame.shape().to_vec(),
            });
        }
        Ok(project_entries(&self.indices, &self.weights, 1.0, fft_frame))
    }
}

/// Weighted sum over sparse entries. `sign` is +1.0 or -1.0 and is applied to
/// each weight before the product, which keeps a negated stored row bit
/// identical to a freshly rasterized negated mask.
fn project_entries(
    indices: &[usize],
    weights: &[f64],
    sign: f64,
    fft_frame: ArrayView2<Complex<f64>>,
) -> Complex<f64> {
    match fft_frame.as_slice() {
        Some(flat) => indices
            .iter()
            .zip(weights)
            .fold(Complex::zero(), |acc, (&i, &w)| acc + flat[i] * (sign * w)),
        None => {
            let width = fft_frame.shape()[1];
            indices.iter().zip(weights).fold(Complex::zero(), |acc, (&i, &w)| {
                acc + fft_frame[[i / width, i % width]] * (sign * w)
            })
        }
    }
}

/// The two side-band regions of one scan position before normalisation.
#[derive(Clone, Debug)]
pub struct SideBands {
    /// `center · positive · [negative == 0]`
    pub positive: Array2<f64>,
    /// `center · negative · [positive == 0]`
    pub negative: Array2<f64>,
    pub positive_sum: f64,
    pub negative_sum: f64,
}

/// Rasterizes trotter masks for a fixed geometry.
///
/// The central disk is rasterized once and reused for every position.
#[derive(Clone, Debug)]
pub struct TrotterMaskBuilder {
    geometry: Geometry,
    center: Array2<f64>,
    center_sum: f64,
}

impl TrotterMaskBuilder {
    pub fn new(geometry: Geometry) -> SsbResult<Self> {
        let center = disk(&geometry, 0.0, 0.0);
        let center_sum = center.sum();
        if center_sum <= 0.0 {
            return Err(SsbError::InvalidParameter(format!(
                "primary beam at {:?} with radius {} does not intersect the {:?} frame",
                geometry.raster.center, geometry.params.semiconv_pix, geometry.raster.frame_shape
            )));
        }
        Ok(TrotterMaskBuilder {
            geometry,
            center,
            center_sum,
        })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Antialiased occupancy of the undeflected primary beam.
    pub fn center_disk(&self) -> &Array2<f64> {
        &self.center
    }

    pub fn side_bands(&self, p: usize, q: usize) -> SsbResult<SideBands> {
        self.check_position(p, q)?;
        let (sy, sx) = self.geometry.shift(p, q);
        let positive_disk = disk(&self.geometry, sy, sx);
        let negative_disk = disk(&self.geometry, -sy, -sx);

        let mut positive = Array2::zeros(self.center.dim());
        let mut negative = Array2::zeros(self.center.dim());
        Zip::from(&mut positive)
            .and(&mut negative)
            .and(&self.center)
            .and(&positive_disk)
            .and(&negative_disk)
            .par_for_each(|pos, neg, &c, &dp, &dn| {
                *pos = if dn == 0.0 { c * dp } else { 0.0 };
                *neg = if dp == 0.0 { c * dn } else { 0.0 };
            });

        let positive_sum = positive.sum();
        let negative_sum = negative.sum();
        Ok(SideBands {
            positive,
            negative,
            positive_sum,
            negative_sum,
        })
    }

    /// Trotter mask of scan position `(p, q)`, rasterized directly.
    pub fn build(&self, p: usize, q: usize) -> SsbResult<TrotterMask> {
        if p == 0 && q == 0 {
            return Ok(self.zero_order());
        }

        let bands = self.side_bands(p, q)?;
        let (sum_p, sum_n) = (bands.positive_sum, bands.negative_sum);

        if sum_p >= 1.0 && sum_n >= 1.0 {
            let width = self.geometry.raster.frame_shape[1];
            let mut mask = TrotterMask::empty(self.geometry.raster.frame_shape);
            for ((idx, &mp), &mn) in bands.positive.indexed_iter().zip(bands.negative.iter()) {
                let w = (mp / sum_p - mn / sum_n) / 2.0;
                if w != 0.0 {
                    mask.indices.push(idx.0 * width + idx.1);
                    mask.weights.push(w);
                }
            }
            Ok(mask)
        } else if sum_p < 1.0 && sum_n < 1.0 {
            trace!(
                "empty trotter at ({}, {}): overlaps {} and {}",
                p,
                q,
                sum_p,
                sum_n
            );
            Ok(TrotterMask::empty(self.geometry.raster.frame_shape))
        } else {
            Err(SsbError::GeometryInconsistency {
                p,
                q,
                positive: sum_p,
                negative: sum_n,
            })
        }
    }

    /// Bright field term at `(0, 0)`: the occupancy weighted mean over the central disk.
    pub fn zero_order(&self) -> TrotterMask {
        TrotterMask::from_dense(self.center.mapv(|c| c / self.center_sum).view())
    }

    /// Masks of the stored half raster, rows `0 ..= rows / 2`.
    pub fn build_set(&self) -> SsbResult<TrotterMaskSet> {
        let stored_rows = self.geometry.raster.half_rows();
        self.build_rows(stored_rows)
    }

    /// Masks of rows `0 .. stored_rows`, every one rasterized directly.
    pub fn build_rows(&self, stored_rows: usize) -> SsbResult<TrotterMaskSet> {
        let cols = self.geometry.raster.scan_shape[1];
        let masks = (0..stored_rows * cols)
            .into_par_iter()
            .map(|i| self.build(i / cols, i % cols))
            .collect::<SsbResult<Vec<_>>>()?;
        let set = TrotterMaskSet::from_masks(self.geometry, stored_rows, &masks)?;
        info!(
            "built {} trotter masks for a {:?} raster, {} nonzero weights",
            set.nrows(),
            self.geometry.raster.scan_shape,
            set.nnz()
        );
        Ok(set)
    }

    fn check_position(&self, p: usize, q: usize) -> SsbResult<()> {
        check_position(&self.geometry, p, q)
    }
}

fn check_position(geometry: &Geometry, p: usize, q: usize) -> SsbResult<()> {
    if geometry.raster.contains(p, q) {
        Ok(())
    } else {
        Err(SsbError::IndexOutOfBounds {
            p,
            q,
            rows: geometry.raster.scan_shape[0],
            cols: geometry.raster.scan_shape[1],
        })
    }
}

fn disk(geometry: &Geometry, sy: f64, sx: f64) -> Array2<f64> {
    let (cy, cx) = geometry.raster.center;
    let [height, width] = geometry.raster.frame_shape;
    circular(
        cx + sx,
        cy + sy,
        width,
        height,
        geometry.params.semiconv_pix,
        true,
    )
}

/// Masks of the first `stored_rows` raster rows as one compressed sparse row matrix.
///
/// Matrix row `p * cols + q` is the mask of scan position `(p, q)`, columns
/// are flat frame pixels, so the shape is `(stored_rows * cols, height * width)`.
#[derive(Clone, Debug, PartialEq)]
pub struct TrotterMaskSet {
    geometry: Geometry,
    stored_rows: usize,
    indptr: Vec<usize>,
    indices: Vec<usize>,
    data: Vec<f64>,
}

impl TrotterMaskSet {
    pub fn from_masks(
        geometry: Geometry,
        stored_rows: usize,
        masks: &[TrotterMask],
    ) -> SsbResult<Self> {
        let cols = geometry.raster.scan_shape[1];
        if masks.len() != stored_rows * cols {
            return Err(SsbError::ShapeMismatch {
                expected: vec![stored_rows * cols],
                found: vec![masks.len()],
            });
        }
        let nnz: usize = masks.iter().map(TrotterMask::nnz).sum();
        let mut indptr = Vec::with_capacity(masks.len() + 1);
        let mut indices = Vec::with_capacity(nnz);
        let mut data = Vec::with_capacity(nnz);
        indptr.push(0);
        for mask in masks {
            if mask.frame_shape != geometry.raster.frame_shape {
                return Err(SsbError::ShapeMismatch {
                    expected: geometry.raster.frame_shape.to_vec(),
                    found: mask.frame_shape.to_vec(),
                });
            }
            indices.extend_from_slice(&mask.indices);
            data.extend_from_slice(&mask.weights);
            indptr.push(indices.len());
        }
        Ok(TrotterMaskSet {
            geometry,
            stored_rows,
            indptr,
            indices,
            data,
        })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Number of raster rows held.
    pub fn stored_rows(&self) -> usize {
        self.stored_rows
    }

    pub fn nrows(&self) -> usize {
        self.indptr.len() - 1
    }

    /// `(stored_rows * cols, height * width)`
    pub fn shape(&self) -> (usize, usize) {
        (self.nrows(), self.geometry.raster.frame_len())
    }

    pub fn nnz(&self) -> usize {
        self.data.len()
    }

    pub fn indptr(&self) -> &[usize] {
        &self.indptr
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    fn row_index(&self, p: usize, q: usize) -> Option<usize> {
        if p < self.stored_rows && q < self.geometry.raster.scan_shape[1] {
            Some(p * self.geometry.raster.scan_shape[1] + q)
        } else {
            None
        }
    }

    fn row(&self, row: usize) -> (&[usize], &[f64]) {
        let range = self.indptr[row]..self.indptr[row + 1];
        (&self.indices[range.clone()], &self.data[range])
    }

    /// Mask of a stored position, `None` outside the stored rows.
    pub fn mask(&self, p: usize, q: usize) -> Option<TrotterMask> {
        let (indices, weights) = self.row(self.row_index(p, q)?);
        Some(TrotterMask {
            frame_shape: self.geometry.raster.frame_shape,
            indices: indices.to_vec(),
            weights: weights.to_vec(),
        })
    }

    pub fn to_dense(&self) -> Array2<f64> {
        let width = self.geometry.raster.frame_len();
        let mut dense = Array2::zeros((self.nrows(), width));
        for row in 0..self.nrows() {
            let (indices, weights) = self.row(row);
            for (&i, &w) in indices.iter().zip(weights) {
                dense[[row, i]] = w;
            }
        }
        dense
    }

    /// Projections of one FFT'd frame onto every stored mask: the sparse matrix times the flattened frame.
    pub fn apply(&self, fft_frame: ArrayView2<Complex<f64>>) -> SsbResult<Array1<Complex<f64>>> {
        if fft_frame.shape() != &self.geometry.raster.frame_shape[..] {
            return Err(SsbError::ShapeMismatch {
                expected: self.geometry.raster.frame_shape.to_vec(),
                found: fft_frame.shape().to_vec(),
            });
        }
        let values: Vec<_> = (0..self.nrows())
            .into_par_iter()
            .map(|row| {
                let (indices, weights) = self.row(row);
                project_entries(indices, weights, 1.0, fft_frame)
            })
            .collect();
        Ok(Array1::from(values))
    }

    /// Projections of a stack of FFT'd frames, the sparse matrix times the
    /// matrix of flattened frames. Output is `(n_frames, nrows)`, row `i`
    /// equal to [`apply`](Self::apply) on `fft_frames[i]`.
    pub fn apply_batch(
        &self,
        fft_frames: ArrayView3<Complex<f64>>,
    ) -> SsbResult<Array2<Complex<f64>>> {
        let (n_frames, height, width) = fft_frames.dim();
        if [height, width] != self.geometry.raster.frame_shape {
            return Err(SsbError::ShapeMismatch {
                expected: self.geometry.raster.frame_shape.to_vec(),
                found: vec![height, width],
            });
        }
        let mut projections = Array2::zeros((n_frames, self.nrows()));
        Zip::indexed(projections.columns_mut()).par_for_each(|row, mut column| {
            let (indices, weights) = self.row(row);
            for (value, frame) in column.iter_mut().zip(fft_frames.outer_iter()) {
                *value = project_entries(indices, weights, 1.0, frame);
            }
        });
        Ok(projections)
    }
}

/// Where the mask of a scan position comes from, given `stored_rows` stored raster rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaskLocation {
    /// Stored at this position
    Stored { p: usize, q: usize },
    /// Negation of the stored mask at the mirrored position
    Mirrored { p: usize, q: usize },
    /// Not recoverable by symmetry: the mirrored frequency folds onto the
    /// Nyquist index, which does not change sign.
    Rasterize,
}

/// Maps a scan position inside the raster onto the stored rows.
pub fn resolve(geometry: &Geometry, stored_rows: usize, p: usize, q: usize) -> MaskLocation {
    debug_assert!(geometry.raster.contains(p, q));
    if p < stored_rows {
        return MaskLocation::Stored { p, q };
    }
    let [rows, cols] = geometry.raster.scan_shape;
    let (mp, mq) = ((rows - p) % rows, (cols - q) % cols);
    let (real_p, real_q) = geometry.real_indices(p, q);
    if mp < stored_rows && geometry.real_indices(mp, mq) == (-real_p, -real_q) {
        MaskLocation::Mirrored { p: mp, q: mq }
    } else {
        MaskLocation::Rasterize
    }
}

/// Anything that can hand out the trotter mask of a scan position.
pub trait MaskSource: Send + Sync {
    fn geometry(&self) -> &Geometry;

    fn mask(&self, p: usize, q: usize) -> SsbResult<TrotterMask>;

    /// Projection of an FFT'd frame onto the mask of `(p, q)`.
    fn project(
        &self,
        p: usize,
        q: usize,
        fft_frame: ArrayView2<Complex<f64>>,
    ) -> SsbResult<Complex<f64>> {
        self.mask(p, q)?.project(fft_frame)
    }
}

/// Precomputed half raster, with symmetry lookup for the remaining rows.
#[derive(Clone, Debug)]
pub struct EagerMasks {
    builder: TrotterMaskBuilder,
    set: TrotterMaskSet,
}

impl EagerMasks {
    pub fn new(geometry: Geometry) -> SsbResult<Self> {
        let builder = TrotterMaskBuilder::new(geometry)?;
        let set = builder.build_set()?;
        Ok(EagerMasks { builder, set })
    }

    pub fn mask_set(&self) -> &TrotterMaskSet {
        &self.set
    }

    pub fn locate(&self, p: usize, q: usize) -> SsbResult<MaskLocation> {
        check_position(self.builder.geometry(), p, q)?;
        Ok(resolve(
            self.builder.geometry(),
            self.set.stored_rows(),
            p,
            q,
        ))
    }

    /// Every raster row held explicitly, filled from this half set through the symmetry lookup.
    pub fn materialize_full(&self) -> SsbResult<EagerMasks> {
        let [rows, cols] = self.builder.geometry().raster.scan_shape;
        let masks = (0..rows * cols)
            .into_par_iter()
            .map(|i| self.mask(i / cols, i % cols))
            .collect::<SsbResult<Vec<_>>>()?;
        let set = TrotterMaskSet::from_masks(*self.builder.geometry(), rows, &masks)?;
        debug!("materialized {} trotter masks", set.nrows());
        Ok(EagerMasks {
            builder: self.builder.clone(),
            set,
        })
    }
}

impl MaskSource for EagerMasks {
    fn geometry(&self) -> &Geometry {
        self.builder.geometry()
    }

    fn mask(&self, p: usize, q: usize) -> SsbResult<TrotterMask> {
        match self.locate(p, q)? {
            MaskLocation::Stored { p, q } => self
                .set
                .mask(p, q)
                .ok_or_else(|| unreachable_location(&self.set, p, q)),
            MaskLocation::Mirrored { p, q } => self
                .set
                .mask(p, q)
                .map(|m| m.negated())
                .ok_or_else(|| unreachable_location(&self.set, p, q)),
            MaskLocation::Rasterize => self.builder.build(p, q),
        }
    }

    fn project(
        &self,
        p: usize,
        q: usize,
        fft_frame: ArrayView2<Complex<f64>>,
    ) -> SsbResult<Complex<f64>> {
        let geometry = self.builder.geometry();
        if fft_frame.shape() != &geometry.raster.frame_shape[..] {
            return Err(SsbError::ShapeMismatch {
                expected: geometry.raster.frame_shape.to_vec(),
                found: fft_frame.shape().to_vec(),
            });
        }
        let (row, sign) = match self.locate(p, q)? {
            MaskLocation::Stored { p, q } => (self.set.row_index(p, q), 1.0),
            MaskLocation::Mirrored { p, q } => (self.set.row_index(p, q), -1.0),
            MaskLocation::Rasterize => return self.builder.build(p, q)?.project(fft_frame),
        };
        let row = row.ok_or_else(|| unreachable_location(&self.set, p, q))?;
        let (indices, weights) = self.set.row(row);
        Ok(project_entries(indices, weights, sign, fft_frame))
    }
}

fn unreachable_location(set: &TrotterMaskSet, p: usize, q: usize) -> SsbError {
    SsbError::IndexOutOfBounds {
        p,
        q,
        rows: set.stored_rows(),
        cols: set.geometry().raster.scan_shape[1],
    }
}

/// Rasterizes each mask when it is asked for. Trades CPU for memory.
#[derive(Clone, Debug)]
pub struct LazyMasks {
    builder: TrotterMaskBuilder,
}

impl LazyMasks {
    pub fn new(geometry: Geometry) -> SsbResult<Self> {
        Ok(LazyMasks {
            builder: TrotterMaskBuilder::new(geometry)?,
        })
    }
}

impl MaskSource for LazyMasks {
    fn geometry(&self) -> &Geometry {
        self.builder.geometry()
    }

    fn mask(&self, p: usize, q: usize) -> SsbResult<TrotterMask> {
        self.builder.build(p, q)
    }
}

/// How trotter masks are realized.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskMode {
    /// Build the half raster up front
    Eager,
    /// Rasterize per scan position on demand
    Lazy,
}

impl Default for MaskMode {
    fn default() -> Self {
        MaskMode::Eager
    }
}

/// Mask source selected by [`MaskMode`].
#[derive(Clone, Debug)]
pub enum Masks {
    Eager(EagerMasks),
    Lazy(LazyMasks),
}

impl Masks {
    pub fn new(geometry: Geometry, mode: MaskMode) -> SsbResult<Self> {
        Ok(match mode {
            MaskMode::Eager => Masks::Eager(EagerMasks::new(geometry)?),
            MaskMode::Lazy => Masks::Lazy(LazyMasks::new(geometry)?),
        })
    }
}

impl MaskSource for Masks {
    fn geometry(&self) -> &Geometry {
        match self {
            Masks::Eager(m) => m.geometry(),
            Masks::Lazy(m) => m.geometry(),
        }
    }

    fn mask(&self, p: usize, q: usize) -> SsbResult<TrotterMask> {
        match self {
            Masks::Eager(m) => m.mask(p, q),
            Masks::Lazy(m) => m.mask(p, q),
        }
    }

    fn project(
        &self,
        p: usize,
        q: usize,
        fft_frame: ArrayView2<Complex<f64>>,
    ) -> SsbResult<Complex<f64>> {
        match self {
            Masks::Eager(m) => m.project(p, q, fft_frame),
            Masks::Lazy(m) => m.project(p, q, fft_frame),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        resolve, EagerMasks, LazyMasks, MaskLocation, MaskSource, TrotterMask, TrotterMaskBuilder,
    };
    use crate::error::SsbError;
    use crate::fft2::fft2;
    use crate::geometry::{Geometry, PhysicalParameters, RasterGeometry};
    use ndarray::{Array2, Array3};

    fn params(dpix: f64, semiconv_pix: f64) -> PhysicalParameters {
        PhysicalParameters {
            voltage_kev: 300.0,
            dpix,
            semiconv: 25e-3,
            semiconv_pix,
            angle: 0.0,
        }
    }

    // shifts of up to ~3 px, disks well inside the frame
    fn geometry() -> Geometry {
        let raster = RasterGeometry::new([7, 8], [33, 35], Some((16.0, 17.0))).unwrap();
        Geometry::new(params(1e-10, 8.0), raster).unwrap()
    }

    /// Geometry whose shift per column index is `shift` frame pixels.
    fn geometry_with_column_shift(
        cols: usize,
        shift: f64,
        center: (f64, f64),
        semiconv_pix: f64,
    ) -> Geometry {
        let raster = RasterGeometry::new([2, cols], [32, 32], Some(center)).unwrap();
        let probe = Geometry::new(params(1e-10, semiconv_pix), raster).unwrap();
        let dpix = 1.0 / (cols as f64 * shift * probe.d_kf);
        Geometry::new(params(dpix, semiconv_pix), raster).unwrap()
    }

    fn test_frame(shape: [usize; 2]) -> Array2<f64> {
        Array2::from_shape_fn(shape, |(y, x)| ((y * 31 + x * 17) % 13) as f64 + 0.25 * y as f64)
    }

    #[test]
    fn test_zero_order_is_normalised_center() {
        let builder = TrotterMaskBuilder::new(geometry()).unwrap();
        let mask = builder.build(0, 0).unwrap();
        assert!((mask.sum() - 1.0).abs() < 1e-12);
        let center = builder.center_disk();
        let expected = center.mapv(|c| c / center.sum());
        assert_eq!(mask.to_dense(), expected);
    }

    #[test]
    fn test_side_bands_normalise_to_one() {
        let builder = TrotterMaskBuilder::new(geometry()).unwrap();
        let mut non_empty = 0;
        for p in 0..4 {
            for q in 0..8 {
                if (p, q) == (0, 0) {
                    continue;
                }
                let bands = builder.side_bands(p, q).unwrap();
                let mask = builder.build(p, q).unwrap();
                if mask.is_empty() {
                    assert!(bands.positive_sum < 1.0 && bands.negative_sum < 1.0);
                    continue;
                }
                non_empty += 1;
                let positive = bands.positive.mapv(|v| v / bands.positive_sum).sum();
                let negative = bands.negative.mapv(|v| v / bands.negative_sum).sum();
                assert!((positive - 1.0).abs() < 1e-12, "({}, {}): {}", p, q, positive);
                assert!((negative - 1.0).abs() < 1e-12, "({}, {}): {}", p, q, negative);

                // the two trotters are disjoint, so the weights split into +1/2 and -1/2
                let up: f64 = mask.weights.iter().filter(|&&w| w > 0.0).sum();
                let down: f64 = mask.weights.iter().filter(|&&w| w < 0.0).sum();
                assert!((up - 0.5).abs() < 1e-12);
                assert!((down + 0.5).abs() < 1e-12);
            }
        }
        assert!(non_empty > 0);
    }

    #[test]
    fn test_mirrored_mask_is_negated() {
        let geometry = geometry();
        let builder = TrotterMaskBuilder::new(geometry).unwrap();
        let stored_rows = geometry.raster.half_rows();
        for p in stored_rows..7 {
            for q in 0..8 {
                match resolve(&geometry, stored_rows, p, q) {
                    MaskLocation::Mirrored { p: mp, q: mq } => {
                        assert_eq!((mp, mq), ((7 - p) % 7, (8 - q) % 8));
                        let direct = builder.build(p, q).unwrap();
                        let mirrored = builder.build(mp, mq).unwrap();
                        assert_eq!(direct, mirrored.negated());
                    }
                    MaskLocation::Rasterize => assert_eq!(q, 4),
                    MaskLocation::Stored { .. } => panic!("({}, {}) is not stored", p, q),
                }
            }
        }
    }

    #[test]
    fn test_nyquist_column_falls_back_to_rasterizing() {
        let geometry = geometry();
        assert_eq!(resolve(&geometry, 4, 5, 4), MaskLocation::Rasterize);
        assert_eq!(resolve(&geometry, 4, 5, 3), MaskLocation::Mirrored { p: 2, q: 5 });
        assert_eq!(resolve(&geometry, 4, 3, 4), MaskLocation::Stored { p: 3, q: 4 });
    }

    #[test]
    fn test_mask_set_layout() {
        let geometry = geometry();
        let eager = EagerMasks::new(geometry).unwrap();
        let set = eager.mask_set();
        assert_eq!(set.stored_rows(), 4);
        assert_eq!(set.shape(), (4 * 8, 33 * 35));
        assert_eq!(set.indptr().len(), 4 * 8 + 1);
        assert_eq!(set.indices().len(), set.nnz());
        assert_eq!(set.data().len(), set.nnz());

        let dense = set.to_dense();
        let builder = TrotterMaskBuilder::new(geometry).unwrap();
        for (p, q) in [(0, 0), (1, 3), (3, 7), (2, 4)].iter().copied() {
            let row = dense.row(p * 8 + q).to_owned().into_shape((33, 35)).unwrap();
            assert_eq!(row, builder.build(p, q).unwrap().to_dense());
        }
        assert_eq!(set.mask(4, 0), None);
    }

    #[test]
    fn test_apply_matches_per_mask_projection() {
        let eager = EagerMasks::new(geometry()).unwrap();
        let fft_frame = fft2(test_frame([33, 35]).view());
        let batched = eager.mask_set().apply(fft_frame.view()).unwrap();
        for p in 0..4 {
            for q in 0..8 {
                let single = eager.project(p, q, fft_frame.view()).unwrap();
                assert_eq!(batched[p * 8 + q], single);
            }
        }
        assert!(eager.mask_set().apply(Array2::zeros((3, 3)).view()).is_err());
    }

    #[test]
    fn test_apply_batch_matches_apply_per_frame() {
        let eager = EagerMasks::new(geometry()).unwrap();
        let set = eager.mask_set();
        let mut fft_frames = Array3::zeros((3, 33, 35));
        for (i, mut slot) in fft_frames.outer_iter_mut().enumerate() {
            let frame = test_frame([33, 35]).mapv(|v| v * (i + 1) as f64 + i as f64);
            slot.assign(&fft2(frame.view()));
        }

        let batched = set.apply_batch(fft_frames.view()).unwrap();
        assert_eq!(batched.dim(), (3, 4 * 8));
        for (i, frame) in fft_frames.outer_iter().enumerate() {
            assert_eq!(batched.row(i), set.apply(frame).unwrap());
        }

        let empty = set.apply_batch(Array3::zeros((0, 33, 35)).view()).unwrap();
        assert_eq!(empty.dim(), (0, 4 * 8));
        assert!(matches!(
            set.apply_batch(Array3::zeros((2, 33, 34)).view()),
            Err(SsbError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_eager_lazy_and_full_sets_agree() {
        let mut rotated = geometry();
        rotated.params.angle = 1.1;
        for &geometry in &[geometry(), rotated] {
            assert_sources_agree(geometry);
        }
    }

    fn assert_sources_agree(geometry: Geometry) {
        let eager = EagerMasks::new(geometry).unwrap();
        let lazy = LazyMasks::new(geometry).unwrap();
        let full = eager.materialize_full().unwrap();
        assert_eq!(full.mask_set().stored_rows(), 7);

        let fft_frame = fft2(test_frame([33, 35]).view());
        for p in 0..7 {
            for q in 0..8 {
                let expected = lazy.mask(p, q).unwrap();
                assert_eq!(eager.mask(p, q).unwrap(), expected, "({}, {})", p, q);
                assert_eq!(full.mask(p, q).unwrap(), expected, "({}, {})", p, q);

                let projection = lazy.project(p, q, fft_frame.view()).unwrap();
                assert_eq!(eager.project(p, q, fft_frame.view()).unwrap(), projection);
                assert_eq!(full.project(p, q, fft_frame.view()).unwrap(), projection);
            }
        }
    }

    #[test]
    fn test_small_shift_gives_empty_mask() {
        let geometry = geometry_with_column_shift(8, 0.05, (16.0, 16.0), 8.0);
        let builder = TrotterMaskBuilder::new(geometry).unwrap();
        let bands = builder.side_bands(0, 1).unwrap();
        assert!(bands.positive_sum < 1.0 && bands.negative_sum < 1.0);
        assert_eq!(builder.build(0, 1).unwrap(), TrotterMask::empty([32, 32]));
    }

    #[test]
    fn test_one_sided_overlap_is_inconsistent() {
        // the negative trotter lies left of the frame, the positive one inside it
        let geometry = geometry_with_column_shift(4, 12.0, (16.0, 0.0), 10.0);
        let builder = TrotterMaskBuilder::new(geometry).unwrap();
        match builder.build(0, 1) {
            Err(SsbError::GeometryInconsistency {
                p,
                q,
                positive,
                negative,
            }) => {
                assert_eq!((p, q), (0, 1));
                assert!(positive >= 1.0);
                assert!(negative < 1.0);
            }
            other => panic!("expected GeometryInconsistency, got {:?}", other),
        }
        assert!(builder.build_set().is_err());
    }

    #[test]
    fn test_positions_outside_raster() {
        let lazy = LazyMasks::new(geometry()).unwrap();
        assert!(matches!(
            lazy.mask(7, 0),
            Err(SsbError::IndexOutOfBounds { p: 7, q: 0, .. })
        ));
        let eager = EagerMasks::new(geometry()).unwrap();
        assert!(matches!(
            eager.mask(0, 8),
            Err(SsbError::IndexOutOfBounds { p: 0, q: 8, .. })
        ));
    }

    #[test]
    fn test_beam_outside_frame_is_rejected() {
        let raster = RasterGeometry::new([2, 2], [16, 16], Some((100.0, 100.0))).unwrap();
        let geometry = Geometry::new(params(1e-10, 4.0), raster).unwrap();
        assert!(matches!(
            TrotterMaskBuilder::new(geometry),
            Err(SsbError::InvalidParameter(_))
        ));
    }
}
