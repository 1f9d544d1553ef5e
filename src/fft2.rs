use ndarray::parallel::prelude::{IntoParallelIterator, ParallelIterator};
use ndarray::{Array2, ArrayView2, ArrayViewMut2, Zip};
use num_complex::Complex;
use rustfft::num_traits::Zero;
use rustfft::{Fft, FftDirection, FftPlanner};
use std::sync::Arc;

use crate::error::{SsbError, SsbResult};

/// Forward 2D FFT plan for frames of one shape.
///
/// The transform is unnormalised, so the DC component is the frame sum.
#[derive(Clone)]
pub struct Fft2 {
    shape: [usize; 2],
    fft_row: Arc<dyn Fft<f64>>,
    fft_col: Arc<dyn Fft<f64>>,
}

impl Fft2 {
    pub fn new(shape: [usize; 2]) -> Self {
        let mut planner = FftPlanner::new();
        let fft_row = planner.plan_fft(shape[1], FftDirection::Forward);
        let fft_col = planner.plan_fft(shape[0], FftDirection::Forward);
        Fft2 {
            shape,
            fft_row,
            fft_col,
        }
    }

    pub fn shape(&self) -> [usize; 2] {
        self.shape
    }

    /// Transform a real frame of the planned shape.
    pub fn process_real(&self, frame: ArrayView2<f64>) -> SsbResult<Array2<Complex<f64>>> {
        self.check_shape(frame.shape())?;
        Ok(self.transform_real(frame))
    }

    /// Transform in place. `input` must have the planned shape and be in standard layout.
    pub fn process_inplace(&self, input: ArrayViewMut2<Complex<f64>>) -> SsbResult<()> {
        self.check_shape(input.shape())?;
        if !input.is_standard_layout() {
            return Err(SsbError::InvalidParameter(
                "in-place FFT needs a frame in standard layout".to_string(),
            ));
        }
        self.transform(input);
        Ok(())
    }

    fn check_shape(&self, shape: &[usize]) -> SsbResult<()> {
        if shape != &self.shape[..] {
            return Err(SsbError::ShapeMismatch {
                expected: self.shape.to_vec(),
                found: shape.to_vec(),
            });
        }
        Ok(())
    }

    // the copy is always in standard layout
    fn transform_real(&self, frame: ArrayView2<f64>) -> Array2<Complex<f64>> {
        let mut output = Array2::from_shape_fn(frame.dim(), |idx| Complex::new(frame[idx], 0.0));
        self.transform(output.view_mut());
        output
    }

    fn transform(&self, mut input: ArrayViewMut2<Complex<f64>>) {
        let fft_row = &self.fft_row;
        let fft_col = &self.fft_col;

        Zip::from(input.rows_mut()).into_par_iter().for_each_init(
            || vec![Zero::zero(); fft_row.get_inplace_scratch_len()],
            |scratch, mut row| {
                fft_row.process_with_scratch(
                    row.0.as_slice_mut().expect("standard layout rows are contiguous"),
                    scratch,
                );
            },
        );

        Zip::from(input.columns_mut())
            .into_par_iter()
            .for_each_init(
                || {
                    (
                        vec![Zero::zero(); fft_col.len()],
                        vec![Zero::zero(); fft_col.get_inplace_scratch_len()],
                    )
                },
                |(temp, scratch), mut col| {
                    debug_assert_eq!(col.0.len(), temp.len());
                    for (t, e) in temp.iter_mut().zip(col.0.iter()) {
                        *t = *e;
                    }
                    fft_col.process_with_scratch(temp, scratch);
                    for (e, t) in col.0.iter_mut().zip(temp.iter()) {
                        *e = *t;
                    }
                },
            );
    }
}

/// One-off forward 2D FFT of a real frame.
pub fn fft2(frame: ArrayView2<f64>) -> Array2<Complex<f64>> {
    Fft2::new([frame.shape()[0], frame.shape()[1]]).transform_real(frame)
}
