#![allow(dead_code)]

use ndarray::{Array, Array2, Array4, ArrayView2};
use num_complex::Complex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use ssb_ptychography::mask::circular;
use ssb_ptychography::{Dtype, MaskMode, SsbConfig};
use std::f64::consts::PI;

/// Physical parameters of the reference acquisition, scaled down 4x in the frame.
pub fn config(mask_mode: MaskMode) -> SsbConfig {
    SsbConfig {
        voltage_kev: 300.0,
        // 50 STEM pixels on 0.5654 nm
        dpix: 0.5654 / 50.0 * 1e-9,
        semiconv: 25e-3,
        semiconv_pix: 78.6649 / 4.0,
        center: Some(((93 / 4) as f64, (97 / 4) as f64)),
        angle: 0.0,
        mask_mode,
        dtype: Dtype::Float64,
    }
}

/// Uniform noise scaled by a ramp over the flattened dataset.
pub fn synthetic_data(shape: (usize, usize, usize, usize), seed: u64) -> Array4<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let n = shape.0 * shape.1 * shape.2 * shape.3;
    let ramp = Array::linspace(1.0, 1000.0, n);
    let values: Vec<f64> = ramp.iter().map(|&r| rng.gen::<f64>() * r).collect();
    Array4::from_shape_vec(shape, values).unwrap()
}

/// Plain separable DFT, unnormalised.
pub fn naive_dft2(frame: ArrayView2<f64>) -> Array2<Complex<f64>> {
    let (h, w) = frame.dim();
    let twiddle = |k: usize, n: usize| Complex::new(0.0, -2.0 * PI * k as f64 / n as f64).exp();
    let tw_w: Vec<_> = (0..w).map(|k| twiddle(k, w)).collect();
    let tw_h: Vec<_> = (0..h).map(|k| twiddle(k, h)).collect();

    let mut rows: Array2<Complex<f64>> = Array2::zeros((h, w));
    for y in 0..h {
        for l in 0..w {
            let mut sum = Complex::new(0.0, 0.0);
            for x in 0..w {
                sum += tw_w[(l * x) % w] * frame[[y, x]];
            }
            rows[[y, l]] = sum;
        }
    }
    let mut out: Array2<Complex<f64>> = Array2::zeros((h, w));
    for l in 0..w {
        for k in 0..h {
            let mut sum = Complex::new(0.0, 0.0);
            for y in 0..h {
                sum += tw_h[(k * y) % h] * rows[[y, l]];
            }
            out[[k, l]] = sum;
        }
    }
    out
}

fn reference_wavelength(voltage_kev: f64) -> f64 {
    let e = 1.6021766208e-19;
    let m = 9.10938356e-31;
    let c = 299792458.0;
    let h = 6.626070040e-34;
    let u = voltage_kev * 1000.0;
    h / (2.0 * m * e * u * (1.0 + e * u / (2.0 * m * c * c))).sqrt()
}

/// Straightforward SSB: every frame transformed, every mask rasterized, no symmetry.
pub fn reference_ssb(data: &Array4<f64>, config: &SsbConfig) -> Array2<Complex<f64>> {
    let (rows, cols, height, width) = data.dim();
    let (cy, cx) = config.center.unwrap();
    let r = config.semiconv_pix;

    let lamb = reference_wavelength(config.voltage_kev);
    let d_kf = config.semiconv.sin() / lamb / r;
    let d_qp = (
        1.0 / config.dpix / rows as f64,
        1.0 / config.dpix / cols as f64,
    );

    let filter_center = circular(cx, cy, width, height, r, true);
    let mut result: Array2<Complex<f64>> = Array2::zeros((rows, cols));

    for p in 0..rows {
        for q in 0..cols {
            let real_p = if p as f64 > rows as f64 / 2.0 {
                p as f64 - rows as f64
            } else {
                p as f64
            };
            let real_q = if q as f64 > cols as f64 / 2.0 {
                q as f64 - cols as f64
            } else {
                q as f64
            };
            let sy = real_p * d_qp.0 / d_kf;
            let sx = real_q * d_qp.1 / d_kf;

            let filter_positive = circular(cx + sx, cy + sy, width, height, r, true);
            let filter_negative = circular(cx - sx, cy - sy, width, height, r, true);

            let f = naive_dft2(data.slice(ndarray::s![p, q, .., ..]));

            if p == 0 && q == 0 {
                let mut sum = Complex::new(0.0, 0.0);
                for (v, &c) in f.iter().zip(filter_center.iter()) {
                    sum += *v * c;
                }
                result[[0, 0]] = sum / filter_center.sum();
                continue;
            }

            let mut non_zero_positive = 0.0;
            let mut non_zero_negative = 0.0;
            let mut sum_positive = Complex::new(0.0, 0.0);
            let mut sum_negative = Complex::new(0.0, 0.0);
            for (((&c, &pos), &neg), v) in filter_center
                .iter()
                .zip(filter_positive.iter())
                .zip(filter_negative.iter())
                .zip(f.iter())
            {
                let mask_positive = if neg == 0.0 { c * pos } else { 0.0 };
                let mask_negative = if pos == 0.0 { c * neg } else { 0.0 };
                non_zero_positive += mask_positive;
                non_zero_negative += mask_negative;
                sum_positive += *v * mask_positive;
                sum_negative += *v * mask_negative;
            }

            if non_zero_positive >= 1.0 && non_zero_negative >= 1.0 {
                result[[p, q]] =
                    (sum_positive / non_zero_positive - sum_negative / non_zero_negative) / 2.0;
            } else {
                assert!(non_zero_positive < 1.0);
                assert!(non_zero_negative < 1.0);
            }
        }
    }
    result
}

/// Asserts `|a - b| <= atol + rtol * |b|` element-wise, as numpy's `allclose`.
pub fn assert_close(
    a: ArrayView2<Complex<f64>>,
    b: ArrayView2<Complex<f64>>,
    rtol: f64,
    atol: f64,
) {
    assert_eq!(a.shape(), b.shape());
    for ((idx, x), y) in a.indexed_iter().zip(b.iter()) {
        assert!(
            (x - y).norm() <= atol + rtol * y.norm(),
            "{:?}: {} vs {}",
            idx,
            x,
            y
        );
    }
}
