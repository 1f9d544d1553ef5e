//! Physical sampling model of a 4D STEM scan.
//!
//! Relates the scan raster (probe positions) to the diffraction frame: each
//! scan-raster index is a spatial frequency of the reconstructed object, and
//! each frame pixel is a spatial frequency of the scattered beam. The ratio of
//! the two step sizes gives the shift, in frame pixels, between the aperture
//! copies that interfere at that frequency.

use crate::error::{SsbError, SsbResult};

/// Planck's constant, J s
const PLANCK: f64 = 6.626070040e-34;
/// Electron rest mass, kg
const ELECTRON_MASS: f64 = 9.10938356e-31;
/// Elementary charge, C
const ELEMENTARY_CHARGE: f64 = 1.6021766208e-19;
/// Speed of light, m/s
const SPEED_OF_LIGHT: f64 = 299792458.0;

/// Relativistic electron wavelength in metres for an acceleration voltage given in keV.
///
/// λ = h / sqrt(2 m e U (1 + e U / (2 m c²)))
pub fn wavelength(voltage_kev: f64) -> f64 {
    let u = voltage_kev * 1000.0;
    let e = ELEMENTARY_CHARGE;
    let m = ELECTRON_MASS;
    let c = SPEED_OF_LIGHT;
    PLANCK / (2.0 * m * e * u * (1.0 + e * u / (2.0 * m * c * c))).sqrt()
}

/// Fold a raster index into a signed frequency index, in DFT order.
///
/// Indices above `n / 2` wrap to negative frequencies. For even `n` the
/// Nyquist index `n / 2` stays positive.
pub fn real_index(i: usize, n: usize) -> i64 {
    if 2 * i > n {
        i as i64 - n as i64
    } else {
        i as i64
    }
}

/// Beam and probe parameters of the acquisition.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PhysicalParameters {
    /// Acceleration voltage, keV
    pub voltage_kev: f64,
    /// Scan step (probe pixel pitch), m
    pub dpix: f64,
    /// Semi-convergence angle of the probe, rad
    pub semiconv: f64,
    /// Radius of the primary beam in the diffraction frame, pixels
    pub semiconv_pix: f64,
    /// Rotation between scan and diffraction coordinates, rad
    pub angle: f64,
}

impl PhysicalParameters {
    pub fn validate(&self) -> SsbResult<()> {
        let finite = [
            self.voltage_kev,
            self.dpix,
            self.semiconv,
            self.semiconv_pix,
            self.angle,
        ]
        .iter()
        .all(|v| v.is_finite());
        if !finite {
            return Err(SsbError::InvalidParameter(format!(
                "non-finite physical parameter in {:?}",
                self
            )));
        }
        if self.voltage_kev <= 0.0 {
            return Err(SsbError::InvalidParameter(format!(
                "acceleration voltage must be positive, got {} keV",
                self.voltage_kev
            )));
        }
        if self.dpix <= 0.0 {
            return Err(SsbError::InvalidParameter(format!(
                "scan pixel pitch must be positive, got {} m",
                self.dpix
            )));
        }
        if self.semiconv <= 0.0 || self.semiconv >= std::f64::consts::FRAC_PI_2 {
            return Err(SsbError::InvalidParameter(format!(
                "semi-convergence angle must lie in (0, pi/2), got {} rad",
                self.semiconv
            )));
        }
        if self.semiconv_pix <= 0.0 {
            return Err(SsbError::InvalidParameter(format!(
                "primary beam radius must be positive, got {} px",
                self.semiconv_pix
            )));
        }
        Ok(())
    }
}

/// Shapes of the scan raster and of a diffraction frame, and the aperture center.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RasterGeometry {
    /// `(rows, cols)` of the scan
    pub scan_shape: [usize; 2],
    /// `(height, width)` of a frame
    pub frame_shape: [usize; 2],
    /// `(cy, cx)` of the primary beam, frame pixels
    pub center: (f64, f64),
}

impl RasterGeometry {
    /// With `center` absent the aperture is placed at `(height / 2, width / 2)`.
    pub fn new(
        scan_shape: [usize; 2],
        frame_shape: [usize; 2],
        center: Option<(f64, f64)>,
    ) -> SsbResult<Self> {
        if scan_shape.iter().any(|&n| n == 0) {
            return Err(SsbError::InvalidParameter(format!(
                "scan shape must be positive, got {:?}",
                scan_shape
            )));
        }
        if frame_shape.iter().any(|&n| n == 0) {
            return Err(SsbError::InvalidParameter(format!(
                "frame shape must be positive, got {:?}",
                frame_shape
            )));
        }
        let center = center.unwrap_or((
            frame_shape[0] as f64 / 2.0,
            frame_shape[1] as f64 / 2.0,
        ));
        if !(center.0.is_finite() && center.1.is_finite()) {
            return Err(SsbError::InvalidParameter(format!(
                "aperture center must be finite, got {:?}",
                center
            )));
        }
        Ok(RasterGeometry {
            scan_shape,
            frame_shape,
            center,
        })
    }

    /// Number of raster rows whose masks are stored, `rows / 2 + 1` clamped to `rows`.
    pub fn half_rows(&self) -> usize {
        (self.scan_shape[0] / 2 + 1).min(self.scan_shape[0])
    }

    pub fn frame_len(&self) -> usize {
        self.frame_shape[0] * self.frame_shape[1]
    }

    pub fn contains(&self, p: usize, q: usize) -> bool {
        p < self.scan_shape[0] && q < self.scan_shape[1]
    }
}

/// Validated parameters together with the derived frequency sampling.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Geometry {
    pub params: PhysicalParameters,
    pub raster: RasterGeometry,
    /// Electron wavelength, m
    pub wavelength: f64,
    /// Spatial frequency per frame pixel, 1/m
    pub d_kf: f64,
    /// Spatial frequency per scan index along rows and columns, 1/m
    pub d_qp: (f64, f64),
}

impl Geometry {
    pub fn new(params: PhysicalParameters, raster: RasterGeometry) -> SsbResult<Self> {
        params.validate()?;
        if raster.scan_shape.iter().any(|&n| n == 0) || raster.frame_shape.iter().any(|&n| n == 0)
        {
            return Err(SsbError::InvalidParameter(format!(
                "raster shapes must be positive, got scan {:?} frame {:?}",
                raster.scan_shape, raster.frame_shape
            )));
        }

        let wavelength = wavelength(params.voltage_kev);
        let d_kf = params.semiconv.sin() / wavelength / params.semiconv_pix;
        let d_qp = (
            1.0 / (params.dpix * raster.scan_shape[0] as f64),
            1.0 / (params.dpix * raster.scan_shape[1] as f64),
        );

        Ok(Geometry {
            params,
            raster,
            wavelength,
            d_kf,
            d_qp,
        })
    }

    /// Signed frequency indices `(real_p, real_q)` of scan position `(p, q)`.
    pub fn real_indices(&self, p: usize, q: usize) -> (i64, i64) {
        (
            real_index(p, self.raster.scan_shape[0]),
            real_index(q, self.raster.scan_shape[1]),
        )
    }

    /// Shift `(sy, sx)`, in frame pixels, of the side-band apertures of scan position `(p, q)`.
    pub fn shift(&self, p: usize, q: usize) -> (f64, f64) {
        let (real_p, real_q) = self.real_indices(p, q);
        self.shift_for(real_p, real_q)
    }

    fn shift_for(&self, real_p: i64, real_q: i64) -> (f64, f64) {
        let sy = real_p as f64 * self.d_qp.0 / self.d_kf;
        let sx = real_q as f64 * self.d_qp.1 / self.d_kf;
        if self.params.angle == 0.0 {
            return (sy, sx);
        }
        let (sin, cos) = self.params.angle.sin_cos();
        (sx * sin + sy * cos, sx * cos - sy * sin)
    }
}
