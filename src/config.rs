use serde::{Deserialize, Serialize};

use crate::error::SsbResult;
use crate::geometry::{Geometry, PhysicalParameters, RasterGeometry};
use crate::reconstruction::{Dtype, SsbReconstruction};
use crate::trotter::{MaskMode, Masks};

/// Parameters of an SSB reconstruction run.
///
/// Field names follow the usual acquisition metadata, so a run can be read
/// from JSON such as `{"U": 300, "dpix": 1.13e-11, "semiconv": 0.025, "semiconv_pix": 19.7}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SsbConfig {
    /// Acceleration voltage, keV
    #[serde(rename = "U")]
    pub voltage_kev: f64,
    /// Scan step, m
    pub dpix: f64,
    /// Semi-convergence angle, rad
    pub semiconv: f64,
    /// Primary beam radius in the diffraction frame, pixels
    pub semiconv_pix: f64,
    /// `(cy, cx)` of the primary beam. Defaults to the frame center.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub center: Option<(f64, f64)>,
    /// Scan rotation, rad
    #[serde(default)]
    pub angle: f64,
    #[serde(default)]
    pub mask_mode: MaskMode,
    /// Working precision, `"float32"` or `"float64"`
    #[serde(default)]
    pub dtype: Dtype,
}

impl SsbConfig {
    pub fn physical_parameters(&self) -> PhysicalParameters {
        PhysicalParameters {
            voltage_kev: self.voltage_kev,
            dpix: self.dpix,
            semiconv: self.semiconv,
            semiconv_pix: self.semiconv_pix,
            angle: self.angle,
        }
    }

    pub fn geometry(&self, scan_shape: [usize; 2], frame_shape: [usize; 2]) -> SsbResult<Geometry> {
        let raster = RasterGeometry::new(scan_shape, frame_shape, self.center)?;
        Geometry::new(self.physical_parameters(), raster)
    }

    /// Validates the parameters, realizes the masks and returns an empty reconstruction.
    pub fn build(
        &self,
        scan_shape: [usize; 2],
        frame_shape: [usize; 2],
    ) -> SsbResult<SsbReconstruction<Masks>> {
        let geometry = self.geometry(scan_shape, frame_shape)?;
        let masks = Masks::new(geometry, self.mask_mode)?;
        Ok(SsbReconstruction::with_masks(masks).with_dtype(self.dtype))
    }
}
