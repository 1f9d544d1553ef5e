//! Single-side-band (SSB) ptychography for 4D scanning diffraction data.
//!
//! A dataset of shape `(rows, cols, height, width)` holds one diffraction frame
//! per probe position. For every scan position the frame is Fourier
//! transformed and weighted by a trotter mask, the normalised difference of the
//! two regions where the primary beam overlaps only one of its copies shifted
//! by the scan frequency. The weighted sums over the scan raster form the
//! complex reconstruction.
//!
//! ```no_run
//! use ndarray::Array4;
//! use ssb_ptychography::{run, Dtype, MaskMode, MemoryDataset, SsbConfig};
//!
//! let config = SsbConfig {
//!     voltage_kev: 300.0,
//!     dpix: 0.5654 / 50.0 * 1e-9,
//!     semiconv: 25e-3,
//!     semiconv_pix: 78.6649 / 4.0,
//!     center: Some((23.0, 24.0)),
//!     angle: 0.0,
//!     mask_mode: MaskMode::Eager,
//!     dtype: Dtype::Float64,
//! };
//! let data = Array4::<f64>::zeros((29, 30, 47, 49));
//! let mut kernel = config.build([29, 30], [47, 49])?;
//! let dataset = MemoryDataset::new(data, 20, 2)?;
//! let result = run(&mut kernel, &dataset, None)?;
//! # Ok::<(), ssb_ptychography::SsbError>(())
//! ```

pub mod config;
pub mod dataset;
pub mod error;
mod fft2;
pub mod geometry;
pub mod mask;
pub mod reconstruction;
pub mod trotter;

pub use crate::config::SsbConfig;
pub use crate::dataset::{run, MemoryDataset};
pub use crate::error::{SsbError, SsbResult};
pub use crate::fft2::{fft2, Fft2};
pub use crate::geometry::{wavelength, Geometry, PhysicalParameters, RasterGeometry};
pub use crate::reconstruction::{
    Dtype, KernelState, RegionOfInterest, ResultGrid, SsbReconstruction, Tile,
};
pub use crate::trotter::{
    EagerMasks, LazyMasks, MaskMode, MaskSource, Masks, TrotterMask, TrotterMaskBuilder,
    TrotterMaskSet,
};
