use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SsbError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Only one of the two side-band masks of a scan position reaches unit
    /// overlap. The apertures are then not mirror images of each other, which
    /// points at a misconfigured center, radius or frame shape.
    #[error(
        "Geometry inconsistency at scan position ({p}, {q}): positive overlap {positive}, negative overlap {negative}"
    )]
    GeometryInconsistency {
        p: usize,
        q: usize,
        positive: f64,
        negative: f64,
    },

    #[error("Shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Scan position ({p}, {q}) out of bounds for raster {rows}x{cols}")]
    IndexOutOfBounds {
        p: usize,
        q: usize,
        rows: usize,
        cols: usize,
    },

    #[error("Scan position ({p}, {q}) appears more than once in a tile")]
    DuplicatePosition { p: usize, q: usize },

    #[error("Reconstruction already finalized")]
    Finalized,
}

pub type SsbResult<T> = Result<T, SsbError>;
