//! Machine readers for scanned pages.
//!
//! Defines the [`CodeReader`] and [`StudentIdReader`] traits so the
//! reconciliation engine can run against the image-based readers in
//! production and against scripted readers in tests.

pub mod bubbles;
pub mod morphology;
pub mod qr;

use image::DynamicImage;

pub use bubbles::ContourBubbleReader;
pub use qr::QrCodeReader;

/// Why a student id could not be read from a cover page.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadFailure {
    #[error("no closed contour found")]
    NoContour,
    #[error("grid outline has {0} corners, expected 4")]
    NotQuadrilateral(usize),
    #[error("grid outline cannot be rectified")]
    DegenerateGrid,
    #[error("no clearly marked digit in column {0}")]
    AmbiguousColumn(usize),
}

/// Reads the machine-readable identity code of a page.
///
/// A `None` result is a legitimate outcome that routes the page to manual
/// resolution, never an error.
pub trait CodeReader: Send + Sync {
    fn name(&self) -> &str;
    fn read_code(&self, image: &DynamicImage) -> Option<String>;
}

/// Reads the hand-marked student id of a cover page.
pub trait StudentIdReader: Send + Sync {
    fn name(&self) -> &str;
    fn read_student_id(&self, image: &DynamicImage) -> Result<String, ReadFailure>;
}
