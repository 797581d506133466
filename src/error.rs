//! Error taxonomy for the grading pipeline.
//!
//! Decode and validation failures are not errors: they route a page to the
//! pending set. Only conditions that must stop an operation live here.

/// Fatal (for the current operation) pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum GradingError {
    #[error("malformed identity code: {0:?}")]
    MalformedCode(String),
    #[error("missing prerequisite: {0}")]
    MissingPrerequisite(String),
    #[error("corrupt ledger state for {document}: {detail}")]
    CorruptLedger { document: String, detail: String },
    #[error("roster error: {0}")]
    Roster(String),
    #[error("PDF error: {0}")]
    Pdf(String),
    #[error("spreadsheet error: {0}")]
    Spreadsheet(String),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl From<lopdf::Error> for GradingError {
    fn from(e: lopdf::Error) -> Self {
        GradingError::Pdf(e.to_string())
    }
}

impl GradingError {
    pub fn corrupt(document: impl Into<String>, detail: impl Into<String>) -> Self {
        GradingError::CorruptLedger {
            document: document.into(),
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GradingError>;
