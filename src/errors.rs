//! Error types shared across the recorder.

use std::io;
use std::sync::PoisonError;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RecorderError>;

/// The canonical error set. Source-side failures (`SourceUnavailable`,
/// `SourceLost`, `Transient`) are recoverable and never escape the
/// acquisition loop; everything else surfaces through controller calls and
/// the control channel.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("stream source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("stream source lost")]
    SourceLost,

    #[error("transient source failure: {0}")]
    Transient(String),

    #[error("writer contract violation: {0}")]
    OrderViolation(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("operation not valid while {state}")]
    InvalidState { state: &'static str },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("no streams selected")]
    NoSelection,

    #[error("could not parse XDF data: {0}")]
    Parse(String),

    #[error("a recorder mutex was poisoned")]
    Poisoned,
}

impl RecorderError {
    /// Kind name reported in control-channel error responses.
    pub fn kind(&self) -> &'static str {
        match self {
            RecorderError::SourceUnavailable(_) => "SourceUnavailable",
            RecorderError::SourceLost => "SourceLost",
            RecorderError::Transient(_) => "Transient",
            RecorderError::OrderViolation(_) => "OrderViolation",
            RecorderError::Io(_) | RecorderError::Poisoned => "IOError",
            RecorderError::InvalidState { .. } => "InvalidState",
            RecorderError::BadRequest(_) | RecorderError::Parse(_) => "BadRequest",
            RecorderError::NoSelection => "NoSelection",
        }
    }
}

// A poisoned lock means a writer or worker thread panicked; there is no
// state worth salvaging from it, so it collapses into one variant.
impl<T> From<PoisonError<T>> for RecorderError {
    fn from(_: PoisonError<T>) -> Self {
        RecorderError::Poisoned
    }
}
