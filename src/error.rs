use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification used by batch code to decide skip-vs-abort.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A column, unit or metadata key is absent.
    MissingInput,
    /// A fit failed to converge or failed a sanity check.
    PoorFit,
    /// The input was too small/degenerate to even attempt the computation.
    Degenerate,
    /// Caller bug: mismatched lengths, bad indices, unknown commands.
    Contract,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("missing column {column:?} (available: {available:?})")]
    MissingColumn {
        column: String,
        available: Vec<String>,
    },
    #[error("missing info key {key:?}")]
    MissingInfo { key: String },
    #[error("missing block {name:?} (available: {available:?})")]
    MissingBlock {
        name: String,
        available: Vec<String>,
    },
    #[error("column {column:?} does not carry the expected unit ({expected})")]
    UnitMismatch { column: String, expected: String },
    #[error("poor fit for {context}: {reason}")]
    PoorFit { context: String, reason: String },
    #[error("degenerate fit window [{start}, {stop}]")]
    DegenerateWindow { start: usize, stop: usize },
    #[error("degenerate input: {reason}")]
    Degenerate { reason: String },
    #[error("length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("unknown command {name:?}")]
    UnknownCommand { name: String },
    #[error("invalid arguments for {command:?}: {reason}")]
    InvalidArguments { command: String, reason: String },
    #[error("driver failed to read {path:?}: {reason}")]
    Driver { path: PathBuf, reason: String },
    #[error("curve {path:?} is not loaded")]
    NotLoaded { path: PathBuf },
    #[error("info value could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    pub fn poor_fit(context: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::PoorFit {
            context: context.into(),
            reason: reason.into(),
        }
    }

    pub fn degenerate(reason: impl Into<String>) -> Self {
        CoreError::Degenerate {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::MissingColumn { .. }
            | CoreError::MissingInfo { .. }
            | CoreError::MissingBlock { .. }
            | CoreError::UnitMismatch { .. }
            | CoreError::Driver { .. }
            | CoreError::NotLoaded { .. } => ErrorKind::MissingInput,
            CoreError::PoorFit { .. } => ErrorKind::PoorFit,
            CoreError::DegenerateWindow { .. } | CoreError::Degenerate { .. } => {
                ErrorKind::Degenerate
            }
            CoreError::LengthMismatch { .. }
            | CoreError::IndexOutOfRange { .. }
            | CoreError::UnknownCommand { .. }
            | CoreError::InvalidArguments { .. }
            | CoreError::Serialization(_) => ErrorKind::Contract,
        }
    }

    /// Whether a batch should record this failure and move on to the next curve.
    pub fn is_recoverable(&self) -> bool {
        self.kind() != ErrorKind::Contract
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Fails with `LengthMismatch` unless both paired vectors have the same length.
pub(crate) fn check_same_len(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(CoreError::LengthMismatch { expected, actual });
    }
    Ok(())
}
