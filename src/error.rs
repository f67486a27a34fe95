use crate::corrector::Correction;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Corrupt accumulator state: {0}")]
    Corrupt(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum MeteringError {
    /// The correction is already applied in memory, only the write failed
    #[error("correction applied but not persisted: {source}")]
    Persist {
        correction: Correction,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParamsError {
    #[error("scale bounds must satisfy 0 < min_scale <= max_scale, both finite (got {min_scale} and {max_scale})")]
    ScaleBounds { min_scale: f64, max_scale: f64 },
    #[error("{name} must be finite and not negative (got {value})")]
    Threshold { name: &'static str, value: f64 },
}

/// Failure to start metering from persisted totals
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("invalid metering parameters: {0}")]
    Params(#[from] ParamsError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
