use http::StatusCode;
use thiserror::Error;

use crate::experiments::config::ExperimentStatus;

#[derive(Error, Debug)]
pub enum ExperimentError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("an experiment needs between 2 and 4 variants, got {0}")]
    InvalidVariantCount(usize),

    #[error("audience of {audience} is too small for {variants} variants")]
    AudienceTooSmall { audience: u64, variants: usize },

    #[error("cannot {action} an experiment that is {from}")]
    InvalidTransition {
        from: ExperimentStatus,
        action: &'static str,
    },

    #[error("experiment is {0} and cannot be completed")]
    ExperimentNotCompletable(ExperimentStatus),

    #[error("experiment {0} was modified concurrently, re-read and retry")]
    ConcurrencyConflict(String),

    #[error("experiment not found: {0}")]
    NotFound(String),

    #[error("variant index {index} out of range ({count} variants)")]
    NoSuchVariant { index: usize, count: usize },

    #[error("experiment already exists: {0}")]
    AlreadyExists(String),

    #[error("publishing the winning content failed: {0}")]
    PublishFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ExperimentError>;

impl ExperimentError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ExperimentError::Validation(_) => StatusCode::BAD_REQUEST,
            ExperimentError::InvalidVariantCount(_) => StatusCode::BAD_REQUEST,
            ExperimentError::AudienceTooSmall { .. } => StatusCode::BAD_REQUEST,
            ExperimentError::InvalidTransition { .. } => StatusCode::CONFLICT,
            ExperimentError::ExperimentNotCompletable(_) => StatusCode::CONFLICT,
            ExperimentError::ConcurrencyConflict(_) => StatusCode::CONFLICT,
            ExperimentError::NotFound(_) => StatusCode::NOT_FOUND,
            ExperimentError::NoSuchVariant { .. } => StatusCode::NOT_FOUND,
            ExperimentError::AlreadyExists(_) => StatusCode::CONFLICT,
            ExperimentError::PublishFailed(_) => StatusCode::BAD_GATEWAY,
            ExperimentError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ExperimentError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for the `{ok: false, error}` envelope.
    pub fn code(&self) -> &'static str {
        match self {
            ExperimentError::Validation(_) => "validation_error",
            ExperimentError::InvalidVariantCount(_) => "invalid_variant_count",
            ExperimentError::AudienceTooSmall { .. } => "audience_too_small",
            ExperimentError::InvalidTransition { .. } => "invalid_transition",
            ExperimentError::ExperimentNotCompletable(_) => "experiment_not_completable",
            ExperimentError::ConcurrencyConflict(_) => "concurrency_conflict",
            ExperimentError::NotFound(_) => "not_found",
            ExperimentError::NoSuchVariant { .. } => "no_such_variant",
            ExperimentError::AlreadyExists(_) => "already_exists",
            ExperimentError::PublishFailed(_) => "publish_failed",
            ExperimentError::Io(_) => "io_error",
            ExperimentError::Json(_) => "serialization_error",
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ExperimentError::Validation(_)
                | ExperimentError::InvalidVariantCount(_)
                | ExperimentError::AudienceTooSmall { .. }
        )
    }
}
