use crate::store::StoreError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Classification carried by every error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Datastore,
    Internal,
    Canceled,
}

impl ErrorKind {
    pub fn status(&self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Canceled => 499,
            ErrorKind::Datastore | ErrorKind::Internal => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Datastore => "datastore",
            ErrorKind::Internal => "internal",
            ErrorKind::Canceled => "canceled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("datastore failure: {0}")]
    Datastore(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("request canceled")]
    Canceled,
}

impl PipelineError {
    pub fn validation(message: impl Into<String>) -> Self {
        PipelineError::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        PipelineError::NotFound(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Validation(_) => ErrorKind::Validation,
            PipelineError::NotFound(_) => ErrorKind::NotFound,
            PipelineError::Datastore(_) => ErrorKind::Datastore,
            PipelineError::Internal(_) => ErrorKind::Internal,
            PipelineError::Canceled => ErrorKind::Canceled,
        }
    }

    pub fn status(&self) -> u16 {
        self.kind().status()
    }
}

impl From<StoreError> for PipelineError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound { .. } => PipelineError::NotFound(error.to_string()),
            other => PipelineError::Datastore(other.to_string()),
        }
    }
}
