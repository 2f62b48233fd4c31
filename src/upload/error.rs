use thiserror::Error;

use crate::http::HttpError;
use crate::pacer::{Retryable, RETRY_ERROR_CODES};

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] HttpError),

    #[error("api returned status {status} for {path}")]
    Api { status: u16, path: String },

    #[error("remote directory not found: {0}")]
    DirNotFound(String),

    #[error("uploaded parts incomplete: {0}")]
    IncompleteParts(String),

    #[error("part {part_no} was not persisted by the server")]
    PartNotPersisted { part_no: i64 },

    #[error("upload cancelled")]
    Cancelled,
}

impl UploadError {
    pub fn api(status: reqwest::StatusCode, path: impl Into<String>) -> Self {
        UploadError::Api {
            status: status.as_u16(),
            path: path.into(),
        }
    }
}

impl Retryable for UploadError {
    fn is_retryable(&self) -> bool {
        match self {
            UploadError::Http(e) => e.is_retryable(),
            UploadError::Api { status, .. } => RETRY_ERROR_CODES.contains(status),
            _ => false,
        }
    }

    fn cancelled() -> Self {
        UploadError::Cancelled
    }
}

pub type Result<T> = std::result::Result<T, UploadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        for status in [429u16, 500, 502, 503, 504, 509] {
            let err = UploadError::Api {
                status,
                path: "/api/files".into(),
            };
            assert!(err.is_retryable(), "{status} should be retryable");
        }

        for status in [400u16, 401, 403, 404, 409] {
            let err = UploadError::Api {
                status,
                path: "/api/files".into(),
            };
            assert!(!err.is_retryable(), "{status} should not be retryable");
        }
    }

    #[test]
    fn test_cancellation_is_not_retryable() {
        assert!(!UploadError::cancelled().is_retryable());
    }
}
