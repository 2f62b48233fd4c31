use thiserror::Error;

#[derive(Error, Debug)]
pub enum HttpError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid base url: {0}")]
    BaseUrl(String),
}

impl HttpError {
    /// Transport-level failures worth another attempt: connection resets,
    /// timeouts, truncated bodies. Decode and builder errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            HttpError::Transport(e) => {
                e.is_timeout() || e.is_connect() || (e.is_body() && !e.is_decode())
            }
            HttpError::BaseUrl(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, HttpError>;
