use thiserror::Error;

/// Errors that can be returned by threadwatch-fetch operations.
#[derive(Debug, Error)]
pub enum FetchError {
    /// A network-level failure that survived every retry attempt.
    #[error("network error requesting {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The request did not complete before its deadline.
    #[error("request to {url} timed out")]
    Timeout { url: String },

    /// The anti-bot block page was still served after the bypass sequence.
    #[error("anti-bot challenge could not be bypassed for {url}")]
    Challenge { url: String },

    /// The request could not be built (bad URL, bad header value, ...).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The server replied with a status the caller cannot work with.
    #[error("HTTP status {status} from {url}")]
    Status { status: u16, url: String },

    /// A filesystem I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to serialize or deserialize JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Failed to extract a ZIP archive.
    #[error("ZIP extraction error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// The response was missing an expected field or had an unexpected shape.
    #[error("invalid response: {message}")]
    InvalidResponse { message: String },

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,
}

impl FetchError {
    /// Classify a transport error for `url`.
    pub(crate) fn from_reqwest(url: &str, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            FetchError::Timeout {
                url: url.to_owned(),
            }
        } else if source.is_builder() {
            FetchError::InvalidRequest(source.to_string())
        } else {
            FetchError::Network {
                url: url.to_owned(),
                source,
            }
        }
    }

    /// `true` when the error is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Network { .. } | FetchError::Timeout { .. })
    }

    /// `true` when the connection could not be established at all
    /// (DNS failure, refused, unreachable).
    pub fn is_connect(&self) -> bool {
        match self {
            FetchError::Network { source, .. } => source.is_connect(),
            _ => false,
        }
    }
}
