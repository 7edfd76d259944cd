use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("page render failed: {0}")]
    Raster(String),

    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("cache artifact error: {0}")]
    Cache(String),

    #[error("background task failed: {0}")]
    Task(String),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(#[from] SearchError),

    #[error("model error: {0}")]
    Model(#[from] ModelError),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("search request failed: {0}")]
    Request(String),

    #[error("store not available yet: {0}")]
    NotReady(String),

    #[error("unsupported payload schema version {0}")]
    UnsupportedSchema(u64),
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("model call timed out after {0:?}")]
    Timeout(Duration),

    #[error("model endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed model output: {0}")]
    Malformed(String),
}

impl ModelError {
    pub fn from_http(error: reqwest::Error, timeout: Duration) -> Self {
        if error.is_timeout() {
            ModelError::Timeout(timeout)
        } else {
            ModelError::Http(error)
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            ModelError::Timeout(_) => true,
            ModelError::Http(error) => {
                error.is_timeout() || error.is_connect() || error.is_request() || error.is_body()
            }
            ModelError::Status { status, .. } => *status == 429 || *status >= 500,
            ModelError::MissingCredentials(_) | ModelError::Malformed(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value: {0}")]
    Invalid(String),
}
