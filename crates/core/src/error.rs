use thiserror::Error;

/// Per-document failures. Any of these aborts one document's ingestion
/// without touching its siblings in a batch.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("document unreadable: {0}")]
    DocumentUnreadable(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("ocr backend unavailable: {0}")]
    OcrUnavailable(String),

    #[error("insufficient text: extracted {chars} chars, threshold is {threshold} and ocr is disabled")]
    InsufficientText { chars: usize, threshold: usize },

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("indexing failed: {0}")]
    Indexing(#[from] IndexError),
}

/// Errors raised by a rasterizer or recognizer backend.
#[derive(Debug, Error)]
pub enum OcrError {
    /// The backend is missing or misconfigured. Fatal for the whole document.
    #[error("{backend} unavailable: {details}")]
    Unavailable { backend: String, details: String },

    /// A single page or image could not be processed.
    #[error("{0}")]
    Failed(String),
}

impl From<OcrError> for IngestError {
    fn from(value: OcrError) -> Self {
        match value {
            OcrError::Unavailable { backend, details } => {
                IngestError::OcrUnavailable(format!("{backend}: {details}"))
            }
            OcrError::Failed(details) => IngestError::DocumentUnreadable(details),
        }
    }
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding request failed: {0}")]
    Request(String),

    #[error("embedding has {actual} dimensions, model {model} declares {expected}")]
    Dimensions {
        model: String,
        expected: usize,
        actual: usize,
    },

    #[error("embedding response invalid: {0}")]
    Response(String),
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("vector dimension {actual} does not match collection dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("query embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
