use thiserror::Error;

/// Main service error type
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    Ollama(#[from] OllamaError),

    #[error("Database error")]
    Database(#[from] DatabaseError),

    #[error("Inference failed")]
    Inference(#[from] InferenceError),

    #[error("Vector index error")]
    Index(#[from] IndexError),

    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Ollama client errors
#[derive(Error, Debug)]
pub enum OllamaError {
    #[error("Connection failed to Ollama at {url}")]
    Connection {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Model not found: {model}")]
    ModelNotFound { model: String },

    #[error("Generation failed (status {status}): {message}")]
    Generation { status: u16, message: String },

    #[error("Invalid response from Ollama")]
    InvalidResponse {
        #[source]
        source: reqwest::Error,
    },
}

/// Database errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed")]
    Connection(#[source] rusqlite::Error),

    #[error("Failed to create database directory {path}")]
    CreateDirectory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Query failed")]
    Query(#[source] rusqlite::Error),

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Stored embedding is corrupt ({len} bytes)")]
    CorruptEmbedding { len: usize },
}

/// Errors raised while turning pixels into a caption and a caption into a vector
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Failed to decode image {path}")]
    ImageDecode {
        path: String,
        #[source]
        source: image::ImageError,
    },

    #[error("Failed to encode image for the vision model")]
    ImageEncode(#[source] image::ImageError),

    #[error("Vision model returned an empty caption")]
    EmptyCaption,

    #[error("Embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Vector index (Pinecone) errors
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Connection failed to vector index at {url}")]
    Connection {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Index not found: {name}")]
    IndexNotFound { name: String },

    #[error("Vector index request failed (status {status}): {message}")]
    Request { status: u16, message: String },

    #[error("Invalid response from vector index")]
    InvalidResponse {
        #[source]
        source: reqwest::Error,
    },
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Render an error together with its chain of sources, outermost first.
///
/// The top-level variants above carry short messages ("Database error") and
/// keep the detail in their sources, so the full chain is what ends up in a
/// record's `analysis` column and in the logs.
pub fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.ends_with(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}
