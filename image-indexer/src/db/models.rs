//! Database model structs.

use chrono::{DateTime, Utc};
use rusqlite::Row;

use crate::error::DatabaseError;

/// Placeholder used when a record's metadata cannot be found at lookup time
pub const UNKNOWN_METADATA: &str = "unknown";

/// A full row of the `"Image"` table
#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub id: String,
    pub user_id: String,
    pub filename: String,
    pub original_name: String,
    pub path: String,
    pub mime_type: Option<String>,
    pub size: Option<i64>,
    pub ai_processed: bool,
    pub analysis: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub ai_processing_time: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl ImageRecord {
    pub(crate) const COLUMNS: &'static str = r#""id", "userId", "filename", "originalName", "path", "mimeType", "size", "aiProcessed", "analysis", "embedding", "aiProcessingTime", "createdAt""#;

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let embedding: Option<Vec<u8>> = row.get(9)?;
        let embedding = embedding
            .map(|bytes| decode_embedding(&bytes))
            .transpose()
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Blob, Box::new(e))
            })?;

        let created_at: String = row.get(11)?;
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(11, rusqlite::types::Type::Text, Box::new(e))
            })?;

        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            filename: row.get(2)?,
            original_name: row.get(3)?,
            path: row.get(4)?,
            mime_type: row.get(5)?,
            size: row.get(6)?,
            ai_processed: row.get(7)?,
            analysis: row.get(8)?,
            embedding,
            ai_processing_time: row.get(10)?,
            created_at,
        })
    }
}

/// The part of a pending record the dispatcher hands to the processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingImage {
    pub id: String,
    pub path: String,
}

/// Descriptive fields copied into the vector index metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMetadata {
    pub user_id: String,
    pub original_name: String,
}

impl ImageMetadata {
    /// Sentinel for rows deleted between dispatch and lookup
    pub fn unknown() -> Self {
        Self {
            user_id: UNKNOWN_METADATA.to_string(),
            original_name: UNKNOWN_METADATA.to_string(),
        }
    }
}

/// A row as the upload service creates it
#[derive(Debug, Clone)]
pub struct NewImage {
    pub id: String,
    pub user_id: String,
    pub filename: String,
    pub original_name: String,
    pub path: String,
    pub mime_type: Option<String>,
    pub size: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl NewImage {
    /// A pending upload with a generated id, named after the file at `path`
    pub fn new(user_id: impl Into<String>, path: impl Into<String>) -> Self {
        let path = path.into();
        let filename = std::path::Path::new(&path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.clone());

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            original_name: filename.clone(),
            filename,
            path,
            mime_type: None,
            size: None,
            created_at: Utc::now(),
        }
    }
}

/// Fields written when a record reaches a terminal state.
///
/// `None` leaves the column as it was.
#[derive(Debug, Clone, Copy)]
pub struct ProcessedUpdate<'a> {
    pub analysis: &'a str,
    pub embedding: Option<&'a [f32]>,
    pub processing_time_ms: Option<i64>,
}

impl<'a> ProcessedUpdate<'a> {
    /// Terminal write carrying only an analysis string (missing file, failure)
    pub fn analysis_only(analysis: &'a str) -> Self {
        Self {
            analysis,
            embedding: None,
            processing_time_ms: None,
        }
    }
}

/// Little-endian `f32` encoding used for the `embedding` column
pub fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub fn decode_embedding(bytes: &[u8]) -> Result<Vec<f32>, DatabaseError> {
    if bytes.len() % 4 != 0 {
        return Err(DatabaseError::CorruptEmbedding { len: bytes.len() });
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}
