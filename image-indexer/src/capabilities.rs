//! External capabilities the item processor drives.
//!
//! Each trait is a plain request/response contract; the concrete adapters
//! live in `ollama` (captioning, embedding) and `pinecone` (vector index).
//! Uses native async fn in traits, so implementations are used through
//! generics rather than trait objects.

use std::collections::BTreeMap;
use std::future::Future;

use image::RgbImage;
use serde::Serialize;

use crate::error::ServiceResult;

/// Produces a short natural-language caption for decoded pixels
pub trait Captioner: Send + Sync {
    fn caption(&self, image: &RgbImage) -> impl Future<Output = ServiceResult<String>> + Send;
}

/// Maps text to a fixed-length dense vector
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> impl Future<Output = ServiceResult<Vec<f32>>> + Send;
}

/// Stores vectors by id, replacing any existing entry with the same id
pub trait VectorIndex: Send + Sync {
    fn upsert(&self, record: VectorRecord) -> impl Future<Output = ServiceResult<()>> + Send;
}

/// One vector index entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorRecord {
    pub id: String,
    pub values: Vec<f32>,
    pub metadata: BTreeMap<String, String>,
}

impl VectorRecord {
    /// Entry for a captioned image: caption, owner, original filename and path
    pub fn for_image(
        id: &str,
        values: Vec<f32>,
        caption: &str,
        user_id: &str,
        filename: &str,
        path: &str,
    ) -> Self {
        let metadata = BTreeMap::from([
            ("caption".to_string(), caption.to_string()),
            ("userId".to_string(), user_id.to_string()),
            ("filename".to_string(), filename.to_string()),
            ("path".to_string(), path.to_string()),
        ]);

        Self {
            id: id.to_string(),
            values,
            metadata,
        }
    }
}
