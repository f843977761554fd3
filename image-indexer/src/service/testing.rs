//! In-memory capabilities and fixtures for worker tests.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use image::{Rgb, RgbImage};
use tempfile::TempDir;

use super::{WorkerContext, WorkerSettings};
use crate::capabilities::{Captioner, Embedder, VectorIndex, VectorRecord};
use crate::config::WorkerConfig;
use crate::db::{Database, NewImage};
use crate::error::{IndexError, OllamaError, ServiceResult};

pub const DIMENSIONS: usize = 768;

/// Captioner returning a fixed caption, or failing like an unreachable model
pub struct FakeCaptioner {
    caption: Result<String, String>,
    panics: bool,
    calls: AtomicUsize,
}

impl FakeCaptioner {
    pub fn returning(caption: &str) -> Self {
        Self {
            caption: Ok(caption.to_string()),
            panics: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            caption: Err(message.to_string()),
            panics: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn panicking() -> Self {
        Self {
            caption: Err("unreachable".to_string()),
            panics: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Captioner for FakeCaptioner {
    async fn caption(&self, _image: &RgbImage) -> ServiceResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panics {
            panic!("vision model crashed");
        }
        match &self.caption {
            Ok(caption) => Ok(caption.clone()),
            Err(message) => Err(OllamaError::Generation {
                status: 500,
                message: message.clone(),
            }
            .into()),
        }
    }
}

/// Embedder returning a fixed vector and recording the texts it saw
pub struct FakeEmbedder {
    vector: Result<Vec<f32>, String>,
    texts: Mutex<Vec<String>>,
}

impl FakeEmbedder {
    pub fn returning(vector: Vec<f32>) -> Self {
        Self {
            vector: Ok(vector),
            texts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            vector: Err(message.to_string()),
            texts: Mutex::new(Vec::new()),
        }
    }

    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }
}

impl Embedder for FakeEmbedder {
    async fn embed(&self, text: &str) -> ServiceResult<Vec<f32>> {
        self.texts.lock().unwrap().push(text.to_string());
        match &self.vector {
            Ok(vector) => Ok(vector.clone()),
            Err(message) => Err(OllamaError::ModelNotFound {
                model: message.clone(),
            }
            .into()),
        }
    }
}

/// Index that keeps every upserted record
#[derive(Default)]
pub struct RecordingIndex {
    upserts: Mutex<Vec<VectorRecord>>,
    failure: Option<String>,
    concurrent_upload: Option<PathBuf>,
}

impl RecordingIndex {
    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// Commits a new upload to the database at `db_path` from a separate
    /// connection while each upsert is in flight
    pub fn uploading_during_upsert(db_path: &Path) -> Self {
        Self {
            concurrent_upload: Some(db_path.to_path_buf()),
            ..Self::default()
        }
    }

    pub fn upserts(&self) -> Vec<VectorRecord> {
        self.upserts.lock().unwrap().clone()
    }
}

impl VectorIndex for RecordingIndex {
    async fn upsert(&self, record: VectorRecord) -> ServiceResult<()> {
        if let Some(message) = &self.failure {
            return Err(IndexError::Request {
                status: 503,
                message: message.clone(),
            }
            .into());
        }
        if let Some(db_path) = &self.concurrent_upload {
            let conn = rusqlite::Connection::open(db_path).unwrap();
            conn.execute(
                r#"INSERT INTO "Image" ("id", "userId", "filename", "originalName", "path")
                   VALUES (?1, 'user-7', 'late.png', 'late.png', '/data/late.png')"#,
                rusqlite::params![format!("upload-during-{}", record.id)],
            )
            .unwrap();
        }
        self.upserts.lock().unwrap().push(record);
        Ok(())
    }
}

pub type TestContext = WorkerContext<FakeCaptioner, FakeEmbedder, RecordingIndex>;

/// A 768-long vector with distinguishable entries
pub fn sample_vector() -> Vec<f32> {
    (0..DIMENSIONS).map(|i| i as f32 / DIMENSIONS as f32).collect()
}

/// Worker context over a fresh database in `dir`, with zero delays
pub fn test_context(
    dir: &TempDir,
    captioner: FakeCaptioner,
    embedder: FakeEmbedder,
    index: RecordingIndex,
) -> TestContext {
    let db = Database::open(&dir.path().join("images.db"), Duration::from_secs(1)).unwrap();
    let settings = WorkerSettings {
        dimensions: DIMENSIONS,
        uploads_root: None,
        delays: WorkerConfig {
            reconnect_delay_secs: 0,
            idle_delay_secs: 0,
            fault_delay_secs: 0,
        },
    };
    WorkerContext::new(db, captioner, embedder, index, settings)
}

/// Write a small PNG and return its path as stored in a record
pub fn write_png(dir: &Path, name: &str) -> String {
    let path = dir.join(name);
    RgbImage::from_pixel(8, 8, Rgb([40, 160, 40])).save(&path).unwrap();
    path.display().to_string()
}

/// Insert a pending record and return it
pub fn insert_pending(db: &Database, id: &str, path: &str) -> NewImage {
    let mut image = NewImage::new("user-42", path);
    image.id = id.to_string();
    image.original_name = format!("{}-original.png", id);
    db.insert_image(&image).unwrap();
    image
}
