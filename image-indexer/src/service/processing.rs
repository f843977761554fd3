//! Item processor: one pending record in, one terminal state out.

use std::path::Path;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::{ERROR_ANALYSIS_PREFIX, MISSING_FILE_ANALYSIS, WorkerContext};
use crate::capabilities::{Captioner, Embedder, VectorIndex, VectorRecord};
use crate::db::{PendingImage, ProcessedUpdate, StoreConnection};
use crate::error::{InferenceError, ServiceError, ServiceResult, error_chain};
use crate::imaging;

/// Terminal state a record reaches after one processing attempt
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalState {
    Completed {
        caption: String,
        embedding: Vec<f32>,
        elapsed_ms: i64,
    },
    MissingFile,
    Failed {
        message: String,
    },
}

/// Whether the terminal state made it into the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Committed,
    /// The failure write itself failed; the record is still pending
    CommitFailed { error: String },
}

/// Result of processing one record
#[derive(Debug, Clone, PartialEq)]
pub struct ItemReport {
    pub id: String,
    pub outcome: TerminalState,
    pub finalize: FinalizeOutcome,
}

impl<C, E, V> WorkerContext<C, E, V>
where
    C: Captioner,
    E: Embedder,
    V: VectorIndex,
{
    /// Process one pending record and write its terminal state.
    ///
    /// Errors never escape: they become a `Failed` state, and a store that
    /// rejects even that write is reported as `CommitFailed`.
    pub async fn process_image(&self, store: &StoreConnection, item: &PendingImage) -> ItemReport {
        let file_path = imaging::resolve_path(self.settings.uploads_root.as_deref(), &item.path);

        if !imaging::is_readable(&file_path) {
            warn!(image_id = %item.id, path = %file_path.display(), "File not found");
            return match store.mark_processed(
                &item.id,
                &ProcessedUpdate::analysis_only(MISSING_FILE_ANALYSIS),
            ) {
                Ok(updated) => {
                    warn_if_deleted(&item.id, updated);
                    ItemReport {
                        id: item.id.clone(),
                        outcome: TerminalState::MissingFile,
                        finalize: FinalizeOutcome::Committed,
                    }
                }
                Err(e) => self.record_failure(store, item, &e),
            };
        }

        info!(image_id = %item.id, path = %file_path.display(), "Analyzing image");

        match self.analyze(store, item, &file_path).await {
            Ok(outcome) => ItemReport {
                id: item.id.clone(),
                outcome,
                finalize: FinalizeOutcome::Committed,
            },
            Err(e) => self.record_failure(store, item, &e),
        }
    }

    /// Caption, embed, index and persist. Store writes are committed only if
    /// every step succeeds.
    async fn analyze(
        &self,
        store: &StoreConnection,
        item: &PendingImage,
        file_path: &Path,
    ) -> ServiceResult<TerminalState> {
        let started = Instant::now();

        let pixels = imaging::decode_image(file_path)?;
        let caption = self.captioner.caption(&pixels).await?;
        drop(pixels);

        let embedding = self.embedder.embed(&caption).await?;
        if embedding.len() != self.settings.dimensions {
            return Err(InferenceError::DimensionMismatch {
                expected: self.settings.dimensions,
                actual: embedding.len(),
            }
            .into());
        }

        let metadata = store.fetch_metadata(&item.id)?;

        self.index
            .upsert(VectorRecord::for_image(
                &item.id,
                embedding.clone(),
                &caption,
                &metadata.user_id,
                &metadata.original_name,
                &item.path,
            ))
            .await?;

        let elapsed_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

        // Open the transaction only after the upsert: a read snapshot held
        // across it cannot be promoted once the upload service commits.
        let tx = store.begin()?;
        let staged = tx.mark_processed(
            &item.id,
            &ProcessedUpdate {
                analysis: &caption,
                embedding: Some(&embedding),
                processing_time_ms: Some(elapsed_ms),
            },
        );
        match staged {
            Ok(updated) => {
                tx.commit()?;
                warn_if_deleted(&item.id, updated);
                info!(
                    image_id = %item.id,
                    caption = %caption,
                    elapsed_ms,
                    "Analysis complete"
                );
                Ok(TerminalState::Completed {
                    caption,
                    embedding,
                    elapsed_ms,
                })
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback() {
                    warn!(image_id = %item.id, error = %rollback_err, "Rollback failed");
                } else {
                    debug!(image_id = %item.id, "Rolled back partial update");
                }
                Err(e)
            }
        }
    }

    /// Best-effort second write marking the record failed
    fn record_failure(
        &self,
        store: &StoreConnection,
        item: &PendingImage,
        error: &ServiceError,
    ) -> ItemReport {
        let message = format!("{}{}", ERROR_ANALYSIS_PREFIX, error_chain(error));
        error!(image_id = %item.id, error = %message, "Error processing image");

        let finalize = match store.mark_processed(&item.id, &ProcessedUpdate::analysis_only(&message))
        {
            Ok(updated) => {
                warn_if_deleted(&item.id, updated);
                FinalizeOutcome::Committed
            }
            Err(e) => {
                let error = error_chain(&e);
                error!(
                    image_id = %item.id,
                    error = %error,
                    "Failed to record processing failure, record left pending"
                );
                FinalizeOutcome::CommitFailed { error }
            }
        };

        ItemReport {
            id: item.id.clone(),
            outcome: TerminalState::Failed { message },
            finalize,
        }
    }
}

fn warn_if_deleted(id: &str, updated: usize) {
    if updated == 0 {
        warn!(image_id = %id, "Record disappeared before its result was written");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::testing::{
        FakeCaptioner, FakeEmbedder, RecordingIndex, TestContext, insert_pending, sample_vector,
        test_context, write_png,
    };
    use tempfile::TempDir;

    fn pending(id: &str, path: &str) -> PendingImage {
        PendingImage {
            id: id.to_string(),
            path: path.to_string(),
        }
    }

    fn install_trigger(ctx: &TestContext, sql: &str) {
        let conn = rusqlite::Connection::open(ctx.db.path()).unwrap();
        conn.execute_batch(sql).unwrap();
    }

    /// Make every write carrying an embedding fail, so the completed write aborts
    fn reject_completed_writes(ctx: &TestContext) {
        install_trigger(
            ctx,
            r#"
            CREATE TRIGGER reject_embeddings BEFORE UPDATE ON "Image"
            WHEN NEW."embedding" IS NOT NULL
            BEGIN SELECT RAISE(ABORT, 'embedding column is read-only'); END;
            "#,
        );
    }

    fn reject_all_writes(ctx: &TestContext) {
        install_trigger(
            ctx,
            r#"
            CREATE TRIGGER reject_updates BEFORE UPDATE ON "Image"
            BEGIN SELECT RAISE(ABORT, 'store is read-only'); END;
            "#,
        );
    }

    #[tokio::test]
    async fn test_successful_processing_completes_record() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(
            &dir,
            FakeCaptioner::returning("a dog running on grass"),
            FakeEmbedder::returning(sample_vector()),
            RecordingIndex::default(),
        );
        let path = write_png(dir.path(), "img1.png");
        let image = insert_pending(&ctx.db, "img1", &path);

        let store = ctx.db.connect().unwrap();
        let report = ctx.process_image(&store, &pending("img1", &path)).await;

        assert_eq!(report.id, "img1");
        assert_eq!(report.finalize, FinalizeOutcome::Committed);
        let TerminalState::Completed {
            caption,
            embedding,
            elapsed_ms,
        } = report.outcome.clone()
        else {
            panic!("expected completed, got {:?}", report.outcome);
        };
        assert_eq!(caption, "a dog running on grass");
        assert_eq!(embedding, sample_vector());

        let record = ctx.db.get_image("img1").unwrap().unwrap();
        assert!(record.ai_processed);
        assert_eq!(record.analysis.as_deref(), Some("a dog running on grass"));
        assert_eq!(record.embedding, Some(sample_vector()));
        assert_eq!(record.ai_processing_time, Some(elapsed_ms));

        let upserts = ctx.index.upserts();
        assert_eq!(upserts.len(), 1);
        assert_eq!(
            upserts[0],
            VectorRecord::for_image(
                "img1",
                sample_vector(),
                "a dog running on grass",
                "user-42",
                &image.original_name,
                &path,
            )
        );
        // The index caption always equals the stored analysis
        assert_eq!(
            upserts[0].metadata.get("caption"),
            record.analysis.as_ref()
        );
        assert_eq!(ctx.embedder.texts(), vec!["a dog running on grass"]);
    }

    #[tokio::test]
    async fn test_upload_committed_during_upsert_does_not_fail_record() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(
            &dir,
            FakeCaptioner::returning("a dog running on grass"),
            FakeEmbedder::returning(sample_vector()),
            RecordingIndex::uploading_during_upsert(&dir.path().join("images.db")),
        );
        let path = write_png(dir.path(), "img1.png");
        insert_pending(&ctx.db, "img1", &path);

        let store = ctx.db.connect().unwrap();
        let report = ctx.process_image(&store, &pending("img1", &path)).await;

        assert!(
            matches!(report.outcome, TerminalState::Completed { .. }),
            "expected completed, got {:?}",
            report.outcome
        );
        assert_eq!(report.finalize, FinalizeOutcome::Committed);

        let record = ctx.db.get_image("img1").unwrap().unwrap();
        assert!(record.ai_processed);
        assert_eq!(record.analysis.as_deref(), Some("a dog running on grass"));
        assert_eq!(record.embedding, Some(sample_vector()));
        assert_eq!(ctx.index.upserts().len(), 1);

        // The upload that landed mid-upsert is still waiting
        let store = ctx.db.connect().unwrap();
        let next = store.fetch_next_pending().unwrap().unwrap();
        assert_eq!(next.id, "upload-during-img1");
    }

    #[tokio::test]
    async fn test_missing_file_skips_models_and_index() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(
            &dir,
            FakeCaptioner::returning("never used"),
            FakeEmbedder::returning(sample_vector()),
            RecordingIndex::default(),
        );
        insert_pending(&ctx.db, "img2", "/missing.png");

        let store = ctx.db.connect().unwrap();
        let report = ctx.process_image(&store, &pending("img2", "/missing.png")).await;

        assert_eq!(report.outcome, TerminalState::MissingFile);
        assert_eq!(report.finalize, FinalizeOutcome::Committed);
        assert_eq!(ctx.captioner.calls(), 0);
        assert!(ctx.embedder.texts().is_empty());
        assert!(ctx.index.upserts().is_empty());

        let record = ctx.db.get_image("img2").unwrap().unwrap();
        assert!(record.ai_processed);
        assert_eq!(record.analysis.as_deref(), Some("File missing"));
        assert!(record.embedding.is_none());
        assert!(record.ai_processing_time.is_none());
    }

    #[tokio::test]
    async fn test_relative_path_resolved_against_uploads_root() {
        let dir = TempDir::new().unwrap();
        let mut ctx = test_context(
            &dir,
            FakeCaptioner::returning("a red bicycle"),
            FakeEmbedder::returning(sample_vector()),
            RecordingIndex::default(),
        );
        std::fs::create_dir(dir.path().join("uploads")).unwrap();
        write_png(&dir.path().join("uploads"), "bike.png");
        ctx.settings.uploads_root = Some(dir.path().to_path_buf());
        insert_pending(&ctx.db, "bike", "uploads/bike.png");

        let store = ctx.db.connect().unwrap();
        let report = ctx
            .process_image(&store, &pending("bike", "uploads/bike.png"))
            .await;

        assert!(matches!(report.outcome, TerminalState::Completed { .. }));
        // The index keeps the path as stored
        assert_eq!(
            ctx.index.upserts()[0].metadata.get("path").map(String::as_str),
            Some("uploads/bike.png")
        );
    }

    #[tokio::test]
    async fn test_caption_failure_marks_record_failed() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(
            &dir,
            FakeCaptioner::failing("out of memory"),
            FakeEmbedder::returning(sample_vector()),
            RecordingIndex::default(),
        );
        let path = write_png(dir.path(), "img3.png");
        insert_pending(&ctx.db, "img3", &path);

        let store = ctx.db.connect().unwrap();
        let report = ctx.process_image(&store, &pending("img3", &path)).await;

        assert_eq!(report.finalize, FinalizeOutcome::Committed);
        let TerminalState::Failed { message } = &report.outcome else {
            panic!("expected failed, got {:?}", report.outcome);
        };
        assert_eq!(
            message,
            "Error: Generation failed (status 500): out of memory"
        );
        assert!(ctx.embedder.texts().is_empty());
        assert!(ctx.index.upserts().is_empty());

        let record = ctx.db.get_image("img3").unwrap().unwrap();
        assert!(record.ai_processed);
        assert_eq!(record.analysis.as_deref(), Some(message.as_str()));
        assert!(record.embedding.is_none());
        assert!(record.ai_processing_time.is_none());
    }

    #[tokio::test]
    async fn test_embedding_failure_leaves_no_embedding_or_vector() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(
            &dir,
            FakeCaptioner::returning("a cat on a sofa"),
            FakeEmbedder::failing("nomic-embed-text"),
            RecordingIndex::default(),
        );
        let path = write_png(dir.path(), "img4.png");
        insert_pending(&ctx.db, "img4", &path);

        let store = ctx.db.connect().unwrap();
        let report = ctx.process_image(&store, &pending("img4", &path)).await;

        assert_eq!(
            report.outcome,
            TerminalState::Failed {
                message: "Error: Model not found: nomic-embed-text".to_string()
            }
        );
        assert!(ctx.index.upserts().is_empty());

        let record = ctx.db.get_image("img4").unwrap().unwrap();
        assert!(record.ai_processed);
        assert!(record.analysis.unwrap().starts_with("Error: "));
        assert!(record.embedding.is_none());
        assert!(record.ai_processing_time.is_none());
    }

    #[tokio::test]
    async fn test_wrong_embedding_length_is_a_failure() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(
            &dir,
            FakeCaptioner::returning("a boat"),
            FakeEmbedder::returning(vec![0.1, 0.2, 0.3]),
            RecordingIndex::default(),
        );
        let path = write_png(dir.path(), "boat.png");
        insert_pending(&ctx.db, "boat", &path);

        let store = ctx.db.connect().unwrap();
        let report = ctx.process_image(&store, &pending("boat", &path)).await;

        assert_eq!(
            report.outcome,
            TerminalState::Failed {
                message: "Error: Inference failed: Embedding has 3 dimensions, expected 768"
                    .to_string()
            }
        );
        assert!(ctx.index.upserts().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_file_is_a_failure() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(
            &dir,
            FakeCaptioner::returning("never used"),
            FakeEmbedder::returning(sample_vector()),
            RecordingIndex::default(),
        );
        let path = dir.path().join("notes.png");
        std::fs::write(&path, b"plain text pretending to be a png").unwrap();
        let path = path.display().to_string();
        insert_pending(&ctx.db, "notes", &path);

        let store = ctx.db.connect().unwrap();
        let report = ctx.process_image(&store, &pending("notes", &path)).await;

        let TerminalState::Failed { message } = report.outcome else {
            panic!("expected failed");
        };
        assert!(message.starts_with("Error: Inference failed: Failed to decode image"));
        assert_eq!(ctx.captioner.calls(), 0);
    }

    #[tokio::test]
    async fn test_index_failure_marks_record_failed() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(
            &dir,
            FakeCaptioner::returning("a mountain lake"),
            FakeEmbedder::returning(sample_vector()),
            RecordingIndex::failing("service unavailable"),
        );
        let path = write_png(dir.path(), "lake.png");
        insert_pending(&ctx.db, "lake", &path);

        let store = ctx.db.connect().unwrap();
        let report = ctx.process_image(&store, &pending("lake", &path)).await;

        assert_eq!(
            report.outcome,
            TerminalState::Failed {
                message: "Error: Vector index error: Vector index request failed (status 503): service unavailable"
                    .to_string()
            }
        );
        let record = ctx.db.get_image("lake").unwrap().unwrap();
        assert!(record.ai_processed);
        assert!(record.embedding.is_none());
    }

    #[tokio::test]
    async fn test_rejected_completion_write_rolls_back_then_fails() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(
            &dir,
            FakeCaptioner::returning("a city at night"),
            FakeEmbedder::returning(sample_vector()),
            RecordingIndex::default(),
        );
        let path = write_png(dir.path(), "city.png");
        insert_pending(&ctx.db, "city", &path);
        reject_completed_writes(&ctx);

        let store = ctx.db.connect().unwrap();
        let report = ctx.process_image(&store, &pending("city", &path)).await;

        assert_eq!(report.finalize, FinalizeOutcome::Committed);
        let TerminalState::Failed { message } = &report.outcome else {
            panic!("expected failed, got {:?}", report.outcome);
        };
        assert!(message.starts_with("Error: Database error: Query failed"));
        assert!(message.contains("embedding column is read-only"));

        let record = ctx.db.get_image("city").unwrap().unwrap();
        assert!(record.ai_processed);
        assert_eq!(record.analysis.as_deref(), Some(message.as_str()));
        assert!(record.embedding.is_none());
        assert!(record.ai_processing_time.is_none());
    }

    #[tokio::test]
    async fn test_failed_failure_write_leaves_record_pending() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(
            &dir,
            FakeCaptioner::failing("model crashed"),
            FakeEmbedder::returning(sample_vector()),
            RecordingIndex::default(),
        );
        let path = write_png(dir.path(), "img5.png");
        insert_pending(&ctx.db, "img5", &path);
        reject_all_writes(&ctx);

        let store = ctx.db.connect().unwrap();
        let report = ctx.process_image(&store, &pending("img5", &path)).await;

        assert!(matches!(report.outcome, TerminalState::Failed { .. }));
        let FinalizeOutcome::CommitFailed { error } = &report.finalize else {
            panic!("expected commit failure, got {:?}", report.finalize);
        };
        assert!(error.contains("store is read-only"));

        let record = ctx.db.get_image("img5").unwrap().unwrap();
        assert!(!record.ai_processed);
        assert!(record.analysis.is_none());
        assert_eq!(
            store.fetch_next_pending().unwrap().map(|p| p.id),
            Some("img5".to_string())
        );
    }

    #[tokio::test]
    async fn test_missing_file_write_failure_reports_commit_failed() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(
            &dir,
            FakeCaptioner::returning("never used"),
            FakeEmbedder::returning(sample_vector()),
            RecordingIndex::default(),
        );
        insert_pending(&ctx.db, "gone", "/missing.png");
        reject_all_writes(&ctx);

        let store = ctx.db.connect().unwrap();
        let report = ctx.process_image(&store, &pending("gone", "/missing.png")).await;

        assert!(matches!(report.outcome, TerminalState::Failed { .. }));
        assert!(matches!(report.finalize, FinalizeOutcome::CommitFailed { .. }));
        assert_eq!(ctx.captioner.calls(), 0);
    }

    #[tokio::test]
    async fn test_deleted_row_gets_unknown_metadata() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(
            &dir,
            FakeCaptioner::returning("a lighthouse"),
            FakeEmbedder::returning(sample_vector()),
            RecordingIndex::default(),
        );
        let path = write_png(dir.path(), "lighthouse.png");

        // Dispatched, then deleted by the upload service before lookup
        let store = ctx.db.connect().unwrap();
        let report = ctx
            .process_image(&store, &pending("lighthouse", &path))
            .await;

        assert!(matches!(report.outcome, TerminalState::Completed { .. }));
        let upserts = ctx.index.upserts();
        assert_eq!(
            upserts[0].metadata.get("userId").map(String::as_str),
            Some("unknown")
        );
        assert_eq!(
            upserts[0].metadata.get("filename").map(String::as_str),
            Some("unknown")
        );
    }
}
