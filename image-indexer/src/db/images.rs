//! Image record queries: pending selection, metadata lookup and terminal writes.

use chrono::SecondsFormat;
use rusqlite::{Connection, OptionalExtension, params};

use super::models::{
    ImageMetadata, ImageRecord, NewImage, PendingImage, ProcessedUpdate, encode_embedding,
};
use super::{Database, StoreConnection, StoreTransaction};
use crate::error::{DatabaseError, ServiceResult};

impl StoreConnection {
    /// Get one record that has not been processed yet, oldest upload first
    pub fn fetch_next_pending(&self) -> ServiceResult<Option<PendingImage>> {
        self.conn
            .query_row(
                r#"SELECT "id", "path" FROM "Image" WHERE "aiProcessed" = 0 ORDER BY "createdAt" ASC LIMIT 1"#,
                [],
                |row| {
                    Ok(PendingImage {
                        id: row.get(0)?,
                        path: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(DatabaseError::Query)
            .map_err(Into::into)
    }

    /// Look up index metadata, substituting sentinels when the row is gone
    pub fn fetch_metadata(&self, id: &str) -> ServiceResult<ImageMetadata> {
        let metadata = self
            .conn
            .query_row(
                r#"SELECT "userId", "originalName" FROM "Image" WHERE "id" = ?1"#,
                params![id],
                |row| {
                    Ok(ImageMetadata {
                        user_id: row.get(0)?,
                        original_name: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(DatabaseError::Query)?;

        Ok(metadata.unwrap_or_else(ImageMetadata::unknown))
    }

    /// Mark a record processed in its own transaction.
    ///
    /// Returns the number of rows updated (0 if the record was deleted).
    pub fn mark_processed(&self, id: &str, update: &ProcessedUpdate<'_>) -> ServiceResult<usize> {
        let tx = self.begin()?;
        let updated = tx.mark_processed(id, update)?;
        tx.commit()?;
        Ok(updated)
    }
}

impl StoreTransaction<'_> {
    /// Stage the terminal write; it only persists on commit
    pub fn mark_processed(&self, id: &str, update: &ProcessedUpdate<'_>) -> ServiceResult<usize> {
        update_processed(&self.tx, id, update)
    }
}

fn update_processed(conn: &Connection, id: &str, update: &ProcessedUpdate<'_>) -> ServiceResult<usize> {
    let embedding_bytes = update.embedding.map(encode_embedding);

    // COALESCE keeps columns the update does not carry untouched
    let updated = conn
        .execute(
            r#"
            UPDATE "Image"
            SET "aiProcessed" = 1,
                "analysis" = ?1,
                "embedding" = COALESCE(?2, "embedding"),
                "aiProcessingTime" = COALESCE(?3, "aiProcessingTime")
            WHERE "id" = ?4
            "#,
            params![
                update.analysis,
                embedding_bytes,
                update.processing_time_ms,
                id
            ],
        )
        .map_err(DatabaseError::Query)?;

    Ok(updated)
}

impl Database {
    /// Insert a pending record the way the upload service does
    pub fn insert_image(&self, image: &NewImage) -> ServiceResult<()> {
        let store = self.connect()?;

        store
            .conn
            .execute(
                r#"
                INSERT INTO "Image" ("id", "userId", "filename", "originalName", "path", "mimeType", "size", "aiProcessed", "createdAt")
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)
                "#,
                params![
                    image.id,
                    image.user_id,
                    image.filename,
                    image.original_name,
                    image.path,
                    image.mime_type,
                    image.size,
                    image
                        .created_at
                        .to_rfc3339_opts(SecondsFormat::Millis, true),
                ],
            )
            .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Get a record by ID
    pub fn get_image(&self, id: &str) -> ServiceResult<Option<ImageRecord>> {
        let store = self.connect()?;

        store
            .conn
            .query_row(
                &format!(r#"SELECT {} FROM "Image" WHERE "id" = ?1"#, ImageRecord::COLUMNS),
                params![id],
                ImageRecord::from_row,
            )
            .optional()
            .map_err(DatabaseError::Query)
            .map_err(Into::into)
    }

    /// Number of records still waiting for processing
    pub fn pending_count(&self) -> ServiceResult<usize> {
        let store = self.connect()?;

        let count: usize = store
            .conn
            .query_row(
                r#"SELECT COUNT(*) FROM "Image" WHERE "aiProcessed" = 0"#,
                [],
                |row| row.get(0),
            )
            .map_err(DatabaseError::Query)?;

        Ok(count)
    }
}
