//! Schema setup for the shared image table.
//!
//! The upload service normally creates this table. Creating it here as well
//! keeps the worker usable against a fresh database file.

use rusqlite::Connection;

use crate::error::{DatabaseError, ServiceResult};

pub(super) fn run_migrations(conn: &Connection) -> ServiceResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS "Image" (
            "id" TEXT PRIMARY KEY,
            "userId" TEXT NOT NULL,
            "filename" TEXT NOT NULL,
            "originalName" TEXT NOT NULL,
            "path" TEXT NOT NULL,
            "mimeType" TEXT,
            "size" INTEGER,
            "aiProcessed" INTEGER NOT NULL DEFAULT 0,
            "analysis" TEXT,
            "embedding" BLOB,
            "aiProcessingTime" INTEGER,
            "createdAt" TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE INDEX IF NOT EXISTS "Image_pending_idx" ON "Image"("aiProcessed", "createdAt");
        CREATE INDEX IF NOT EXISTS "Image_userId_idx" ON "Image"("userId");
        "#,
    )
    .map_err(|e| DatabaseError::Migration {
        message: e.to_string(),
    })?;

    Ok(())
}
