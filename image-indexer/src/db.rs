//! Record store for image processing state.
//!
//! The upload service owns the `"Image"` table; this worker only reads pending
//! rows and writes their terminal state. Each poll cycle works on its own
//! [`StoreConnection`], which closes when dropped.

mod images;
mod migrations;
pub mod models;

pub use models::{ImageMetadata, ImageRecord, NewImage, PendingImage, ProcessedUpdate};

use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{DatabaseError, ServiceResult};

/// Connection factory for the shared SQLite database
pub struct Database {
    path: PathBuf,
    busy_timeout: Duration,
}

impl Database {
    /// Open or create the database at the given path and ensure the schema exists
    pub fn open(path: &Path, busy_timeout: Duration) -> ServiceResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| DatabaseError::CreateDirectory {
                path: parent.display().to_string(),
                source: e,
            })?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(DatabaseError::Connection)?;

        // WAL lets the upload service keep inserting while a cycle holds a transaction
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(DatabaseError::Query)?;

        migrations::run_migrations(&conn)?;

        Ok(Self {
            path: path.to_path_buf(),
            busy_timeout,
        })
    }

    /// Acquire a fresh connection for one poll cycle.
    ///
    /// The file must already exist: a vanished database is a connection
    /// failure, not a reason to create an empty one.
    pub fn connect(&self) -> ServiceResult<StoreConnection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(DatabaseError::Connection)?;

        conn.busy_timeout(self.busy_timeout)
            .map_err(DatabaseError::Connection)?;

        Ok(StoreConnection { conn })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A connection owned by a single poll cycle
pub struct StoreConnection {
    conn: Connection,
}

/// An open transaction on a [`StoreConnection`]. Rolls back when dropped
/// without [`StoreTransaction::commit`].
pub struct StoreTransaction<'conn> {
    tx: rusqlite::Transaction<'conn>,
}

impl StoreConnection {
    /// Start a transaction scoping the writes of one processing run
    pub fn begin(&self) -> ServiceResult<StoreTransaction<'_>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(DatabaseError::Query)?;
        Ok(StoreTransaction { tx })
    }
}

impl StoreTransaction<'_> {
    pub fn commit(self) -> ServiceResult<()> {
        self.tx.commit().map_err(DatabaseError::Query)?;
        Ok(())
    }

    pub fn rollback(self) -> ServiceResult<()> {
        self.tx.rollback().map_err(DatabaseError::Query)?;
        Ok(())
    }
}
