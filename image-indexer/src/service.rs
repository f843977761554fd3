//! Image processing service: the item processor and the poll loop that feeds it.
//!
//! - `processing`: captions, embeds and indexes one record, then finalizes it
//! - `workers`: the dispatcher state machine (connect, poll, process)

mod processing;
mod workers;

#[cfg(test)]
pub(crate) mod testing;

pub use processing::{FinalizeOutcome, ItemReport, TerminalState};
pub use workers::{Dispatcher, WorkerState};

use std::path::PathBuf;

use crate::capabilities::{Captioner, Embedder, VectorIndex};
use crate::config::WorkerConfig;
use crate::db::Database;

/// Analysis written for records whose file cannot be opened
pub const MISSING_FILE_ANALYSIS: &str = "File missing";

/// Prefix of the analysis written for records that failed processing
pub const ERROR_ANALYSIS_PREFIX: &str = "Error: ";

/// Long-lived handles shared by the dispatcher and the item processor.
///
/// Built once at startup and passed by reference.
pub struct WorkerContext<C, E, V> {
    pub db: Database,
    pub captioner: C,
    pub embedder: E,
    pub index: V,
    pub settings: WorkerSettings,
}

/// Worker knobs taken from configuration
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Expected embedding length
    pub dimensions: usize,
    /// Base directory for relative record paths
    pub uploads_root: Option<PathBuf>,
    pub delays: WorkerConfig,
}

impl<C, E, V> WorkerContext<C, E, V>
where
    C: Captioner,
    E: Embedder,
    V: VectorIndex,
{
    pub fn new(db: Database, captioner: C, embedder: E, index: V, settings: WorkerSettings) -> Self {
        Self {
            db,
            captioner,
            embedder,
            index,
            settings,
        }
    }
}
