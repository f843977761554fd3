//! Poll loop that feeds pending records to the item processor.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{FinalizeOutcome, ItemReport, TerminalState, WorkerContext};
use crate::capabilities::{Captioner, Embedder, VectorIndex};
use crate::db::{PendingImage, StoreConnection};
use crate::error::error_chain;

/// Where the dispatcher is in its cycle. A connection lives exactly as long
/// as the cycle that acquired it.
pub enum WorkerState {
    Connecting,
    Polling(StoreConnection),
    Processing(StoreConnection, PendingImage),
}

impl WorkerState {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerState::Connecting => "connecting",
            WorkerState::Polling(_) => "polling",
            WorkerState::Processing(..) => "processing",
        }
    }
}

/// What a single step did
#[derive(Debug)]
pub enum Transition {
    Connected,
    ConnectFailed,
    Dispatched,
    Idle,
    PollFailed,
    Finished(ItemReport),
    Faulted,
}

/// One state machine step: the next state and how long to wait before it
pub struct Step {
    pub next: WorkerState,
    pub transition: Transition,
    pub delay: Option<Duration>,
}

/// Single-worker poll loop over a [`WorkerContext`].
///
/// The processor borrows the cycle's `rusqlite` connection across awaits, and
/// `Connection` is not `Sync`, so the future returned by [`Dispatcher::run`]
/// is not `Send`. Await it on the task that owns the context rather than
/// handing it to `tokio::spawn`.
pub struct Dispatcher<'ctx, C, E, V> {
    ctx: &'ctx WorkerContext<C, E, V>,
}

impl<'ctx, C, E, V> Dispatcher<'ctx, C, E, V>
where
    C: Captioner,
    E: Embedder,
    V: VectorIndex,
{
    pub fn new(ctx: &'ctx WorkerContext<C, E, V>) -> Self {
        Self { ctx }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Cancellation is observed between steps and during delays; a record
    /// being processed always runs to completion.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Image processing worker started");

        let mut state = WorkerState::Connecting;
        while !shutdown.is_cancelled() {
            let step = self.step(state).await;
            state = step.next;

            match step.delay {
                Some(delay) if !delay.is_zero() => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Some(_) => tokio::task::yield_now().await,
                None => {}
            }
        }

        info!(state = state.name(), "Image processing worker stopped");
    }

    /// Advance the state machine by one step
    pub async fn step(&self, state: WorkerState) -> Step {
        let delays = &self.ctx.settings.delays;

        match state {
            WorkerState::Connecting => match self.ctx.db.connect() {
                Ok(conn) => {
                    debug!("Store connection acquired");
                    Step {
                        next: WorkerState::Polling(conn),
                        transition: Transition::Connected,
                        delay: None,
                    }
                }
                Err(e) => {
                    error!(
                        error = %error_chain(&e),
                        retry_in_secs = delays.reconnect_delay_secs,
                        "Database connection failed"
                    );
                    Step {
                        next: WorkerState::Connecting,
                        transition: Transition::ConnectFailed,
                        delay: Some(delays.reconnect_delay()),
                    }
                }
            },

            WorkerState::Polling(conn) => match conn.fetch_next_pending() {
                Ok(Some(item)) => Step {
                    next: WorkerState::Processing(conn, item),
                    transition: Transition::Dispatched,
                    delay: None,
                },
                Ok(None) => Step {
                    next: WorkerState::Polling(conn),
                    transition: Transition::Idle,
                    delay: Some(delays.idle_delay()),
                },
                Err(e) => {
                    error!(error = %error_chain(&e), "Failed to check for pending images");
                    drop(conn);
                    Step {
                        next: WorkerState::Connecting,
                        transition: Transition::PollFailed,
                        delay: Some(delays.fault_delay()),
                    }
                }
            },

            WorkerState::Processing(conn, item) => {
                let result = AssertUnwindSafe(self.ctx.process_image(&conn, &item))
                    .catch_unwind()
                    .await;
                // Release before the next cycle reconnects
                drop(conn);

                match result {
                    Ok(report) => {
                        log_report(&report);
                        // A store rejecting writes would otherwise re-run the models on the same row at once
                        let delay = match report.finalize {
                            FinalizeOutcome::Committed => None,
                            FinalizeOutcome::CommitFailed { .. } => Some(delays.fault_delay()),
                        };
                        Step {
                            next: WorkerState::Connecting,
                            transition: Transition::Finished(report),
                            delay,
                        }
                    }
                    Err(panic) => {
                        error!(
                            image_id = %item.id,
                            panic = %panic_message(panic.as_ref()),
                            "Image processing panicked"
                        );
                        Step {
                            next: WorkerState::Connecting,
                            transition: Transition::Faulted,
                            delay: Some(delays.fault_delay()),
                        }
                    }
                }
            }
        }
    }
}

fn log_report(report: &ItemReport) {
    let outcome = match &report.outcome {
        TerminalState::Completed { .. } => "completed",
        TerminalState::MissingFile => "missing_file",
        TerminalState::Failed { .. } => "failed",
    };

    match &report.finalize {
        FinalizeOutcome::Committed => {
            debug!(image_id = %report.id, outcome, "Image finalized");
        }
        FinalizeOutcome::CommitFailed { error } => {
            warn!(
                image_id = %report.id,
                outcome,
                error = %error,
                "Image left pending for a later cycle"
            );
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
