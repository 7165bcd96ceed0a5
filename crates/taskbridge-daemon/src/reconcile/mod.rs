//! Pull-side reconciliation.
//!
//! One reconciler per external source polls for changes past a stored
//! cursor, folds them into the local model, and enqueues the
//! opposite-direction outbox events so the other store catches up. Conflict
//! policy is last-write-wins by `updated_at`, with the mapping flagged
//! `conflict` and an operator notification enqueued; pulled state that is
//! semantically identical to the local task only advances the watermark,
//! which is what breaks push-pull write loops.

mod forge;
mod sheet;

pub use forge::{ForgeReconciler, FORGE_CURSOR};
pub use sheet::{SheetReconciler, SHEET_CURSOR};

use thiserror::Error;

use taskbridge_core::gateway::GatewayError;

use crate::store::StoreError;

/// Reconciler failures. A failed tick leaves the cursor untouched and is
/// retried on the next interval.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReconcileError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Counters for one reconciler tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Remote entities imported as new local tasks.
    pub imported: usize,
    /// Local tasks updated from remote state.
    pub updated: usize,
    /// Both-sides-changed collisions resolved by last-write-wins.
    pub conflicts: usize,
    /// Remote entities with nothing new.
    pub unchanged: usize,
}

pub(crate) async fn run_store<T, F>(store: crate::store::Store, f: F) -> Result<T, ReconcileError>
where
    T: Send + 'static,
    F: FnOnce(&rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || store.read(f))
        .await
        .map_err(|err| {
            ReconcileError::Store(StoreError::Constraint(format!("store task failed: {err}")))
        })?
        .map_err(ReconcileError::Store)
}

pub(crate) async fn run_tx<T, F>(store: crate::store::Store, f: F) -> Result<T, ReconcileError>
where
    T: Send + 'static,
    F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || store.transaction(f))
        .await
        .map_err(|err| {
            ReconcileError::Store(StoreError::Constraint(format!("store task failed: {err}")))
        })?
        .map_err(ReconcileError::Store)
}
