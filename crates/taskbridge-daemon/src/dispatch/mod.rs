//! Outbox dispatcher: turns claimed events into external mutations.
//!
//! Workers share one [`Dispatcher`] and loop claim-process-commit. The
//! claim transaction is the only mutual exclusion between workers; each
//! event's success path commits the mapping update, the `sent` transition,
//! and the audit entry in one transaction. Failures are classified through
//! the gateway taxonomy: transient ones go back to the queue with
//! exponential backoff and jitter, permanent ones are dead-lettered with an
//! operator notification.

mod handlers;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use taskbridge_core::config::SyncConfig;
use taskbridge_core::forge::ForgeGateway;
use taskbridge_core::gateway::GatewayError;
use taskbridge_core::model::SyncStatus;
use taskbridge_core::redact::redact;
use taskbridge_core::sheet::SheetGateway;

use crate::event::{EventPayload, OutboxEvent};
use crate::resolver::IdentityResolver;
use crate::store::{audit, mappings, outbox, Store, StoreError};

/// Dispatcher tuning, derived from [`SyncConfig`].
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub batch_size: usize,
    /// Idle delay between claim passes.
    pub tick: Duration,
    pub reclaim_after: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub max_attempts: u32,
    /// Operator chat for dead-letter notifications.
    pub notify_chat_id: Option<String>,
}

impl DispatcherConfig {
    #[must_use]
    pub fn from_sync(sync: &SyncConfig, notify_chat_id: Option<String>) -> Self {
        Self {
            batch_size: sync.batch_size,
            tick: Duration::from_secs(1),
            reclaim_after: sync.reclaim_after,
            backoff_base: sync.backoff_base,
            backoff_cap: sync.backoff_cap,
            max_attempts: sync.max_attempts,
            notify_chat_id,
        }
    }
}

/// Internal handler failure, classified for the retry decision.
#[derive(Debug, Error)]
pub(crate) enum HandlerError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The event payload cannot be acted on (missing binding, unregistered
    /// table). Always permanent.
    #[error("{0}")]
    Payload(String),
}

impl HandlerError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Gateway(err) => err.is_transient(),
            // Local store trouble other than a definitively missing row is
            // worth retrying.
            Self::Store(err) => !matches!(err, StoreError::NotFound { .. }),
            Self::Payload(_) => false,
        }
    }
}

/// Applies outbox events to the external stores.
pub struct Dispatcher {
    store: Store,
    forge: Arc<dyn ForgeGateway>,
    sheet: Arc<dyn SheetGateway>,
    resolver: Arc<IdentityResolver>,
    config: DispatcherConfig,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        store: Store,
        forge: Arc<dyn ForgeGateway>,
        sheet: Arc<dyn SheetGateway>,
        resolver: Arc<IdentityResolver>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            forge,
            sheet,
            resolver,
            config,
        }
    }

    /// Worker loop: claim, process, sleep, until shutdown. Finishes the
    /// batch in hand before exiting.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(batch_size = self.config.batch_size, "dispatcher worker started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(self.config.tick) => {
                    match self.drain_once().await {
                        Ok(0) => {}
                        Ok(processed) => debug!(processed, "dispatched outbox batch"),
                        Err(err) => warn!(error = %err, "outbox claim failed"),
                    }
                }
            }
        }
        info!("dispatcher worker stopped");
    }

    /// Claims and processes one batch. Returns the number of claimed
    /// events.
    pub async fn drain_once(&self) -> Result<usize, StoreError> {
        let store = self.store.clone();
        let batch = self.config.batch_size;
        let reclaim_after = self.config.reclaim_after;
        let events = tokio::task::spawn_blocking(move || {
            store.transaction(|tx| outbox::claim(tx, batch, Utc::now(), reclaim_after))
        })
        .await
        .map_err(|err| StoreError::Constraint(format!("claim task failed: {err}")))??;

        let count = events.len();
        for event in events {
            self.process(event).await;
        }
        Ok(count)
    }

    /// Drains until no event is immediately claimable. Backed-off events
    /// stay queued for a later pass.
    pub async fn drain(&self) -> Result<usize, StoreError> {
        let mut total = 0;
        loop {
            let processed = self.drain_once().await?;
            if processed == 0 {
                return Ok(total);
            }
            total += processed;
        }
    }

    async fn process(&self, event: OutboxEvent) {
        let kind = event.payload.kind();
        match self.handle(&event).await {
            Ok(()) => debug!(event_id = %event.event_id, kind, "event dispatched"),
            Err(err) => self.fail(&event, &err).await,
        }
    }

    async fn handle(&self, event: &OutboxEvent) -> Result<(), HandlerError> {
        match event.payload.clone() {
            EventPayload::ForgeCreateIssue { task_id } => {
                self.forge_create(&event.event_id, &task_id).await
            }
            EventPayload::ForgeUpdateIssue { task_id, fields } => {
                self.forge_update(&event.event_id, &task_id, fields).await
            }
            EventPayload::ForgeCloseIssue { task_id, reason } => {
                self.forge_close(&event.event_id, &task_id, reason).await
            }
            EventPayload::SheetCreateRecord { task_id, table } => {
                self.sheet_create(&event.event_id, &task_id, &table).await
            }
            EventPayload::SheetUpdateRecord { task_id, .. } => {
                self.sheet_update(&event.event_id, &task_id).await
            }
            EventPayload::ConvertForgeToSheet { issue, table } => {
                self.convert_forge_to_sheet(&event.event_id, &issue, &table).await
            }
            EventPayload::ConvertSheetToForge { record } => {
                self.convert_sheet_to_forge(&event.event_id, &record).await
            }
            EventPayload::NotifyMember { member_id, message } => {
                self.notify(&event.event_id, member_id.as_deref(), &message).await
            }
        }
    }

    /// Applies the retry-or-dead decision for a failed event.
    async fn fail(&self, event: &OutboxEvent, err: &HandlerError) {
        let attempts = event.attempts + 1;
        let exhausted = attempts >= event.max_attempts;
        let message = redact(&err.to_string());

        if err.is_transient() && !exhausted {
            let delay = backoff_delay(self.config.backoff_base, self.config.backoff_cap, attempts);
            warn!(
                event_id = %event.event_id,
                kind = event.payload.kind(),
                attempts,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "event failed, will retry"
            );

            let store = self.store.clone();
            let event_id = event.event_id.clone();
            let kind = event.payload.kind();
            let task_id = event.payload.task_id().map(ToOwned::to_owned);
            let outcome = tokio::task::spawn_blocking(move || {
                store.transaction(|tx| {
                    let now = Utc::now();
                    let not_before = now
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(60));
                    outbox::retry(tx, &event_id, &message, not_before, now)?;
                    audit::append(
                        tx,
                        "outbound",
                        kind,
                        task_id.as_deref(),
                        "failed",
                        Some(&message),
                        now,
                    )
                })
            })
            .await;
            if let Ok(Err(store_err)) = outcome {
                error!(error = %store_err, "failed to record event retry");
            }
            return;
        }

        error!(
            event_id = %event.event_id,
            kind = event.payload.kind(),
            attempts,
            error = %message,
            "event dead-lettered"
        );

        let store = self.store.clone();
        let event_id = event.event_id.clone();
        let kind = event.payload.kind();
        let task_id = event.payload.task_id().map(ToOwned::to_owned);
        let notify = !matches!(event.payload, EventPayload::NotifyMember { .. });
        let max_attempts = self.config.max_attempts;
        let outcome = tokio::task::spawn_blocking(move || {
            store.transaction(|tx| {
                let now = Utc::now();
                outbox::mark_dead(tx, &event_id, &message, now)?;
                if let Some(task_id) = &task_id {
                    match mappings::set_sync_status(tx, task_id, SyncStatus::Error, now) {
                        Ok(()) | Err(StoreError::NotFound { .. }) => {}
                        Err(err) => return Err(err),
                    }
                }
                if notify {
                    let text = format!("sync event {kind} ({event_id}) dead-lettered: {message}");
                    outbox::enqueue(
                        tx,
                        &EventPayload::NotifyMember {
                            member_id: None,
                            message: text,
                        },
                        max_attempts,
                        now,
                    )?;
                }
                audit::append(
                    tx,
                    "outbound",
                    kind,
                    task_id.as_deref(),
                    "dead",
                    Some(&message),
                    now,
                )
            })
        })
        .await;
        if let Ok(Err(store_err)) = outcome {
            error!(error = %store_err, "failed to record dead letter");
        }
    }
}

/// Exponential backoff with multiplicative jitter: `base * 2^attempts`,
/// capped, then scaled into `[0.5, 1.0)` so retrying workers spread out.
#[must_use]
pub fn backoff_delay(base: Duration, cap: Duration, attempts: u32) -> Duration {
    let exponent = attempts.min(16);
    let full = base.saturating_mul(2u32.saturating_pow(exponent)).min(cap);
    let jitter = rand::thread_rng().gen_range(0.5..1.0);
    full.mul_f64(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(10);
        let first = backoff_delay(base, cap, 1);
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(200));

        for attempts in 0..20 {
            assert!(backoff_delay(base, cap, attempts) <= cap);
        }
    }
}
