//! Identity resolver: email-keyed members to external identities.
//!
//! The member row is authoritative; the in-memory map is a read-through
//! cache over it. A facet that cannot be resolved is left unset and the
//! member stays usable; the sheet assignee column simply stays empty until
//! resolution succeeds.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use taskbridge_core::sheet::SheetGateway;

use crate::store::{members, Store, StoreError};

/// External identities of one member.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub forge_username: Option<String>,
    pub sheet_open_id: Option<String>,
}

/// Resolves and caches member identities.
pub struct IdentityResolver {
    store: Store,
    sheet: Arc<dyn SheetGateway>,
    cache: RwLock<HashMap<String, Identity>>,
}

impl IdentityResolver {
    #[must_use]
    pub fn new(store: Store, sheet: Arc<dyn SheetGateway>) -> Self {
        Self {
            store,
            sheet,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolves a member's identities, looking the sheet open id up via the
    /// contact API on a cache miss and persisting the result on the row.
    ///
    /// A failed contact lookup is non-fatal: the facet stays `None`.
    ///
    /// # Errors
    ///
    /// Returns an error when the member does not exist or the store fails.
    pub async fn resolve(&self, member_id: &str) -> Result<Identity, StoreError> {
        if let Some(identity) = self.cache.read().await.get(member_id) {
            return Ok(identity.clone());
        }

        let store = self.store.clone();
        let id = member_id.to_owned();
        let member = tokio::task::spawn_blocking(move || {
            store.read(|conn| members::find_by_id(conn, &id))
        })
        .await
        .map_err(|err| StoreError::Constraint(format!("resolver task failed: {err}")))??
        .ok_or_else(|| StoreError::NotFound {
            what: "member",
            id: member_id.to_owned(),
        })?;

        let mut identity = Identity {
            forge_username: member.forge_username.clone(),
            sheet_open_id: member.sheet_open_id.clone(),
        };

        if identity.sheet_open_id.is_none() {
            match self.sheet.lookup_open_id(&member.email).await {
                Ok(Some(open_id)) => {
                    debug!(member_id, "resolved sheet open id");
                    identity.sheet_open_id = Some(open_id.clone());
                    let store = self.store.clone();
                    let id = member.member_id.clone();
                    tokio::task::spawn_blocking(move || {
                        store.transaction(|tx| {
                            members::set_identity(tx, &id, None, Some(&open_id), Utc::now())
                        })
                    })
                    .await
                    .map_err(|err| {
                        StoreError::Constraint(format!("resolver task failed: {err}"))
                    })??;
                }
                Ok(None) => debug!(member_id, "no sheet identity for member"),
                Err(err) => warn!(member_id, error = %err, "sheet contact lookup failed"),
            }
        }

        self.cache
            .write()
            .await
            .insert(member_id.to_owned(), identity.clone());
        Ok(identity)
    }

    /// Drops a cached identity, forcing re-resolution. Called when a
    /// gateway reports a referenced id as invalid or an email changes.
    pub async fn invalidate(&self, member_id: &str) {
        self.cache.write().await.remove(member_id);
    }
}
