//! Consumer-side view of one session
//!
//! Wraps any [`VariableService`] with a read-through cache. Entries are
//! keyed by variable id and reachable by name or id, so a write through
//! either identifier drops the same entry. They expire after a TTL and can
//! additionally be invalidated by a background watch on the cached variables.

use dashmap::DashMap;
use futures::StreamExt;
use serde_json::Value as Json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::variable_service::{VariableService, WatchOptions};
use crate::domain::value::VariableValue;
use crate::domain::variable::{Caller, SessionId, Variable, VariableId};
use crate::error::{VarError, VarResult};

#[derive(Debug, Clone)]
struct CacheEntry {
    value: VariableValue,
    fetched_at: Instant,
}

/// Cached access to one session for one caller
pub struct SessionContext {
    service: Arc<dyn VariableService>,
    session_id: SessionId,
    caller: Caller,
    ttl: Duration,
    cache: Arc<DashMap<VariableId, CacheEntry>>,
    aliases: Arc<DashMap<String, VariableId>>,
    invalidator: Option<JoinHandle<()>>,
}

impl SessionContext {
    /// Create a context with the given cache TTL
    pub fn new(service: Arc<dyn VariableService>, session_id: SessionId, caller: Caller, ttl: Duration) -> Self {
        Self {
            service,
            session_id,
            caller,
            ttl,
            cache: Arc::new(DashMap::new()),
            aliases: Arc::new(DashMap::new()),
            invalidator: None,
        }
    }

    /// Session this context is bound to
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Caller this context acts as
    pub fn caller(&self) -> &Caller {
        &self.caller
    }

    /// Invalidate cached entries whenever one of `identifiers` changes.
    ///
    /// Requires `observe` on those variables. Replaces a previous watch.
    pub async fn watch_for_invalidation(&mut self, identifiers: &[String]) -> VarResult<()> {
        let mut watch = self
            .service
            .watch_variables(&self.session_id, &self.caller, identifiers, WatchOptions::default())
            .await?;
        let cache = self.cache.clone();
        let aliases = self.aliases.clone();

        if let Some(previous) = self.invalidator.take() {
            previous.abort();
        }

        self.invalidator = Some(tokio::spawn(async move {
            while let Some(update) = watch.next().await {
                debug!("Invalidating cached {} at version {}", update.name, update.version);
                cache.remove(&update.var_id);
            }
            warn!("Invalidation watch ended, dropping all cached values");
            cache.clear();
            aliases.clear();
        }));
        Ok(())
    }

    fn cached(&self, identifier: &str) -> Option<VariableValue> {
        let id = self.aliases.get(identifier)?.value().clone();
        let entry = self.cache.get(&id)?;
        if entry.fetched_at.elapsed() < self.ttl {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    fn remember(&self, variable: Variable) -> VariableValue {
        self.aliases.insert(variable.name.clone(), variable.id.clone());
        self.aliases.insert(variable.id.0.clone(), variable.id.clone());
        self.cache.insert(
            variable.id,
            CacheEntry {
                value: variable.value.clone(),
                fetched_at: Instant::now(),
            },
        );
        variable.value
    }

    fn forget(&self, identifier: &str) {
        let id = self.aliases.get(identifier).map(|entry| entry.value().clone());
        if let Some(id) = id {
            self.cache.remove(&id);
        }
    }

    /// Value by name or id, served from the cache while fresh
    pub async fn get(&self, identifier: &str) -> VarResult<VariableValue> {
        if let Some(value) = self.cached(identifier) {
            return Ok(value);
        }

        let variable = self
            .service
            .get_variable_info(&self.session_id, &self.caller, identifier)
            .await?;
        Ok(self.remember(variable))
    }

    /// Values for several identifiers; missing or unreadable ones are omitted
    pub async fn get_many(&self, identifiers: &[String]) -> VarResult<BTreeMap<String, VariableValue>> {
        let mut found = BTreeMap::new();
        for identifier in identifiers {
            match self.get(identifier).await {
                Ok(value) => {
                    found.insert(identifier.clone(), value);
                }
                Err(VarError::NotFound(_)) | Err(VarError::AccessDenied { .. }) => {
                    debug!("Skipping {} in batch read", identifier);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(found)
    }

    /// Write through to the service and drop the cached entry
    pub async fn set(&self, identifier: &str, value: impl Into<Json>) -> VarResult<u64> {
        self.forget(identifier);
        let version = self
            .service
            .set_variable(&self.session_id, &self.caller, identifier, value.into(), HashMap::new())
            .await?;
        Ok(version)
    }

    /// Drop one cached entry, or all of them
    pub fn invalidate(&self, identifier: Option<&str>) {
        match identifier {
            Some(identifier) => self.forget(identifier),
            None => self.cache.clear(),
        }
    }

    /// Whether the invalidation watch is running
    pub fn is_watching(&self) -> bool {
        self.invalidator.as_ref().map_or(false, |task| !task.is_finished())
    }

    /// Number of cached entries
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        if let Some(invalidator) = self.invalidator.take() {
            invalidator.abort();
        }
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("session_id", &self.session_id)
            .field("caller", &self.caller.id)
            .field("ttl", &self.ttl)
            .field("cached", &self.cache.len())
            .finish()
    }
}
