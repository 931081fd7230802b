//! In-memory implementation of the variable service
//!
//! Sessions live in a concurrent map keyed by session id; each session owns
//! its own [`VariableStore`], so sessions never contend on a shared lock.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value as Json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use varbridge_core::{
    AccessRule, AuditSink, BatchResults, Caller, CallerKind, DependencyKind, HistoryEntry, ListFilter,
    LivenessMonitor, LockPolicy, NoopAuditSink, NoopPropagator, ObserverCallback, ObserverOptions, OptimizationLock,
    Permission, ProgressReport, Propagator, RegisterOptions, SessionId, SessionSnapshot, SessionStorage, StoreConfig,
    SubscriptionId, TypeRegistry, TypeTag, VarError, VarResult, Variable, VariableId, VariableService, VariableValue,
    VariableWatch, WatchOptions,
};

use crate::liveness::LocalLivenessMonitor;
use crate::storage::InMemorySessionStorage;
use crate::store::{StoreDeps, VariableStore};

/// Builder for [`InMemoryVariableService`]
#[derive(Default)]
pub struct InMemoryVariableServiceBuilder {
    config: Option<StoreConfig>,
    registry: Option<Arc<TypeRegistry>>,
    audit: Option<Arc<dyn AuditSink>>,
    liveness: Option<Arc<dyn LivenessMonitor>>,
    propagator: Option<Arc<dyn Propagator>>,
    storage: Option<Arc<dyn SessionStorage>>,
}

impl InMemoryVariableServiceBuilder {
    /// Store configuration
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Type registry shared by every session
    pub fn registry(mut self, registry: Arc<TypeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Audit sink
    pub fn audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Liveness monitor for subscribers and lock holders
    pub fn liveness(mut self, liveness: Arc<dyn LivenessMonitor>) -> Self {
        self.liveness = Some(liveness);
        self
    }

    /// Propagator for dependent recomputation
    pub fn propagator(mut self, propagator: Arc<dyn Propagator>) -> Self {
        self.propagator = Some(propagator);
        self
    }

    /// Storage behind `persist_session` and `restore_session`
    pub fn storage(mut self, storage: Arc<dyn SessionStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Validate the configuration and build the service
    pub fn build(self) -> VarResult<InMemoryVariableService> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        Ok(InMemoryVariableService {
            sessions: DashMap::new(),
            config,
            deps: StoreDeps {
                registry: self.registry.unwrap_or_else(|| Arc::new(TypeRegistry::with_builtins())),
                audit: self.audit.unwrap_or_else(|| Arc::new(NoopAuditSink)),
                liveness: self.liveness.unwrap_or_else(|| Arc::new(LocalLivenessMonitor::new())),
                propagator: self.propagator.unwrap_or_else(|| Arc::new(NoopPropagator)),
            },
            storage: self.storage.unwrap_or_else(|| Arc::new(InMemorySessionStorage::new())),
        })
    }
}

/// Variable service holding every session in process memory
pub struct InMemoryVariableService {
    sessions: DashMap<SessionId, Arc<VariableStore>>,
    config: StoreConfig,
    deps: StoreDeps,
    storage: Arc<dyn SessionStorage>,
}

impl InMemoryVariableService {
    /// Start building a service
    pub fn builder() -> InMemoryVariableServiceBuilder {
        InMemoryVariableServiceBuilder::default()
    }

    /// Service with default collaborators
    pub fn new(config: StoreConfig) -> VarResult<Self> {
        Self::builder().config(config).build()
    }

    /// Type registry shared by every session
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.deps.registry
    }

    /// Store of a live session
    pub fn store(&self, session_id: &SessionId) -> VarResult<Arc<VariableStore>> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| VarError::SessionNotFound(session_id.0.clone()))
    }

    fn store_or_create(&self, session_id: &SessionId) -> Arc<VariableStore> {
        self.sessions
            .entry(session_id.clone())
            .or_insert_with(|| VariableStore::new(session_id.clone(), self.config.clone(), self.deps.clone()))
            .value()
            .clone()
    }
}

#[async_trait]
impl VariableService for InMemoryVariableService {
    async fn create_session(&self, session_id: &SessionId) -> VarResult<bool> {
        if self.sessions.contains_key(session_id) {
            return Ok(false);
        }
        self.store_or_create(session_id);
        Ok(true)
    }

    async fn destroy_session(&self, session_id: &SessionId) -> VarResult<()> {
        let (_, store) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| VarError::SessionNotFound(session_id.0.clone()))?;
        store.close();
        info!("Destroyed session {}", session_id);
        Ok(())
    }

    async fn list_sessions(&self) -> VarResult<Vec<SessionId>> {
        let mut sessions: Vec<SessionId> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        sessions.sort();
        Ok(sessions)
    }

    async fn register_variable(
        &self,
        session_id: &SessionId,
        caller: &Caller,
        name: &str,
        type_tag: TypeTag,
        initial_value: Json,
        options: RegisterOptions,
    ) -> VarResult<VariableId> {
        // The owning context brings its session into existence on first use
        let store = match caller.kind {
            CallerKind::Owner => self.store_or_create(session_id),
            CallerKind::Consumer => self.store(session_id)?,
        };
        store.register(caller, name, type_tag, initial_value, options).await
    }

    async fn get_variable(&self, session_id: &SessionId, caller: &Caller, identifier: &str) -> VarResult<VariableValue> {
        self.store(session_id)?.get(caller, identifier)
    }

    async fn get_variable_info(&self, session_id: &SessionId, caller: &Caller, identifier: &str) -> VarResult<Variable> {
        self.store(session_id)?.get_info(caller, identifier)
    }

    async fn get_variables(
        &self,
        session_id: &SessionId,
        caller: &Caller,
        identifiers: &[String],
    ) -> VarResult<BTreeMap<String, VariableValue>> {
        self.store(session_id)?.get_batch(caller, identifiers)
    }

    async fn set_variable(
        &self,
        session_id: &SessionId,
        caller: &Caller,
        identifier: &str,
        value: Json,
        metadata: HashMap<String, String>,
    ) -> VarResult<u64> {
        let store = self.store(session_id)?;
        store.set(caller, identifier, value, metadata).await
    }

    async fn set_variables(
        &self,
        session_id: &SessionId,
        caller: &Caller,
        updates: BTreeMap<String, Json>,
        metadata: HashMap<String, String>,
        atomic: bool,
    ) -> VarResult<BatchResults> {
        let store = self.store(session_id)?;
        store.set_batch(caller, updates, metadata, atomic).await
    }

    async fn list_variables(&self, session_id: &SessionId, caller: &Caller, filter: ListFilter) -> VarResult<Vec<Variable>> {
        self.store(session_id)?.list(caller, &filter)
    }

    async fn delete_variable(&self, session_id: &SessionId, caller: &Caller, identifier: &str) -> VarResult<()> {
        let store = self.store(session_id)?;
        store.delete(caller, identifier).await
    }

    async fn add_dependency(
        &self,
        session_id: &SessionId,
        caller: &Caller,
        from: &str,
        to: &str,
        kind: DependencyKind,
    ) -> VarResult<()> {
        let store = self.store(session_id)?;
        store.add_dependency(caller, from, to, kind).await
    }

    async fn remove_dependency(&self, session_id: &SessionId, caller: &Caller, from: &str, to: &str) -> VarResult<bool> {
        let store = self.store(session_id)?;
        store.remove_dependency(caller, from, to).await
    }

    async fn get_update_order(&self, session_id: &SessionId, identifier: &str) -> VarResult<Vec<VariableId>> {
        let store = self.store(session_id)?;
        store.update_order(identifier).await
    }

    async fn get_history(
        &self,
        session_id: &SessionId,
        caller: &Caller,
        identifier: &str,
        limit: Option<usize>,
    ) -> VarResult<Vec<HistoryEntry>> {
        let store = self.store(session_id)?;
        store.history(caller, identifier, limit).await
    }

    async fn add_observer(
        &self,
        session_id: &SessionId,
        caller: &Caller,
        identifiers: &[String],
        callback: Arc<dyn ObserverCallback>,
        options: ObserverOptions,
    ) -> VarResult<SubscriptionId> {
        let store = self.store(session_id)?;
        store.add_observer(caller, identifiers, callback, options).await
    }

    async fn watch_variables(
        &self,
        session_id: &SessionId,
        caller: &Caller,
        identifiers: &[String],
        options: WatchOptions,
    ) -> VarResult<VariableWatch> {
        let store = self.store(session_id)?;
        store.watch(caller, identifiers, options).await
    }

    async fn unwatch(&self, session_id: &SessionId, subscription: &SubscriptionId) -> VarResult<bool> {
        Ok(self.store(session_id)?.unwatch(subscription))
    }

    async fn acquire_lock(
        &self,
        session_id: &SessionId,
        caller: &Caller,
        identifier: &str,
        policy: LockPolicy,
        timeout: Option<Duration>,
    ) -> VarResult<OptimizationLock> {
        let store = self.store(session_id)?;
        store.acquire_lock(caller, identifier, policy, timeout).await
    }

    async fn release_lock(&self, session_id: &SessionId, caller: &Caller, identifier: &str) -> VarResult<()> {
        self.store(session_id)?.release_lock(caller, identifier)
    }

    async fn report_progress(
        &self,
        session_id: &SessionId,
        caller: &Caller,
        identifier: &str,
        report: ProgressReport,
    ) -> VarResult<bool> {
        self.store(session_id)?.report_progress(caller, identifier, report)
    }

    async fn get_lock(&self, session_id: &SessionId, identifier: &str) -> VarResult<Option<OptimizationLock>> {
        self.store(session_id)?.get_lock(identifier)
    }

    async fn set_access_rules(
        &self,
        session_id: &SessionId,
        caller: &Caller,
        identifier: &str,
        rules: Vec<AccessRule>,
    ) -> VarResult<()> {
        let store = self.store(session_id)?;
        store.set_access_rules(caller, identifier, rules).await
    }

    async fn check_access(
        &self,
        session_id: &SessionId,
        caller: &Caller,
        identifier: &str,
        permission: Permission,
    ) -> VarResult<bool> {
        self.store(session_id)?.check_access(caller, identifier, permission)
    }

    async fn export_state(&self, session_id: &SessionId) -> VarResult<SessionSnapshot> {
        let store = self.store(session_id)?;
        store.export().await
    }

    async fn import_state(&self, snapshot: SessionSnapshot) -> VarResult<()> {
        if let Ok(store) = self.store(&snapshot.session_id) {
            return store.import(snapshot).await;
        }

        // A migrated session only becomes visible once its snapshot imported cleanly
        let session_id = snapshot.session_id.clone();
        let fresh = VariableStore::new(session_id.clone(), self.config.clone(), self.deps.clone());
        if let Err(e) = fresh.import(snapshot.clone()).await {
            fresh.close();
            return Err(e);
        }

        match self.sessions.entry(session_id) {
            Entry::Vacant(entry) => {
                info!("Created session {} from an imported snapshot", entry.key());
                entry.insert(fresh);
                Ok(())
            }
            Entry::Occupied(entry) => {
                fresh.close();
                let existing = entry.get().clone();
                drop(entry);
                existing.import(snapshot).await
            }
        }
    }

    async fn persist_session(&self, session_id: &SessionId) -> VarResult<()> {
        let snapshot = self.export_state(session_id).await?;
        debug!("Persisting session {} ({} variables)", session_id, snapshot.variables.len());
        self.storage.save(snapshot).await
    }

    async fn restore_session(&self, session_id: &SessionId) -> VarResult<()> {
        let snapshot = self
            .storage
            .load(session_id)
            .await?
            .ok_or_else(|| VarError::SessionNotFound(session_id.0.clone()))?;
        info!("Restoring session {} from storage", session_id);
        self.import_state(snapshot).await
    }

    async fn health_check(&self) -> VarResult<bool> {
        self.storage.list().await?;
        Ok(true)
    }
}

impl std::fmt::Debug for InMemoryVariableService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryVariableService")
            .field("sessions", &self.sessions.len())
            .field("config", &self.config)
            .finish()
    }
}
