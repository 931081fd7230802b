//! Per-session variable store
//!
//! All mutations of a session go through one async mutex (the single
//! writer). After every commit the writer publishes an immutable
//! [`SessionView`] through an `ArcSwap`, so reads never wait for the writer
//! and never observe a half-applied update. Observers are notified while the
//! writer lock is still held, which keeps per-variable delivery in version
//! order; delivery itself is queued and never awaited here.

use arc_swap::ArcSwap;
use chrono::Utc;
use parking_lot::Mutex as SyncMutex;
use serde_json::Value as Json;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use varbridge_core::{
    AccessControl, AccessRule, AuditEvent, AuditSink, BatchResults, Caller, DependencyGraph, DependencyKind,
    HistoryEntry, ListFilter, LivenessMonitor, LockEvent, LockPolicy, ObserverCallback, ObserverOptions,
    OptimizationLock, Permission, ProgressReport, PropagationRequest, Propagator, RegisterOptions, SessionId,
    SessionSnapshot, StoreConfig, SubscriptionId, TypeRegistry, TypeTag, UpdateKind, VarError, VarResult, Variable,
    VariableId, VariableUpdate, VariableValue, VariableWatch, WatchOptions,
};

use crate::coordinator::OptimizerCoordinator;
use crate::observer::ObserverManager;
use crate::watch::WatchSink;

/// Immutable read view of a session's variables
#[derive(Debug, Clone, Default)]
pub struct SessionView {
    by_id: HashMap<VariableId, Arc<Variable>>,
    by_name: HashMap<String, VariableId>,
}

impl SessionView {
    /// Resolve a name or id
    pub fn resolve(&self, identifier: &str) -> Option<&Arc<Variable>> {
        let by_id = VariableId(identifier.to_string());
        self.by_id
            .get(&by_id)
            .or_else(|| self.by_name.get(identifier).and_then(|id| self.by_id.get(id)))
    }

    /// Number of variables
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether the session has no variables
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Variables in name order
    pub fn variables(&self) -> Vec<Arc<Variable>> {
        let mut variables: Vec<Arc<Variable>> = self.by_id.values().cloned().collect();
        variables.sort_by(|a, b| a.name.cmp(&b.name));
        variables
    }

    fn insert(&mut self, variable: Variable) {
        self.by_name.insert(variable.name.clone(), variable.id.clone());
        self.by_id.insert(variable.id.clone(), Arc::new(variable));
    }

    fn remove(&mut self, id: &VariableId) -> Option<Arc<Variable>> {
        let removed = self.by_id.remove(id)?;
        self.by_name.remove(&removed.name);
        Some(removed)
    }
}

/// Writer-owned state
#[derive(Default)]
struct SessionState {
    view: SessionView,
    graph: DependencyGraph,
    history: HashMap<VariableId, VecDeque<HistoryEntry>>,
}

/// A validated write waiting to be committed
struct PreparedWrite {
    current: Arc<Variable>,
    value: VariableValue,
}

/// Collaborators shared by every session
#[derive(Clone)]
pub struct StoreDeps {
    /// Type implementations
    pub registry: Arc<TypeRegistry>,
    /// Audit sink
    pub audit: Arc<dyn AuditSink>,
    /// Liveness of subscribers and lock holders
    pub liveness: Arc<dyn LivenessMonitor>,
    /// Dependent recomputation
    pub propagator: Arc<dyn Propagator>,
}

/// Variable table, dependency graph, observers and locks of one session
pub struct VariableStore {
    session_id: SessionId,
    config: StoreConfig,
    registry: Arc<TypeRegistry>,
    access: AccessControl,
    audit: Arc<dyn AuditSink>,
    propagator: Arc<dyn Propagator>,
    observers: Arc<ObserverManager>,
    coordinator: Arc<OptimizerCoordinator>,
    state: Mutex<SessionState>,
    snapshot: ArcSwap<SessionView>,
    background: SyncMutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl VariableStore {
    /// Create an empty session store and start its background tasks
    pub fn new(session_id: SessionId, config: StoreConfig, deps: StoreDeps) -> Arc<Self> {
        info!("Creating variable store for session {}", session_id);
        let observers = ObserverManager::new(session_id.clone(), deps.liveness.clone(), config.observer_buffer);
        let coordinator =
            OptimizerCoordinator::new(session_id.clone(), &config, deps.liveness.clone(), deps.audit.clone());
        let background = coordinator.start_background_tasks(config.lock_sweep_interval());

        Arc::new(Self {
            access: AccessControl::new(deps.audit.clone(), config.default_access),
            session_id,
            registry: deps.registry,
            audit: deps.audit,
            propagator: deps.propagator,
            observers,
            coordinator,
            state: Mutex::new(SessionState::default()),
            snapshot: ArcSwap::from_pointee(SessionView::default()),
            background: SyncMutex::new(background),
            closed: AtomicBool::new(false),
            config,
        })
    }

    /// Session id
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Current read view
    pub fn view(&self) -> Arc<SessionView> {
        self.snapshot.load_full()
    }

    /// Lock events of this session
    pub fn lock_events(&self) -> broadcast::Receiver<LockEvent> {
        self.coordinator.subscribe()
    }

    /// Number of registered observers
    pub fn observer_count(&self) -> usize {
        self.observers.observer_count()
    }

    fn ensure_open(&self) -> VarResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(VarError::SessionNotFound(self.session_id.0.clone()));
        }
        Ok(())
    }

    fn publish(&self, state: &SessionState) {
        self.snapshot.store(Arc::new(state.view.clone()));
    }

    fn resolve_in(view: &SessionView, identifier: &str) -> VarResult<Arc<Variable>> {
        view.resolve(identifier)
            .cloned()
            .ok_or_else(|| VarError::NotFound(identifier.to_string()))
    }

    fn resolve_readable(&self, caller: &Caller, identifier: &str, permission: Permission) -> VarResult<Arc<Variable>> {
        self.ensure_open()?;
        let view = self.snapshot.load();
        let variable = Self::resolve_in(&view, identifier)?;
        self.access.check(&self.session_id, &variable, caller, permission)?;
        Ok(variable)
    }

    /// Register a new variable at version 0
    pub async fn register(
        &self,
        caller: &Caller,
        name: &str,
        type_tag: TypeTag,
        initial_value: Json,
        options: RegisterOptions,
    ) -> VarResult<VariableId> {
        self.ensure_open()?;
        if name.trim().is_empty() {
            return Err(VarError::ValidationFailed("variable name must not be empty".to_string()));
        }
        for rule in &options.access_rules {
            rule.validate()?;
        }
        let constraints = self.registry.effective_constraints(&type_tag, &options.constraints)?;
        let value = self.registry.validate(&type_tag, &initial_value, &constraints)?;

        let mut state = self.state.lock().await;
        if state.view.by_name.contains_key(name) {
            return Err(VarError::DuplicateName(name.to_string()));
        }

        let now = Utc::now();
        let variable = Variable {
            id: VariableId::generate(),
            name: name.to_string(),
            type_tag,
            value,
            constraints,
            metadata: options.metadata,
            description: options.description,
            read_only: options.read_only,
            version: 0,
            owner: caller.id.clone(),
            created_by: caller.kind,
            access_rules: options.access_rules,
            created_at: now,
            updated_at: now,
        };
        let id = variable.id.clone();

        self.push_history(&mut state, &variable, HashMap::new(), caller);
        state.view.insert(variable);
        self.publish(&state);
        drop(state);

        info!("Registered variable {} ({}) in session {}", name, id, self.session_id);
        self.audit.record(AuditEvent::VariableRegistered {
            session_id: self.session_id.clone(),
            var_id: id.clone(),
            name: name.to_string(),
            caller: caller.id.clone(),
        });
        Ok(id)
    }

    /// Current value
    pub fn get(&self, caller: &Caller, identifier: &str) -> VarResult<VariableValue> {
        let variable = self.resolve_readable(caller, identifier, Permission::Read)?;
        debug!("Read {} v{} in session {}", variable.name, variable.version, self.session_id);
        Ok(variable.value.clone())
    }

    /// Full record
    pub fn get_info(&self, caller: &Caller, identifier: &str) -> VarResult<Variable> {
        let variable = self.resolve_readable(caller, identifier, Permission::Read)?;
        Ok(variable.as_ref().clone())
    }

    /// Values of several variables from one consistent view
    pub fn get_batch(&self, caller: &Caller, identifiers: &[String]) -> VarResult<BTreeMap<String, VariableValue>> {
        self.ensure_open()?;
        let view = self.snapshot.load();
        let mut values = BTreeMap::new();
        for identifier in identifiers {
            let Some(variable) = view.resolve(identifier) else { continue };
            if self
                .access
                .check(&self.session_id, variable, caller, Permission::Read)
                .is_ok()
            {
                values.insert(identifier.clone(), variable.value.clone());
            }
        }
        Ok(values)
    }

    /// Readable variables passing the filter, in name order
    pub fn list(&self, caller: &Caller, filter: &ListFilter) -> VarResult<Vec<Variable>> {
        self.ensure_open()?;
        let view = self.snapshot.load();
        Ok(view
            .variables()
            .into_iter()
            .filter(|variable| filter.matches(variable))
            .filter(|variable| {
                self.access
                    .check(&self.session_id, variable, caller, Permission::Read)
                    .is_ok()
            })
            .map(|variable| variable.as_ref().clone())
            .collect())
    }

    fn prepare_write(&self, state: &SessionState, caller: &Caller, identifier: &str, raw: &Json) -> VarResult<PreparedWrite> {
        let current = Self::resolve_in(&state.view, identifier)?;
        self.access.check(&self.session_id, &current, caller, Permission::Write)?;
        if current.read_only {
            return Err(VarError::ReadOnly(current.name.clone()));
        }
        self.coordinator.check_write(&current.id, &caller.id)?;
        let value = self.registry.validate(&current.type_tag, raw, &current.constraints)?;
        Ok(PreparedWrite { current, value })
    }

    fn push_history(
        &self,
        state: &mut SessionState,
        variable: &Variable,
        metadata: HashMap<String, String>,
        caller: &Caller,
    ) {
        let history = state.history.entry(variable.id.clone()).or_default();
        history.push_back(HistoryEntry {
            version: variable.version,
            value: variable.value.clone(),
            metadata,
            source: caller.kind,
            changed_by: caller.id.clone(),
            timestamp: variable.updated_at,
        });
        while history.len() > self.config.history_limit {
            history.pop_front();
        }
    }

    /// Apply a prepared write to the working state; returns the update event
    fn commit(
        &self,
        state: &mut SessionState,
        prepared: PreparedWrite,
        metadata: &HashMap<String, String>,
        caller: &Caller,
    ) -> VariableUpdate {
        let next = prepared.current.next_version(prepared.value);
        self.push_history(state, &next, metadata.clone(), caller);

        let update = VariableUpdate {
            session_id: self.session_id.clone(),
            var_id: next.id.clone(),
            name: next.name.clone(),
            kind: UpdateKind::Updated,
            old_value: Some(prepared.current.value.clone()),
            new_value: Some(next.value.clone()),
            version: next.version,
            metadata: metadata.clone(),
            timestamp: next.updated_at,
            source: caller.kind,
            changed_by: caller.id.clone(),
        };
        state.view.insert(next);
        update
    }

    /// Side effects of committed updates, run after the view is published
    fn after_commit(&self, state: &SessionState, updates: &[VariableUpdate], caller: &Caller) {
        for update in updates {
            let outcome = self.observers.notify(update);
            debug!(
                "Committed {} v{} in session {} ({} observer(s) notified)",
                update.name, update.version, self.session_id, outcome.enqueued
            );
            self.audit.record(AuditEvent::VariableUpdated {
                session_id: self.session_id.clone(),
                var_id: update.var_id.clone(),
                name: update.name.clone(),
                version: update.version,
                caller: caller.id.clone(),
            });

            if state.graph.has_dependents(&update.var_id) {
                if let Some(value) = &update.new_value {
                    self.spawn_propagation(PropagationRequest {
                        session_id: self.session_id.clone(),
                        changed: update.var_id.clone(),
                        value: value.clone(),
                        version: update.version,
                        order: state.graph.get_update_order(&update.var_id),
                    });
                }
            }
        }
    }

    fn spawn_propagation(&self, request: PropagationRequest) {
        let propagator = self.propagator.clone();
        tokio::spawn(async move {
            let changed = request.changed.clone();
            if let Err(e) = propagator.propagate(request).await {
                warn!("Propagation from {} failed: {}", changed, e);
            }
        });
    }

    /// Validate and commit a new value; returns the new version
    pub async fn set(
        &self,
        caller: &Caller,
        identifier: &str,
        raw: Json,
        metadata: HashMap<String, String>,
    ) -> VarResult<u64> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        let prepared = self.prepare_write(&state, caller, identifier, &raw)?;
        let update = self.commit(&mut state, prepared, &metadata, caller);
        self.publish(&state);

        let version = update.version;
        self.after_commit(&state, std::slice::from_ref(&update), caller);
        Ok(version)
    }

    /// Commit a batch; see `VariableService::set_variables`
    pub async fn set_batch(
        &self,
        caller: &Caller,
        updates: BTreeMap<String, Json>,
        metadata: HashMap<String, String>,
        atomic: bool,
    ) -> VarResult<BatchResults> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        let mut results = BatchResults::new();
        let mut committed = Vec::new();

        if atomic {
            let mut prepared = Vec::with_capacity(updates.len());
            let mut failures = BTreeMap::new();
            let mut targets = HashSet::new();
            for (identifier, raw) in &updates {
                match self.prepare_write(&state, caller, identifier, raw) {
                    Ok(write) if !targets.insert(write.current.id.clone()) => {
                        failures.insert(
                            identifier.clone(),
                            VarError::ValidationFailed(format!("{} appears more than once in the batch", write.current.name)),
                        );
                    }
                    Ok(write) => prepared.push((identifier.clone(), write)),
                    Err(e) => {
                        failures.insert(identifier.clone(), e);
                    }
                }
            }
            if !failures.is_empty() {
                debug!("Atomic batch rejected in session {}: {} failure(s)", self.session_id, failures.len());
                return Err(VarError::PartialFailure(failures));
            }
            for (identifier, write) in prepared {
                let update = self.commit(&mut state, write, &metadata, caller);
                results.insert(identifier, Ok(update.version));
                committed.push(update);
            }
        } else {
            for (identifier, raw) in &updates {
                // Re-prepare against the working state so repeated targets see earlier entries
                match self.prepare_write(&state, caller, identifier, raw) {
                    Ok(write) => {
                        let update = self.commit(&mut state, write, &metadata, caller);
                        results.insert(identifier.clone(), Ok(update.version));
                        committed.push(update);
                    }
                    Err(e) => {
                        results.insert(identifier.clone(), Err(e));
                    }
                }
            }
        }

        if !committed.is_empty() {
            self.publish(&state);
            self.after_commit(&state, &committed, caller);
        }
        Ok(results)
    }

    /// Delete a variable that has no dependents
    pub async fn delete(&self, caller: &Caller, identifier: &str) -> VarResult<()> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        let variable = Self::resolve_in(&state.view, identifier)?;
        self.access.check(&self.session_id, &variable, caller, Permission::Write)?;

        if state.graph.has_dependents(&variable.id) {
            let dependents = state
                .graph
                .dependents(&variable.id)
                .iter()
                .map(|id| state.view.by_id.get(id).map_or_else(|| id.0.clone(), |v| v.name.clone()))
                .collect();
            return Err(VarError::HasDependents {
                variable: variable.name.clone(),
                dependents,
            });
        }
        self.coordinator.check_write(&variable.id, &caller.id)?;

        self.observers.notify(&VariableUpdate {
            session_id: self.session_id.clone(),
            var_id: variable.id.clone(),
            name: variable.name.clone(),
            kind: UpdateKind::Deleted,
            old_value: Some(variable.value.clone()),
            new_value: None,
            version: variable.version,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
            source: caller.kind,
            changed_by: caller.id.clone(),
        });

        state.view.remove(&variable.id);
        state.history.remove(&variable.id);
        state.graph.remove_variable(&variable.id);
        self.publish(&state);
        drop(state);

        self.observers.remove_variable(&variable.id);
        self.coordinator.forget(&variable.id);

        info!("Deleted variable {} from session {}", variable.name, self.session_id);
        self.audit.record(AuditEvent::VariableDeleted {
            session_id: self.session_id.clone(),
            var_id: variable.id.clone(),
            name: variable.name.clone(),
            caller: caller.id.clone(),
        });
        Ok(())
    }

    /// Add `from -> to`; the cycle check and the insert happen under the writer lock
    pub async fn add_dependency(&self, caller: &Caller, from: &str, to: &str, kind: DependencyKind) -> VarResult<()> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        let source = Self::resolve_in(&state.view, from)?;
        let target = Self::resolve_in(&state.view, to)?;
        self.access.check(&self.session_id, &target, caller, Permission::Write)?;

        state
            .graph
            .add_dependency(&source.id, &target.id, kind)
            .map_err(|e| match e {
                VarError::WouldCreateCycle { .. } => VarError::WouldCreateCycle {
                    from: source.name.clone(),
                    to: target.name.clone(),
                },
                other => other,
            })?;
        debug!(
            "Added {:?} dependency {} -> {} in session {}",
            kind, source.name, target.name, self.session_id
        );
        Ok(())
    }

    /// Remove `from -> to`
    pub async fn remove_dependency(&self, caller: &Caller, from: &str, to: &str) -> VarResult<bool> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        let source = Self::resolve_in(&state.view, from)?;
        let target = Self::resolve_in(&state.view, to)?;
        self.access.check(&self.session_id, &target, caller, Permission::Write)?;
        Ok(state.graph.remove_dependency(&source.id, &target.id))
    }

    /// Propagation order for a change to `identifier`
    pub async fn update_order(&self, identifier: &str) -> VarResult<Vec<VariableId>> {
        self.ensure_open()?;
        let state = self.state.lock().await;
        let variable = Self::resolve_in(&state.view, identifier)?;
        Ok(state.graph.get_update_order(&variable.id))
    }

    /// Most recent history entries, oldest first
    pub async fn history(&self, caller: &Caller, identifier: &str, limit: Option<usize>) -> VarResult<Vec<HistoryEntry>> {
        let variable = self.resolve_readable(caller, identifier, Permission::Read)?;
        let state = self.state.lock().await;
        let entries = state.history.get(&variable.id).map(|h| h.len()).unwrap_or(0);
        let skip = limit.map_or(0, |limit| entries.saturating_sub(limit));
        Ok(state
            .history
            .get(&variable.id)
            .map(|history| history.iter().skip(skip).cloned().collect())
            .unwrap_or_default())
    }

    fn resolve_observed(&self, view: &SessionView, caller: &Caller, identifiers: &[String]) -> VarResult<Vec<Arc<Variable>>> {
        if identifiers.is_empty() {
            return Err(VarError::ValidationFailed("no variables to observe".to_string()));
        }
        identifiers
            .iter()
            .map(|identifier| {
                let variable = Self::resolve_in(view, identifier)?;
                self.access.check(&self.session_id, &variable, caller, Permission::Observe)?;
                Ok(variable)
            })
            .collect()
    }

    /// Subscribe a callback
    pub async fn add_observer(
        &self,
        caller: &Caller,
        identifiers: &[String],
        callback: Arc<dyn ObserverCallback>,
        options: ObserverOptions,
    ) -> VarResult<SubscriptionId> {
        self.ensure_open()?;
        let state = self.state.lock().await;
        let variables = self.resolve_observed(&state.view, caller, identifiers)?;
        let var_ids = variables.iter().map(|v| v.id.clone()).collect();
        Ok(self.observers.add_observer(var_ids, caller.handle.clone(), callback, options))
    }

    /// Open a watch stream; initial values, if requested, precede every later update
    pub async fn watch(self: &Arc<Self>, caller: &Caller, identifiers: &[String], options: WatchOptions) -> VarResult<VariableWatch> {
        self.ensure_open()?;
        let state = self.state.lock().await;
        let variables = self.resolve_observed(&state.view, caller, identifiers)?;
        let var_ids = variables.iter().map(|v| v.id.clone()).collect();

        let (sink, rx) = WatchSink::channel(self.config.watch_buffer);
        let id = self
            .observers
            .add_observer(var_ids, caller.handle.clone(), Arc::new(sink), options.observer);

        if options.include_initial {
            for variable in &variables {
                self.observers
                    .deliver_to(&id, VariableUpdate::initial(self.session_id.clone(), variable));
            }
        }
        drop(state);

        debug!("Opened watch {} on {} variable(s) in session {}", id, variables.len(), self.session_id);
        let observers = Arc::downgrade(&self.observers);
        Ok(VariableWatch::new(id, rx, move |id| {
            if let Some(observers) = observers.upgrade() {
                observers.remove_observer(id);
            }
        }))
    }

    /// Remove an observer or watch
    pub fn unwatch(&self, id: &SubscriptionId) -> bool {
        self.observers.remove_observer(id)
    }

    /// Take the optimization lock for the caller
    pub async fn acquire_lock(
        &self,
        caller: &Caller,
        identifier: &str,
        policy: LockPolicy,
        timeout: Option<Duration>,
    ) -> VarResult<OptimizationLock> {
        let variable = self.resolve_readable(caller, identifier, Permission::Optimize)?;
        let lock = self
            .coordinator
            .acquire(&variable.id, &caller.id, &caller.handle, policy, timeout)
            .await?;

        // A delete or close committed before the grant has already cleaned up the lock table
        let state = self.state.lock().await;
        let outcome = if self.closed.load(Ordering::Acquire) {
            Err(VarError::SessionNotFound(self.session_id.0.clone()))
        } else if !state.view.by_id.contains_key(&variable.id) {
            Err(VarError::NotFound(identifier.to_string()))
        } else {
            Ok(lock)
        };
        drop(state);

        if outcome.is_err() {
            debug!("Dropping lock on vanished {} in session {}", variable.name, self.session_id);
            self.coordinator.forget(&variable.id);
        }
        outcome
    }

    /// Release the caller's lock
    pub fn release_lock(&self, caller: &Caller, identifier: &str) -> VarResult<()> {
        self.ensure_open()?;
        let variable = Self::resolve_in(&self.snapshot.load(), identifier)?;
        self.coordinator.release(&variable.id, &caller.id)
    }

    /// Record optimization progress under the caller's lock
    pub fn report_progress(&self, caller: &Caller, identifier: &str, report: ProgressReport) -> VarResult<bool> {
        let variable = self.resolve_readable(caller, identifier, Permission::Optimize)?;
        self.coordinator.report_progress(&variable.id, &caller.id, report)
    }

    /// Current lock on a variable
    pub fn get_lock(&self, identifier: &str) -> VarResult<Option<OptimizationLock>> {
        self.ensure_open()?;
        let variable = Self::resolve_in(&self.snapshot.load(), identifier)?;
        Ok(self.coordinator.get_lock(&variable.id))
    }

    /// Replace the access rules; only the owner may do so
    pub async fn set_access_rules(&self, caller: &Caller, identifier: &str, rules: Vec<AccessRule>) -> VarResult<()> {
        self.ensure_open()?;
        for rule in &rules {
            rule.validate()?;
        }
        let mut state = self.state.lock().await;
        let variable = Self::resolve_in(&state.view, identifier)?;
        if variable.owner != caller.id {
            return Err(VarError::AccessDenied {
                caller: caller.id.clone(),
                permission: "owner".to_string(),
                variable: variable.name.clone(),
            });
        }

        let mut updated = variable.as_ref().clone();
        updated.access_rules = rules;
        updated.updated_at = Utc::now();
        state.view.insert(updated);
        self.publish(&state);
        info!("Replaced access rules of {} in session {}", variable.name, self.session_id);
        Ok(())
    }

    /// Whether the caller holds a permission
    pub fn check_access(&self, caller: &Caller, identifier: &str, permission: Permission) -> VarResult<bool> {
        self.ensure_open()?;
        let variable = Self::resolve_in(&self.snapshot.load(), identifier)?;
        Ok(self
            .access
            .check(&self.session_id, &variable, caller, permission)
            .is_ok())
    }

    /// Full session contents
    pub async fn export(&self) -> VarResult<SessionSnapshot> {
        self.ensure_open()?;
        let state = self.state.lock().await;
        Ok(SessionSnapshot {
            session_id: self.session_id.clone(),
            variables: state
                .view
                .variables()
                .into_iter()
                .map(|variable| variable.as_ref().clone())
                .collect(),
            dependencies: state.graph.edges(),
            exported_at: Utc::now(),
        })
    }

    /// Replace the session contents with a snapshot.
    ///
    /// Every value is re-validated and the edges re-checked for cycles before
    /// anything is replaced.
    pub async fn import(&self, snapshot: SessionSnapshot) -> VarResult<()> {
        self.ensure_open()?;
        let mut view = SessionView::default();
        let mut history = HashMap::new();

        for mut variable in snapshot.variables {
            if view.by_name.contains_key(&variable.name) || view.by_id.contains_key(&variable.id) {
                return Err(VarError::DuplicateName(variable.name));
            }
            for rule in &variable.access_rules {
                rule.validate()?;
            }
            variable.value = self
                .registry
                .revalidate(&variable.type_tag, &variable.value, &variable.constraints)
                .map_err(|e| VarError::ValidationFailed(format!("{}: {}", variable.name, e)))?;

            history.insert(
                variable.id.clone(),
                VecDeque::from([HistoryEntry {
                    version: variable.version,
                    value: variable.value.clone(),
                    metadata: HashMap::new(),
                    source: variable.created_by,
                    changed_by: variable.owner.clone(),
                    timestamp: variable.updated_at,
                }]),
            );
            view.insert(variable);
        }

        for edge in &snapshot.dependencies {
            for id in [&edge.from, &edge.to] {
                if !view.by_id.contains_key(id) {
                    return Err(VarError::NotFound(id.0.clone()));
                }
            }
        }
        let graph = DependencyGraph::from_edges(&snapshot.dependencies)?;

        let mut state = self.state.lock().await;
        let dropped: Vec<VariableId> = state
            .view
            .by_id
            .keys()
            .filter(|id| !view.by_id.contains_key(*id))
            .cloned()
            .collect();
        *state = SessionState { view, graph, history };
        self.publish(&state);
        let count = state.view.len();
        drop(state);

        for id in &dropped {
            self.observers.remove_variable(id);
            self.coordinator.forget(id);
        }
        info!("Imported {} variable(s) into session {}", count, self.session_id);
        Ok(())
    }

    /// Stop background tasks, end all watches and fail pending lock waiters
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for task in self.background.lock().drain(..) {
            task.abort();
        }
        self.coordinator.shutdown();
        self.observers.shutdown();
        info!("Closed variable store for session {}", self.session_id);
    }
}

impl Drop for VariableStore {
    fn drop(&mut self) {
        for task in self.background.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for VariableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VariableStore")
            .field("session_id", &self.session_id)
            .field("variables", &self.snapshot.load().len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
