//! Transport-agnostic operation surface of the variable store
//!
//! Every operation is scoped to a session and issued by a [`Caller`]. The
//! in-memory engine implements this trait; remote transports wrap it.

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::domain::access::{AccessRule, Permission};
use crate::domain::collaborators::{ObserverCallback, UpdateFilter};
use crate::domain::dependency::DependencyKind;
use crate::domain::events::VariableUpdate;
use crate::domain::optimization::{LockPolicy, OptimizationLock, ProgressReport};
use crate::domain::snapshot::SessionSnapshot;
use crate::domain::types::TypeTag;
use crate::domain::value::{Constraints, VariableValue};
use crate::domain::variable::{Caller, CallerKind, HistoryEntry, SessionId, Variable, VariableId};
use crate::error::VarResult;

/// Optional settings for `register_variable`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisterOptions {
    /// Explicit constraints, overlaid on the type defaults
    #[serde(default)]
    pub constraints: Constraints,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Human-readable description
    #[serde(default)]
    pub description: Option<String>,
    /// Reject every later `set`
    #[serde(default)]
    pub read_only: bool,
    /// Initial access rules
    #[serde(default)]
    pub access_rules: Vec<AccessRule>,
}

impl RegisterOptions {
    /// Set the constraints
    pub fn constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// Add one metadata entry
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set the description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Mark read-only
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Append an access rule
    pub fn rule(mut self, rule: AccessRule) -> Self {
        self.access_rules.push(rule);
        self
    }
}

/// Filter for `list_variables`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListFilter {
    /// Only variables of this type
    #[serde(default)]
    pub type_tag: Option<TypeTag>,
    /// Only variables registered from this side of the bridge
    #[serde(default)]
    pub created_by: Option<CallerKind>,
    /// Only names starting with this prefix
    #[serde(default)]
    pub name_prefix: Option<String>,
}

impl ListFilter {
    /// Whether a variable passes the filter
    pub fn matches(&self, variable: &Variable) -> bool {
        self.type_tag.as_ref().map_or(true, |tag| &variable.type_tag == tag)
            && self.created_by.map_or(true, |kind| variable.created_by == kind)
            && self
                .name_prefix
                .as_deref()
                .map_or(true, |prefix| variable.name.starts_with(prefix))
    }
}

/// Per-observer delivery options
#[derive(Clone, Default)]
pub struct ObserverOptions {
    /// Suppress updates for which the predicate returns false
    pub filter: Option<UpdateFilter>,
    /// Higher priorities are dispatched first
    pub priority: i32,
    /// Drop updates arriving within this window of the last delivery
    pub debounce: Option<Duration>,
}

impl ObserverOptions {
    /// Set the filter
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&VariableValue, &VariableValue) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Set the priority
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the debounce window
    pub fn debounce(mut self, window: Duration) -> Self {
        self.debounce = Some(window);
        self
    }
}

impl fmt::Debug for ObserverOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverOptions")
            .field("filter", &self.filter.is_some())
            .field("priority", &self.priority)
            .field("debounce", &self.debounce)
            .finish()
    }
}

/// Options for `watch_variables`
#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    /// Emit the current value of every watched variable first
    pub include_initial: bool,
    /// Filter, priority and debounce
    pub observer: ObserverOptions,
}

impl WatchOptions {
    /// Emit current values first
    pub fn include_initial(mut self) -> Self {
        self.include_initial = true;
        self
    }

    /// Set the filter
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&VariableValue, &VariableValue) -> bool + Send + Sync + 'static,
    {
        self.observer = self.observer.filter(filter);
        self
    }

    /// Set the debounce window
    pub fn debounce(mut self, window: Duration) -> Self {
        self.observer = self.observer.debounce(window);
        self
    }
}

/// Opaque subscription handle
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub String);

impl SubscriptionId {
    /// Fresh subscription id
    pub fn generate() -> Self {
        SubscriptionId(format!("sub_{}", uuid::Uuid::new_v4().simple()))
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-key outcome of a non-atomic batch, new version on success
pub type BatchResults = BTreeMap<String, VarResult<u64>>;

/// Lazy stream of updates for a watch subscription.
///
/// Ends when the session is destroyed. Dropping it unsubscribes.
pub struct VariableWatch {
    id: SubscriptionId,
    receiver: mpsc::Receiver<VariableUpdate>,
    on_drop: Option<Box<dyn FnOnce(&SubscriptionId) + Send + Sync>>,
}

impl VariableWatch {
    /// Wrap a receiver; `on_drop` runs once when the watch is dropped
    pub fn new(
        id: SubscriptionId,
        receiver: mpsc::Receiver<VariableUpdate>,
        on_drop: impl FnOnce(&SubscriptionId) + Send + Sync + 'static,
    ) -> Self {
        Self {
            id,
            receiver,
            on_drop: Some(Box::new(on_drop)),
        }
    }

    /// Subscription id, usable with `unwatch`
    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    /// Next update, or `None` once the subscription has ended
    pub async fn recv(&mut self) -> Option<VariableUpdate> {
        self.receiver.recv().await
    }
}

impl Stream for VariableWatch {
    type Item = VariableUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for VariableWatch {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop(&self.id);
        }
    }
}

impl fmt::Debug for VariableWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VariableWatch").field("id", &self.id).finish()
    }
}

/// The operation table of the variable store
#[async_trait]
pub trait VariableService: Send + Sync {
    /// Create a session; returns false if it already existed
    async fn create_session(&self, session_id: &SessionId) -> VarResult<bool>;

    /// Tear a session down, ending its watches and failing pending lock waiters
    async fn destroy_session(&self, session_id: &SessionId) -> VarResult<()>;

    /// Live sessions
    async fn list_sessions(&self) -> VarResult<Vec<SessionId>>;

    /// Register a variable at version 0
    async fn register_variable(
        &self,
        session_id: &SessionId,
        caller: &Caller,
        name: &str,
        type_tag: TypeTag,
        initial_value: Json,
        options: RegisterOptions,
    ) -> VarResult<VariableId>;

    /// Current value by name or id
    async fn get_variable(&self, session_id: &SessionId, caller: &Caller, identifier: &str) -> VarResult<VariableValue>;

    /// Full record by name or id
    async fn get_variable_info(&self, session_id: &SessionId, caller: &Caller, identifier: &str) -> VarResult<Variable>;

    /// Values for several identifiers; unresolved or unreadable ones are omitted
    async fn get_variables(
        &self,
        session_id: &SessionId,
        caller: &Caller,
        identifiers: &[String],
    ) -> VarResult<BTreeMap<String, VariableValue>>;

    /// Commit a new value; returns the new version
    async fn set_variable(
        &self,
        session_id: &SessionId,
        caller: &Caller,
        identifier: &str,
        value: Json,
        metadata: HashMap<String, String>,
    ) -> VarResult<u64>;

    /// Commit several values.
    ///
    /// With `atomic` the whole batch is validated first and a failure returns
    /// `PartialFailure` with the failing keys and nothing applied. Without it
    /// each entry is applied on its own.
    async fn set_variables(
        &self,
        session_id: &SessionId,
        caller: &Caller,
        updates: BTreeMap<String, Json>,
        metadata: HashMap<String, String>,
        atomic: bool,
    ) -> VarResult<BatchResults>;

    /// Readable variables passing the filter, sorted by name
    async fn list_variables(&self, session_id: &SessionId, caller: &Caller, filter: ListFilter) -> VarResult<Vec<Variable>>;

    /// Delete a variable without dependents
    async fn delete_variable(&self, session_id: &SessionId, caller: &Caller, identifier: &str) -> VarResult<()>;

    /// Add `from -> to`, rejecting cycles
    async fn add_dependency(
        &self,
        session_id: &SessionId,
        caller: &Caller,
        from: &str,
        to: &str,
        kind: DependencyKind,
    ) -> VarResult<()>;

    /// Remove `from -> to`; returns whether it existed
    async fn remove_dependency(&self, session_id: &SessionId, caller: &Caller, from: &str, to: &str) -> VarResult<bool>;

    /// Propagation order for a change to `identifier`
    async fn get_update_order(&self, session_id: &SessionId, identifier: &str) -> VarResult<Vec<VariableId>>;

    /// Most recent history entries, oldest first
    async fn get_history(
        &self,
        session_id: &SessionId,
        caller: &Caller,
        identifier: &str,
        limit: Option<usize>,
    ) -> VarResult<Vec<HistoryEntry>>;

    /// Subscribe a callback to changes
    async fn add_observer(
        &self,
        session_id: &SessionId,
        caller: &Caller,
        identifiers: &[String],
        callback: Arc<dyn ObserverCallback>,
        options: ObserverOptions,
    ) -> VarResult<SubscriptionId>;

    /// Stream changes to the given variables
    async fn watch_variables(
        &self,
        session_id: &SessionId,
        caller: &Caller,
        identifiers: &[String],
        options: WatchOptions,
    ) -> VarResult<VariableWatch>;

    /// Remove an observer or watch; returns whether it existed
    async fn unwatch(&self, session_id: &SessionId, subscription: &SubscriptionId) -> VarResult<bool>;

    /// Take the optimization lock for the caller.
    ///
    /// `timeout` bounds the wait under the `wait` and `preempt` policies.
    async fn acquire_lock(
        &self,
        session_id: &SessionId,
        caller: &Caller,
        identifier: &str,
        policy: LockPolicy,
        timeout: Option<Duration>,
    ) -> VarResult<OptimizationLock>;

    /// Release the caller's lock
    async fn release_lock(&self, session_id: &SessionId, caller: &Caller, identifier: &str) -> VarResult<()>;

    /// Record progress under the caller's lock; returns whether it became the best
    async fn report_progress(
        &self,
        session_id: &SessionId,
        caller: &Caller,
        identifier: &str,
        report: ProgressReport,
    ) -> VarResult<bool>;

    /// Current lock on a variable
    async fn get_lock(&self, session_id: &SessionId, identifier: &str) -> VarResult<Option<OptimizationLock>>;

    /// Replace a variable's access rules; owner only
    async fn set_access_rules(
        &self,
        session_id: &SessionId,
        caller: &Caller,
        identifier: &str,
        rules: Vec<AccessRule>,
    ) -> VarResult<()>;

    /// Whether the caller holds a permission
    async fn check_access(
        &self,
        session_id: &SessionId,
        caller: &Caller,
        identifier: &str,
        permission: Permission,
    ) -> VarResult<bool>;

    /// Full session contents
    async fn export_state(&self, session_id: &SessionId) -> VarResult<SessionSnapshot>;

    /// Replace a session's contents; all-or-nothing
    async fn import_state(&self, snapshot: SessionSnapshot) -> VarResult<()>;

    /// Export and hand to the storage collaborator
    async fn persist_session(&self, session_id: &SessionId) -> VarResult<()>;

    /// Load from the storage collaborator and import
    async fn restore_session(&self, session_id: &SessionId) -> VarResult<()>;

    /// Health check for the service
    async fn health_check(&self) -> VarResult<bool> {
        Ok(true)
    }
}
