//! Observer registry and fan-out
//!
//! Each observer owns a bounded queue drained by its own task, so a slow or
//! failing callback only ever delays itself. `notify` never awaits: it
//! filters, debounces, orders by priority and enqueues.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use varbridge_core::{
    LivenessMonitor, ObserverCallback, ObserverOptions, ProcessHandle, SessionId, SubscriptionId, VarError,
    VariableId, VariableUpdate,
};

struct Observer {
    subscriber: ProcessHandle,
    var_ids: HashSet<VariableId>,
    options: ObserverOptions,
    queue: mpsc::Sender<VariableUpdate>,
    last_delivered: HashMap<VariableId, Instant>,
    seq: u64,
}

#[derive(Default)]
struct Registry {
    observers: HashMap<SubscriptionId, Observer>,
    by_var: HashMap<VariableId, BTreeSet<SubscriptionId>>,
    next_seq: u64,
}

impl Registry {
    fn remove(&mut self, id: &SubscriptionId) -> bool {
        match self.observers.remove(id) {
            Some(observer) => {
                for var_id in &observer.var_ids {
                    if let Some(ids) = self.by_var.get_mut(var_id) {
                        ids.remove(id);
                        if ids.is_empty() {
                            self.by_var.remove(var_id);
                        }
                    }
                }
                true
            }
            None => false,
        }
    }
}

/// Counts from one `notify` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyOutcome {
    /// Updates enqueued
    pub enqueued: usize,
    /// Observers the update was enqueued for, in dispatch order
    pub dispatched: Vec<SubscriptionId>,
    /// Observers skipped by their filter or debounce window
    pub suppressed: usize,
    /// Updates dropped because the observer's queue was full
    pub dropped: usize,
    /// Observers removed because they were unreachable
    pub pruned: usize,
}

/// Subscriptions of one session
pub struct ObserverManager {
    session_id: SessionId,
    registry: Mutex<Registry>,
    liveness: Arc<dyn LivenessMonitor>,
    buffer: usize,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ObserverManager {
    /// Create a manager and start pruning observers as their subscribers terminate
    pub fn new(session_id: SessionId, liveness: Arc<dyn LivenessMonitor>, buffer: usize) -> Arc<Self> {
        let manager = Arc::new(Self {
            session_id,
            registry: Mutex::new(Registry::default()),
            liveness: liveness.clone(),
            buffer,
            listener: Mutex::new(None),
        });

        let listener = Self::start_liveness_listener(Arc::downgrade(&manager), liveness.subscribe());
        *manager.listener.lock() = Some(listener);
        manager
    }

    fn start_liveness_listener(
        manager: Weak<Self>,
        mut terminated: broadcast::Receiver<ProcessHandle>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let handle = match terminated.recv().await {
                    Ok(handle) => Some(handle),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Liveness listener lagged by {} events, rescanning", skipped);
                        None
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(manager) = manager.upgrade() else { break };
                match handle {
                    Some(handle) => {
                        manager.remove_subscriber(&handle);
                    }
                    None => {
                        manager.prune_dead();
                    }
                }
            }
        })
    }

    /// Register an observer for the given variables
    pub fn add_observer(
        &self,
        var_ids: Vec<VariableId>,
        subscriber: ProcessHandle,
        callback: Arc<dyn ObserverCallback>,
        options: ObserverOptions,
    ) -> SubscriptionId {
        let id = SubscriptionId::generate();
        let (queue, rx) = mpsc::channel(self.buffer);
        Self::spawn_delivery(self.session_id.clone(), id.clone(), rx, callback);

        let mut registry = self.registry.lock();
        let seq = registry.next_seq;
        registry.next_seq += 1;
        for var_id in &var_ids {
            registry.by_var.entry(var_id.clone()).or_default().insert(id.clone());
        }
        registry.observers.insert(
            id.clone(),
            Observer {
                subscriber,
                var_ids: var_ids.into_iter().collect(),
                options,
                queue,
                last_delivered: HashMap::new(),
                seq,
            },
        );

        debug!("Added observer {} in session {}", id, self.session_id);
        id
    }

    fn spawn_delivery(
        session_id: SessionId,
        id: SubscriptionId,
        mut rx: mpsc::Receiver<VariableUpdate>,
        callback: Arc<dyn ObserverCallback>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                match callback.on_update(update).await {
                    Ok(()) => {}
                    Err(VarError::Unavailable(reason)) => {
                        debug!("Observer {} in session {} unreachable: {}", id, session_id, reason);
                        break;
                    }
                    Err(e) => warn!("Observer {} in session {} failed: {}", id, session_id, e),
                }
            }
        })
    }

    /// Remove an observer; returns whether it existed
    pub fn remove_observer(&self, id: &SubscriptionId) -> bool {
        let removed = self.registry.lock().remove(id);
        if removed {
            debug!("Removed observer {} from session {}", id, self.session_id);
        }
        removed
    }

    /// Remove every observer owned by a subscriber
    pub fn remove_subscriber(&self, subscriber: &ProcessHandle) -> usize {
        let mut registry = self.registry.lock();
        let ids: Vec<SubscriptionId> = registry
            .observers
            .iter()
            .filter(|(_, observer)| &observer.subscriber == subscriber)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            registry.remove(id);
        }
        if !ids.is_empty() {
            debug!(
                "Pruned {} observer(s) of terminated subscriber {} in session {}",
                ids.len(),
                subscriber,
                self.session_id
            );
        }
        ids.len()
    }

    /// Remove observers whose subscriber is no longer alive
    pub fn prune_dead(&self) -> usize {
        let mut registry = self.registry.lock();
        let ids: Vec<SubscriptionId> = registry
            .observers
            .iter()
            .filter(|(_, observer)| !self.liveness.is_alive(&observer.subscriber))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            registry.remove(id);
        }
        ids.len()
    }

    /// Fan an update out to the observers of its variable.
    ///
    /// Updates whose old and new values are equal are not delivered. Initial
    /// and deletion events skip filters and debounce.
    pub fn notify(&self, update: &VariableUpdate) -> NotifyOutcome {
        let mut outcome = NotifyOutcome::default();
        if update.old_value.is_some() && update.old_value == update.new_value {
            return outcome;
        }

        let mut registry = self.registry.lock();
        let Some(ids) = registry.by_var.get(&update.var_id) else {
            return outcome;
        };
        let ids: Vec<SubscriptionId> = ids.iter().cloned().collect();
        let now = Instant::now();

        let mut targets: Vec<(i32, u64, SubscriptionId)> = Vec::with_capacity(ids.len());
        let mut unreachable = Vec::new();

        for id in ids {
            let Some(observer) = registry.observers.get(&id) else { continue };
            if !self.liveness.is_alive(&observer.subscriber) {
                unreachable.push(id);
                continue;
            }
            if !update.bypasses_filters() && !Self::passes(observer, update, now) {
                outcome.suppressed += 1;
                continue;
            }
            targets.push((observer.options.priority, observer.seq, id));
        }

        // Highest priority first, registration order among equals
        targets.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        for (_, _, id) in targets {
            let Some(observer) = registry.observers.get_mut(&id) else { continue };
            match observer.queue.try_send(update.clone()) {
                Ok(()) => {
                    observer.last_delivered.insert(update.var_id.clone(), now);
                    outcome.enqueued += 1;
                    outcome.dispatched.push(id);
                }
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Observer {} queue full, dropping {} of {} v{}",
                        id,
                        update.event_type(),
                        update.name,
                        update.version
                    );
                    outcome.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => unreachable.push(id),
            }
        }

        for id in &unreachable {
            if registry.remove(id) {
                outcome.pruned += 1;
            }
        }
        if outcome.pruned > 0 {
            debug!("Pruned {} unreachable observer(s) in session {}", outcome.pruned, self.session_id);
        }
        outcome
    }

    fn passes(observer: &Observer, update: &VariableUpdate, now: Instant) -> bool {
        if let (Some(filter), Some(old), Some(new)) = (&observer.options.filter, &update.old_value, &update.new_value) {
            if !filter(old, new) {
                return false;
            }
        }
        match (observer.options.debounce, observer.last_delivered.get(&update.var_id)) {
            (Some(window), Some(last)) => now.duration_since(*last) >= window,
            _ => true,
        }
    }

    /// Enqueue an update for one observer only, bypassing filters
    pub fn deliver_to(&self, id: &SubscriptionId, update: VariableUpdate) -> bool {
        let mut registry = self.registry.lock();
        let Some(observer) = registry.observers.get_mut(id) else {
            return false;
        };
        let var_id = update.var_id.clone();
        match observer.queue.try_send(update) {
            Ok(()) => {
                observer.last_delivered.insert(var_id, Instant::now());
                true
            }
            Err(e) => {
                warn!("Could not enqueue direct update for observer {}: {}", id, e);
                false
            }
        }
    }

    /// Detach a deleted variable; observers left watching nothing are removed
    pub fn remove_variable(&self, var_id: &VariableId) -> usize {
        let mut registry = self.registry.lock();
        let Some(ids) = registry.by_var.remove(var_id) else {
            return 0;
        };

        let mut emptied = Vec::new();
        for id in ids {
            if let Some(observer) = registry.observers.get_mut(&id) {
                observer.var_ids.remove(var_id);
                observer.last_delivered.remove(var_id);
                if observer.var_ids.is_empty() {
                    emptied.push(id);
                }
            }
        }
        for id in &emptied {
            registry.remove(id);
        }
        emptied.len()
    }

    /// Number of registered observers
    pub fn observer_count(&self) -> usize {
        self.registry.lock().observers.len()
    }

    /// Number of observers watching a variable
    pub fn observers_of(&self, var_id: &VariableId) -> usize {
        self.registry.lock().by_var.get(var_id).map_or(0, BTreeSet::len)
    }

    /// Drop every observer, ending their streams once queues drain
    pub fn shutdown(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        let mut registry = self.registry.lock();
        let count = registry.observers.len();
        registry.observers.clear();
        registry.by_var.clear();
        debug!("Dropped {} observer(s) of session {}", count, self.session_id);
    }
}

impl Drop for ObserverManager {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
    }
}

impl std::fmt::Debug for ObserverManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverManager")
            .field("session_id", &self.session_id)
            .field("observers", &self.observer_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::LocalLivenessMonitor;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::time::Duration;
    use varbridge_core::{CallerKind, UpdateKind, VarResult, VariableValue};

    struct Collect(mpsc::UnboundedSender<(String, VariableUpdate)>, String);

    #[async_trait]
    impl ObserverCallback for Collect {
        async fn on_update(&self, update: VariableUpdate) -> VarResult<()> {
            let _ = self.0.send((self.1.clone(), update));
            Ok(())
        }
    }

    fn update(kind: UpdateKind, old: f64, new: f64, version: u64) -> VariableUpdate {
        VariableUpdate {
            session_id: SessionId::from("s"),
            var_id: VariableId("var_t".to_string()),
            name: "temperature".to_string(),
            kind,
            old_value: Some(VariableValue::Float(old)),
            new_value: Some(VariableValue::Float(new)),
            version,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
            source: CallerKind::Owner,
            changed_by: "owner".to_string(),
        }
    }

    /// Liveness that never broadcasts, so only `notify` can prune
    #[derive(Default)]
    struct SilentLiveness {
        dead: Mutex<HashSet<ProcessHandle>>,
    }

    impl LivenessMonitor for SilentLiveness {
        fn is_alive(&self, handle: &ProcessHandle) -> bool {
            !self.dead.lock().contains(handle)
        }

        fn subscribe(&self) -> broadcast::Receiver<ProcessHandle> {
            broadcast::channel(1).1
        }
    }

    fn manager() -> (Arc<ObserverManager>, Arc<LocalLivenessMonitor>) {
        let liveness = Arc::new(LocalLivenessMonitor::new());
        (ObserverManager::new(SessionId::from("s"), liveness.clone(), 8), liveness)
    }

    #[tokio::test]
    async fn test_equal_values_are_not_notified() {
        let (manager, _) = manager();
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.add_observer(
            vec![VariableId("var_t".to_string())],
            ProcessHandle::from("w"),
            Arc::new(Collect(tx, "w".to_string())),
            ObserverOptions::default(),
        );

        let outcome = manager.notify(&update(UpdateKind::Updated, 0.7, 0.7, 1));
        assert_eq!(outcome, NotifyOutcome::default());
    }

    #[tokio::test]
    async fn test_fan_out_reaches_every_observer() {
        let (manager, _) = manager();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut names = HashMap::new();
        for (name, priority) in [("low", 1), ("high", 10), ("mid", 5), ("mid-later", 5)] {
            let id = manager.add_observer(
                vec![VariableId("var_t".to_string())],
                ProcessHandle::from(name),
                Arc::new(Collect(tx.clone(), name.to_string())),
                ObserverOptions::default().priority(priority),
            );
            names.insert(id, name);
        }

        let outcome = manager.notify(&update(UpdateKind::Updated, 0.1, 0.2, 1));
        assert_eq!(outcome.enqueued, 4);
        let order: Vec<&str> = outcome.dispatched.iter().map(|id| names[id]).collect();
        assert_eq!(order, vec!["high", "mid", "mid-later", "low"]);

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(rx.recv().await.unwrap().0);
        }
        seen.sort();
        assert_eq!(seen, vec!["high", "low", "mid", "mid-later"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_drops_within_window() {
        let (manager, _) = manager();
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.add_observer(
            vec![VariableId("var_t".to_string())],
            ProcessHandle::from("w"),
            Arc::new(Collect(tx, "w".to_string())),
            ObserverOptions::default().debounce(Duration::from_millis(100)),
        );

        assert_eq!(manager.notify(&update(UpdateKind::Updated, 0.1, 0.2, 1)).enqueued, 1);
        assert_eq!(manager.notify(&update(UpdateKind::Updated, 0.2, 0.3, 2)).suppressed, 1);

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(manager.notify(&update(UpdateKind::Updated, 0.3, 0.4, 3)).enqueued, 1);

        // Deletions ignore the window
        assert_eq!(manager.notify(&update(UpdateKind::Deleted, 0.4, 0.5, 4)).enqueued, 1);
    }

    #[tokio::test]
    async fn test_dead_subscribers_are_pruned_on_delivery() {
        let liveness = Arc::new(SilentLiveness::default());
        let manager = ObserverManager::new(SessionId::from("s"), liveness.clone(), 8);
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.add_observer(
            vec![VariableId("var_t".to_string())],
            ProcessHandle::from("gone"),
            Arc::new(Collect(tx, "gone".to_string())),
            ObserverOptions::default(),
        );

        liveness.dead.lock().insert(ProcessHandle::from("gone"));
        let outcome = manager.notify(&update(UpdateKind::Updated, 0.1, 0.2, 1));
        assert_eq!(outcome.pruned, 1);
        assert_eq!(manager.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_terminated_subscriber_is_pruned_eagerly() {
        let (manager, liveness) = manager();
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.add_observer(
            vec![VariableId("var_t".to_string())],
            ProcessHandle::from("gone"),
            Arc::new(Collect(tx, "gone".to_string())),
            ObserverOptions::default(),
        );

        liveness.mark_dead(&ProcessHandle::from("gone"));
        tokio::time::timeout(Duration::from_secs(1), async {
            while manager.observer_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("observer was not pruned");
    }

    #[tokio::test]
    async fn test_removing_last_variable_drops_observer() {
        let (manager, _) = manager();
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.add_observer(
            vec![VariableId("var_t".to_string())],
            ProcessHandle::from("w"),
            Arc::new(Collect(tx, "w".to_string())),
            ObserverOptions::default(),
        );

        assert_eq!(manager.observers_of(&VariableId("var_t".to_string())), 1);
        assert_eq!(manager.remove_variable(&VariableId("var_t".to_string())), 1);
        assert_eq!(manager.observer_count(), 0);
    }
}
