//! Fake implementations of the collaborator traits that record what they see.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

use varbridge_core::{
    AuditEvent, AuditSink, LivenessMonitor, ObserverCallback, Permission, ProcessHandle, PropagationRequest,
    Propagator, VarError, VarResult, VariableUpdate,
};

/// Waits until `ready` holds or the deadline passes
async fn wait_until(notify: &Notify, within: Duration, ready: impl Fn() -> bool) {
    let _ = tokio::time::timeout(within, async {
        loop {
            let notified = notify.notified();
            if ready() {
                return;
            }
            notified.await;
        }
    })
    .await;
}

/// Audit sink that keeps every event
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditSink {
    /// Create an empty sink
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Everything recorded so far
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Number of events with the given type name
    pub fn count(&self, event_type: &str) -> usize {
        self.events.lock().iter().filter(|e| e.event_type() == event_type).count()
    }

    /// `(caller, permission, granted)` of every access check
    pub fn access_checks(&self) -> Vec<(String, Permission, bool)> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                AuditEvent::AccessChecked {
                    caller,
                    permission,
                    granted,
                    ..
                } => Some((caller.clone(), *permission, *granted)),
                _ => None,
            })
            .collect()
    }
}

impl AuditSink for RecordingAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}

/// Observer callback that keeps every update it receives
#[derive(Debug, Default)]
pub struct RecordingCallback {
    updates: Mutex<Vec<VariableUpdate>>,
    notify: Notify,
}

impl RecordingCallback {
    /// Create an empty recorder
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Updates received so far
    pub fn updates(&self) -> Vec<VariableUpdate> {
        self.updates.lock().clone()
    }

    /// Versions received so far
    pub fn versions(&self) -> Vec<u64> {
        self.updates.lock().iter().map(|u| u.version).collect()
    }

    /// Wait until at least `count` updates arrived, then return them all
    pub async fn wait_for(&self, count: usize, within: Duration) -> Vec<VariableUpdate> {
        wait_until(&self.notify, within, || self.updates.lock().len() >= count).await;
        self.updates()
    }
}

#[async_trait]
impl ObserverCallback for RecordingCallback {
    async fn on_update(&self, update: VariableUpdate) -> VarResult<()> {
        self.updates.lock().push(update);
        self.notify.notify_one();
        Ok(())
    }
}

/// Observer callback that always fails
#[derive(Debug)]
pub struct FailingCallback {
    error: VarError,
    calls: AtomicUsize,
}

impl FailingCallback {
    /// Fail every call with a generic error
    pub fn new() -> Arc<Self> {
        Self::with_error(VarError::Other("callback failed".to_string()))
    }

    /// Fail every call with the given error
    pub fn with_error(error: VarError) -> Arc<Self> {
        Arc::new(Self {
            error,
            calls: AtomicUsize::new(0),
        })
    }

    /// Number of invocations
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObserverCallback for FailingCallback {
    async fn on_update(&self, _update: VariableUpdate) -> VarResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// Propagator that records requests instead of recomputing anything
#[derive(Debug, Default)]
pub struct RecordingPropagator {
    requests: Mutex<Vec<PropagationRequest>>,
    notify: Notify,
}

impl RecordingPropagator {
    /// Create an empty recorder
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<PropagationRequest> {
        self.requests.lock().clone()
    }

    /// Wait until at least `count` requests arrived, then return them all
    pub async fn wait_for(&self, count: usize, within: Duration) -> Vec<PropagationRequest> {
        wait_until(&self.notify, within, || self.requests.lock().len() >= count).await;
        self.requests()
    }
}

#[async_trait]
impl Propagator for RecordingPropagator {
    async fn propagate(&self, request: PropagationRequest) -> VarResult<()> {
        self.requests.lock().push(request);
        self.notify.notify_one();
        Ok(())
    }
}

/// Liveness monitor the test kills processes in by hand
#[derive(Debug)]
pub struct ManualLiveness {
    dead: RwLock<HashSet<ProcessHandle>>,
    terminated: broadcast::Sender<ProcessHandle>,
}

impl ManualLiveness {
    /// Every process starts alive
    pub fn new() -> Arc<Self> {
        let (terminated, _) = broadcast::channel(64);
        Arc::new(Self {
            dead: RwLock::new(HashSet::new()),
            terminated,
        })
    }

    /// Mark dead and announce the termination
    pub fn kill(&self, handle: &str) {
        let handle = ProcessHandle::from(handle);
        self.dead.write().insert(handle.clone());
        let _ = self.terminated.send(handle);
    }

    /// Mark dead without announcing; only lazy checks will notice
    pub fn kill_silently(&self, handle: &str) {
        self.dead.write().insert(ProcessHandle::from(handle));
    }
}

impl LivenessMonitor for ManualLiveness {
    fn is_alive(&self, handle: &ProcessHandle) -> bool {
        !self.dead.read().contains(handle)
    }

    fn subscribe(&self) -> broadcast::Receiver<ProcessHandle> {
        self.terminated.subscribe()
    }
}
