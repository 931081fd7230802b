//! Optimization lock coordination
//!
//! One slot per variable holds the current lease and a FIFO queue of waiting
//! requests. Stale leases (dead holder or older than the staleness timeout)
//! are reclaimed whenever a slot is touched and by a periodic sweep.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use varbridge_core::{
    AuditEvent, AuditSink, LivenessMonitor, LockEvent, LockPolicy, OptimizationLock, ProcessHandle, ProgressReport,
    ReclaimReason, SessionId, StoreConfig, VarError, VarResult, VariableId,
};

const LOCK_EVENT_CAPACITY: usize = 128;

type GrantSender = oneshot::Sender<VarResult<OptimizationLock>>;

enum Attempt {
    Done(VarResult<OptimizationLock>),
    Queued(u64, oneshot::Receiver<VarResult<OptimizationLock>>),
}

struct Waiter {
    id: u64,
    optimizer_id: String,
    holder: ProcessHandle,
    tx: GrantSender,
}

struct Held {
    lock: OptimizationLock,
    grant_id: u64,
    granted_at: Instant,
}

#[derive(Default)]
struct LockSlot {
    current: Option<Held>,
    waiters: VecDeque<Waiter>,
}

impl LockSlot {
    fn is_idle(&self) -> bool {
        self.current.is_none() && self.waiters.is_empty()
    }
}

/// Exclusive optimization leases for one session
pub struct OptimizerCoordinator {
    session_id: SessionId,
    slots: Mutex<HashMap<VariableId, LockSlot>>,
    next_id: AtomicU64,
    liveness: Arc<dyn LivenessMonitor>,
    audit: Arc<dyn AuditSink>,
    events: broadcast::Sender<LockEvent>,
    stale_timeout: Duration,
    preempt_min_iterations: u64,
    primary_metric: String,
}

impl OptimizerCoordinator {
    /// Create a coordinator
    pub fn new(
        session_id: SessionId,
        config: &StoreConfig,
        liveness: Arc<dyn LivenessMonitor>,
        audit: Arc<dyn AuditSink>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(LOCK_EVENT_CAPACITY);
        Arc::new(Self {
            session_id,
            slots: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            liveness,
            audit,
            events,
            stale_timeout: config.lock_stale_timeout(),
            preempt_min_iterations: config.preempt_min_iterations,
            primary_metric: config.primary_metric.clone(),
        })
    }

    /// Start the periodic stale sweep and the holder termination listener
    pub fn start_background_tasks(self: &Arc<Self>, sweep_interval: Duration) -> Vec<JoinHandle<()>> {
        let sweeper = {
            let coordinator = Arc::downgrade(self);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(sweep_interval);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let Some(coordinator) = coordinator.upgrade() else { break };
                    let reclaimed = coordinator.sweep();
                    if reclaimed > 0 {
                        info!("Sweep reclaimed {} lock(s) in session {}", reclaimed, coordinator.session_id);
                    }
                }
            })
        };

        let listener = Self::start_liveness_listener(Arc::downgrade(self), self.liveness.subscribe());
        vec![sweeper, listener]
    }

    fn start_liveness_listener(
        coordinator: Weak<Self>,
        mut terminated: broadcast::Receiver<ProcessHandle>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let handle = match terminated.recv().await {
                    Ok(handle) => Some(handle),
                    Err(broadcast::error::RecvError::Lagged(_)) => None,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(coordinator) = coordinator.upgrade() else { break };
                match handle {
                    Some(handle) => {
                        coordinator.release_holder(&handle);
                    }
                    None => {
                        coordinator.sweep();
                    }
                }
            }
        })
    }

    /// Lock events for this session
    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.events.subscribe()
    }

    /// Acquire the lock on `var_id` for `optimizer_id`.
    ///
    /// Dropping the returned future, or hitting `timeout`, removes the request
    /// from the wait queue; a grant that raced with the cancellation is
    /// released again.
    pub async fn acquire(
        &self,
        var_id: &VariableId,
        optimizer_id: &str,
        holder: &ProcessHandle,
        policy: LockPolicy,
        timeout: Option<Duration>,
    ) -> VarResult<OptimizationLock> {
        let mut events = Vec::new();
        let attempt = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(var_id.clone()).or_default();
            self.reclaim_if_stale(var_id, slot, &mut events);

            match &slot.current {
                None => {
                    let grant_id = self.next_grant_id();
                    Attempt::Done(Ok(self.grant(var_id, slot, optimizer_id, holder, grant_id, &mut events)))
                }
                Some(held) if held.lock.optimizer_id == optimizer_id => {
                    Attempt::Done(Err(VarError::AlreadyOptimizing(optimizer_id.to_string())))
                }
                Some(held) => match policy {
                    LockPolicy::Abort => Attempt::Done(Err(VarError::LockHeldBy(held.lock.optimizer_id.clone()))),
                    LockPolicy::Preempt if held.lock.preemptible(self.preempt_min_iterations) => {
                        events.push(LockEvent::Preempted {
                            var_id: var_id.clone(),
                            optimizer_id: held.lock.optimizer_id.clone(),
                            by: optimizer_id.to_string(),
                        });
                        slot.current = None;
                        let grant_id = self.next_grant_id();
                        Attempt::Done(Ok(self.grant(var_id, slot, optimizer_id, holder, grant_id, &mut events)))
                    }
                    LockPolicy::Wait | LockPolicy::Preempt => {
                        debug!(
                            "Optimizer {} queued for {} behind {} ({} already waiting)",
                            optimizer_id,
                            var_id,
                            held.lock.optimizer_id,
                            slot.waiters.len()
                        );
                        let (tx, rx) = oneshot::channel();
                        let id = self.next_grant_id();
                        slot.waiters.push_back(Waiter {
                            id,
                            optimizer_id: optimizer_id.to_string(),
                            holder: holder.clone(),
                            tx,
                        });
                        Attempt::Queued(id, rx)
                    }
                },
            }
        };
        self.publish(events);

        let (waiter_id, rx) = match attempt {
            Attempt::Done(result) => return result,
            Attempt::Queued(id, rx) => (id, rx),
        };

        let mut guard = WaitGuard {
            coordinator: self,
            var_id,
            waiter_id,
            armed: true,
        };

        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    return Err(VarError::Timeout(format!(
                        "waiting for optimization lock on {} after {:?}",
                        var_id, limit
                    )))
                }
            },
            None => rx.await,
        };

        match received {
            Ok(Ok(lock)) => {
                guard.armed = false;
                Ok(lock)
            }
            Ok(Err(e)) => {
                guard.armed = false;
                Err(e)
            }
            Err(_) => Err(VarError::Unavailable("lock coordinator shut down".to_string())),
        }
    }

    /// Release a lock held by `optimizer_id`
    pub fn release(&self, var_id: &VariableId, optimizer_id: &str) -> VarResult<()> {
        let mut events = Vec::new();
        {
            let mut slots = self.slots.lock();
            let slot = slots
                .get_mut(var_id)
                .ok_or_else(|| VarError::NotLockHolder(optimizer_id.to_string()))?;
            match &slot.current {
                Some(held) if held.lock.optimizer_id == optimizer_id => {}
                _ => return Err(VarError::NotLockHolder(optimizer_id.to_string())),
            }

            slot.current = None;
            events.push(LockEvent::Released {
                var_id: var_id.clone(),
                optimizer_id: optimizer_id.to_string(),
            });
            self.grant_next(var_id, slot, &mut events);
            if slot.is_idle() {
                slots.remove(var_id);
            }
        }
        self.publish(events);
        Ok(())
    }

    /// Reject a write to `var_id` unless it is unlocked or locked by `caller_id`
    pub fn check_write(&self, var_id: &VariableId, caller_id: &str) -> VarResult<()> {
        let mut events = Vec::new();
        let result = {
            let mut slots = self.slots.lock();
            match slots.get_mut(var_id) {
                Some(slot) => {
                    self.reclaim_if_stale(var_id, slot, &mut events);
                    match &slot.current {
                        Some(held) if held.lock.optimizer_id != caller_id => {
                            Err(VarError::LockHeldBy(held.lock.optimizer_id.clone()))
                        }
                        _ => Ok(()),
                    }
                }
                None => Ok(()),
            }
        };
        self.publish(events);
        result
    }

    /// Record progress; returns whether the report became the best
    pub fn report_progress(&self, var_id: &VariableId, optimizer_id: &str, report: ProgressReport) -> VarResult<bool> {
        let mut slots = self.slots.lock();
        let held = slots
            .get_mut(var_id)
            .and_then(|slot| slot.current.as_mut())
            .filter(|held| held.lock.optimizer_id == optimizer_id)
            .ok_or_else(|| VarError::NotLockHolder(optimizer_id.to_string()))?;

        let iteration = report.iteration;
        let improved = held.lock.record_progress(report, &self.primary_metric);
        debug!(
            "Optimizer {} on {} at iteration {} (improved: {})",
            optimizer_id, var_id, iteration, improved
        );
        Ok(improved)
    }

    /// Current lock on a variable, after reclaiming it if stale
    pub fn get_lock(&self, var_id: &VariableId) -> Option<OptimizationLock> {
        let mut events = Vec::new();
        let lock = {
            let mut slots = self.slots.lock();
            slots.get_mut(var_id).and_then(|slot| {
                self.reclaim_if_stale(var_id, slot, &mut events);
                slot.current.as_ref().map(|held| held.lock.clone())
            })
        };
        self.publish(events);
        lock
    }

    /// Number of queued requests for a variable
    pub fn waiting(&self, var_id: &VariableId) -> usize {
        self.slots.lock().get(var_id).map_or(0, |slot| slot.waiters.len())
    }

    /// Reclaim every stale lock; returns how many were reclaimed
    pub fn sweep(&self) -> usize {
        let mut events = Vec::new();
        {
            let mut slots = self.slots.lock();
            for (var_id, slot) in slots.iter_mut() {
                self.reclaim_if_stale(var_id, slot, &mut events);
            }
            slots.retain(|_, slot| !slot.is_idle());
        }
        let reclaimed = events
            .iter()
            .filter(|event| matches!(event, LockEvent::Reclaimed { .. }))
            .count();
        self.publish(events);
        reclaimed
    }

    /// Reclaim every lock held by a terminated process and drop its queued requests
    pub fn release_holder(&self, holder: &ProcessHandle) -> usize {
        let mut events = Vec::new();
        let mut reclaimed = 0;
        {
            let mut slots = self.slots.lock();
            for (var_id, slot) in slots.iter_mut() {
                slot.waiters.retain(|waiter| &waiter.holder != holder);
                if slot.current.as_ref().map_or(false, |held| &held.lock.holder == holder) {
                    self.reclaim(var_id, slot, ReclaimReason::HolderDead, &mut events);
                    reclaimed += 1;
                }
            }
            slots.retain(|_, slot| !slot.is_idle());
        }
        self.publish(events);
        reclaimed
    }

    /// Drop all state for a deleted variable
    pub fn forget(&self, var_id: &VariableId) {
        let removed = self.slots.lock().remove(var_id);
        let Some(slot) = removed else { return };

        let mut events = Vec::new();
        if let Some(held) = slot.current {
            events.push(LockEvent::Reclaimed {
                var_id: var_id.clone(),
                optimizer_id: held.lock.optimizer_id,
                reason: ReclaimReason::VariableDeleted,
            });
        }
        for waiter in slot.waiters {
            let _ = waiter.tx.send(Err(VarError::NotFound(var_id.0.clone())));
        }
        self.publish(events);
    }

    /// Reclaim every lock and fail every waiter; used when the session closes
    pub fn shutdown(&self) {
        let slots: Vec<(VariableId, LockSlot)> = self.slots.lock().drain().collect();
        let mut events = Vec::new();
        for (var_id, slot) in slots {
            if let Some(held) = slot.current {
                events.push(LockEvent::Reclaimed {
                    var_id: var_id.clone(),
                    optimizer_id: held.lock.optimizer_id,
                    reason: ReclaimReason::SessionClosed,
                });
            }
            for waiter in slot.waiters {
                let _ = waiter.tx.send(Err(VarError::SessionNotFound(self.session_id.0.clone())));
            }
        }
        self.publish(events);
    }

    fn next_grant_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn grant(
        &self,
        var_id: &VariableId,
        slot: &mut LockSlot,
        optimizer_id: &str,
        holder: &ProcessHandle,
        grant_id: u64,
        events: &mut Vec<LockEvent>,
    ) -> OptimizationLock {
        let lock = OptimizationLock::new(var_id.clone(), optimizer_id, holder.clone());
        slot.current = Some(Held {
            lock: lock.clone(),
            grant_id,
            granted_at: Instant::now(),
        });
        events.push(LockEvent::Acquired {
            var_id: var_id.clone(),
            optimizer_id: optimizer_id.to_string(),
            holder: holder.clone(),
        });
        lock
    }

    /// Hand the free slot to the first waiter whose request is still pending
    fn grant_next(&self, var_id: &VariableId, slot: &mut LockSlot, events: &mut Vec<LockEvent>) {
        while slot.current.is_none() {
            let Some(waiter) = slot.waiters.pop_front() else { break };
            if waiter.tx.is_closed() || !self.liveness.is_alive(&waiter.holder) {
                continue;
            }

            let lock = OptimizationLock::new(var_id.clone(), waiter.optimizer_id.clone(), waiter.holder.clone());
            if waiter.tx.send(Ok(lock.clone())).is_ok() {
                slot.current = Some(Held {
                    lock,
                    grant_id: waiter.id,
                    granted_at: Instant::now(),
                });
                events.push(LockEvent::Acquired {
                    var_id: var_id.clone(),
                    optimizer_id: waiter.optimizer_id,
                    holder: waiter.holder,
                });
            }
        }
    }

    fn reclaim_if_stale(&self, var_id: &VariableId, slot: &mut LockSlot, events: &mut Vec<LockEvent>) {
        let reason = match &slot.current {
            Some(held) if !self.liveness.is_alive(&held.lock.holder) => ReclaimReason::HolderDead,
            Some(held) if held.granted_at.elapsed() > self.stale_timeout => ReclaimReason::Stale,
            _ => return,
        };
        self.reclaim(var_id, slot, reason, events);
    }

    fn reclaim(&self, var_id: &VariableId, slot: &mut LockSlot, reason: ReclaimReason, events: &mut Vec<LockEvent>) {
        if let Some(held) = slot.current.take() {
            warn!(
                "Reclaiming lock on {} from {} in session {}: {:?}",
                var_id, held.lock.optimizer_id, self.session_id, reason
            );
            events.push(LockEvent::Reclaimed {
                var_id: var_id.clone(),
                optimizer_id: held.lock.optimizer_id,
                reason,
            });
            self.grant_next(var_id, slot, events);
        }
    }

    /// Remove a cancelled request, or give back a grant that arrived too late
    fn cancel_wait(&self, var_id: &VariableId, waiter_id: u64) {
        let mut events = Vec::new();
        {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(var_id) else { return };

            let before = slot.waiters.len();
            slot.waiters.retain(|waiter| waiter.id != waiter_id);
            if slot.waiters.len() == before {
                if let Some(held) = slot.current.as_ref().filter(|held| held.grant_id == waiter_id) {
                    debug!("Returning lock on {} granted to cancelled request of {}", var_id, held.lock.optimizer_id);
                    events.push(LockEvent::Released {
                        var_id: var_id.clone(),
                        optimizer_id: held.lock.optimizer_id.clone(),
                    });
                    slot.current = None;
                    self.grant_next(var_id, slot, &mut events);
                }
            }
            if slot.is_idle() {
                slots.remove(var_id);
            }
        }
        self.publish(events);
    }

    fn publish(&self, events: Vec<LockEvent>) {
        for event in events {
            debug!("Lock event in session {}: {:?}", self.session_id, event);
            // Lagging or absent subscribers do not affect the lock table
            let _ = self.events.send(event.clone());
            self.audit.record(AuditEvent::Lock {
                session_id: self.session_id.clone(),
                event,
            });
        }
    }
}

impl std::fmt::Debug for OptimizerCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimizerCoordinator")
            .field("session_id", &self.session_id)
            .field("slots", &self.slots.lock().len())
            .finish()
    }
}

struct WaitGuard<'a> {
    coordinator: &'a OptimizerCoordinator,
    var_id: &'a VariableId,
    waiter_id: u64,
    armed: bool,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.coordinator.cancel_wait(self.var_id, self.waiter_id);
        }
    }
}
