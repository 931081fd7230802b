//! In-process liveness monitor
//!
//! Handles are alive until reported dead. Termination is broadcast so the
//! observer manager and the lock coordinator can prune eagerly.

use parking_lot::RwLock;
use std::collections::HashSet;
use tokio::sync::broadcast;
use tracing::info;

use varbridge_core::{LivenessMonitor, ProcessHandle};

const TERMINATION_CHANNEL_CAPACITY: usize = 256;

/// Liveness monitor driven by explicit termination reports
#[derive(Debug)]
pub struct LocalLivenessMonitor {
    dead: RwLock<HashSet<ProcessHandle>>,
    terminated: broadcast::Sender<ProcessHandle>,
}

impl LocalLivenessMonitor {
    /// Create a monitor in which every handle is alive
    pub fn new() -> Self {
        let (terminated, _) = broadcast::channel(TERMINATION_CHANNEL_CAPACITY);
        Self {
            dead: RwLock::new(HashSet::new()),
            terminated,
        }
    }

    /// Report a process as terminated; returns false if it was already dead
    pub fn mark_dead(&self, handle: &ProcessHandle) -> bool {
        let newly_dead = self.dead.write().insert(handle.clone());
        if newly_dead {
            info!("Process {} reported terminated", handle);
            // No receivers simply means nobody is listening yet
            let _ = self.terminated.send(handle.clone());
        }
        newly_dead
    }

    /// Report a restarted process as alive again
    pub fn revive(&self, handle: &ProcessHandle) -> bool {
        self.dead.write().remove(handle)
    }
}

impl Default for LocalLivenessMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessMonitor for LocalLivenessMonitor {
    fn is_alive(&self, handle: &ProcessHandle) -> bool {
        !self.dead.read().contains(handle)
    }

    fn subscribe(&self) -> broadcast::Receiver<ProcessHandle> {
        self.terminated.subscribe()
    }
}
