//! Watch streams
//!
//! A watch is an ordinary observer whose callback forwards into a bounded
//! channel read by the caller's [`varbridge_core::VariableWatch`].

use async_trait::async_trait;
use tokio::sync::mpsc;

use varbridge_core::{ObserverCallback, VarError, VarResult, VariableUpdate};

/// Observer callback that forwards updates into a watch stream
pub(crate) struct WatchSink {
    tx: mpsc::Sender<VariableUpdate>,
}

impl WatchSink {
    pub(crate) fn channel(buffer: usize) -> (Self, mpsc::Receiver<VariableUpdate>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ObserverCallback for WatchSink {
    async fn on_update(&self, update: VariableUpdate) -> VarResult<()> {
        // A closed stream means the subscriber went away
        self.tx
            .send(update)
            .await
            .map_err(|_| VarError::Unavailable("watch stream closed".to_string()))
    }
}
