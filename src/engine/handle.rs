//! Cloneable control handle for a running engine

use super::metrics::EngineMetrics;
use super::EngineState;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Stops an engine and observes it from other tasks
#[derive(Debug, Clone)]
pub struct EngineHandle {
    stop: Arc<watch::Sender<bool>>,
    metrics: watch::Receiver<EngineMetrics>,
    state: watch::Receiver<EngineState>,
}

impl EngineHandle {
    pub(crate) fn new(
        stop: Arc<watch::Sender<bool>>,
        metrics: watch::Receiver<EngineMetrics>,
        state: watch::Receiver<EngineState>,
    ) -> Self {
        Self {
            stop,
            metrics,
            state,
        }
    }

    /// Request a stop
    ///
    /// Idempotent. Returns `true` only for the call that flipped the flag.
    /// The round in flight, if any, is allowed to finish; no round starts
    /// after this returns.
    pub fn stop(&self) -> bool {
        let flipped = self.stop.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        });
        if flipped {
            info!("Engine stop requested");
        }
        flipped
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Latest published metrics snapshot
    pub fn metrics(&self) -> EngineMetrics {
        self.metrics.borrow().clone()
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Wait until the engine publishes metrics for another round
    ///
    /// Returns `false` once the engine has been dropped.
    pub async fn metrics_changed(&mut self) -> bool {
        self.metrics.changed().await.is_ok()
    }
}
