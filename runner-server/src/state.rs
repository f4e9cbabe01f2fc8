//! Shared application state for the control server.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard, watch};

use runner::orchestrator::RunEnv;
use runner::start::RunHandle;

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub env: RunEnv,
    /// The one run this process controls. A finished handle stays until replaced.
    slot: Arc<Mutex<Option<RunHandle>>>,
    /// Flips to true once the server starts shutting down.
    closing: Arc<watch::Sender<bool>>,
}

impl AppState {
    pub fn new(env: RunEnv) -> Self {
        Self {
            env,
            slot: Arc::new(Mutex::new(None)),
            closing: Arc::new(watch::Sender::new(false)),
        }
    }

    pub fn closing(&self) -> watch::Receiver<bool> {
        self.closing.subscribe()
    }

    /// Ask long-lived responses (event streams) to end.
    pub fn begin_shutdown(&self) {
        self.closing.send_replace(true);
    }

    pub async fn slot(&self) -> MutexGuard<'_, Option<RunHandle>> {
        self.slot.lock().await
    }

    /// Id of the run whose orchestrator is still executing, if any.
    pub async fn live_run_id(&self) -> Option<String> {
        self.slot()
            .await
            .as_ref()
            .filter(|handle| !handle.is_finished())
            .map(|handle| handle.run_id().to_string())
    }

    /// Stop the live run and wait for it to wind down.
    pub async fn shutdown(&self) {
        let handle = self.slot().await.take();
        let Some(handle) = handle else {
            return;
        };
        handle.stop();
        let run_id = handle.run_id().to_string();
        match handle.join().await {
            Ok(summary) => {
                tracing::info!(run_id = %run_id, outcome = ?summary.outcome, "run stopped for shutdown");
            }
            Err(err) => {
                tracing::warn!(run_id = %run_id, err = %format!("{err:#}"), "run ended with error");
            }
        }
    }
}
