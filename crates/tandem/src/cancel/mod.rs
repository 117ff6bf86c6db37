//! Cancellation controller.
//!
//! Maps a tracking id (external id if present, else session id) to the abort
//! handle of its active run. `stop` only signals; the entry is removed once,
//! by the run itself, when its `RunRegistration` is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TandemError};

struct ActiveRun {
    generation: u64,
    cancel: CancellationToken,
    released: watch::Receiver<bool>,
}

type RunTable = Arc<Mutex<HashMap<String, ActiveRun>>>;

fn lock(table: &RunTable) -> std::sync::MutexGuard<'_, HashMap<String, ActiveRun>> {
    match table.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Table of active runs keyed by tracking id.
#[derive(Clone, Default)]
pub struct CancellationController {
    runs: RunTable,
    generation: Arc<AtomicU64>,
}

impl std::fmt::Debug for CancellationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationController")
            .field("active", &lock(&self.runs).len())
            .finish()
    }
}

impl CancellationController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new run for `tracking_id`.
    ///
    /// Fails with `Conflict` while another run holds the same id.
    pub fn register(&self, tracking_id: &str) -> Result<RunRegistration> {
        let mut runs = lock(&self.runs);
        if runs.contains_key(tracking_id) {
            return Err(TandemError::Conflict(tracking_id.to_string()));
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (released_tx, released_rx) = watch::channel(false);
        runs.insert(
            tracking_id.to_string(),
            ActiveRun {
                generation,
                cancel: cancel.clone(),
                released: released_rx,
            },
        );
        debug!("Registered run {} for {}", generation, tracking_id);

        Ok(RunRegistration {
            tracking_id: tracking_id.to_string(),
            generation,
            cancel,
            released_tx,
            runs: Arc::clone(&self.runs),
            done: false,
        })
    }

    /// Signal the active run for `tracking_id`. Returns whether one was found.
    pub fn stop(&self, tracking_id: &str) -> bool {
        let runs = lock(&self.runs);
        match runs.get(tracking_id) {
            Some(run) => {
                info!("Stop requested for {}", tracking_id);
                run.cancel.cancel();
                true
            }
            None => {
                debug!("Stop requested for {} but no run is active", tracking_id);
                false
            }
        }
    }

    /// Signal every active run. Returns how many were signalled.
    pub fn stop_all(&self) -> usize {
        let runs = lock(&self.runs);
        for run in runs.values() {
            run.cancel.cancel();
        }
        runs.len()
    }

    pub fn is_active(&self, tracking_id: &str) -> bool {
        lock(&self.runs).contains_key(tracking_id)
    }

    pub fn active_count(&self) -> usize {
        lock(&self.runs).len()
    }

    /// Wait until the run for `tracking_id` (if any) has been released.
    pub async fn wait_released(&self, tracking_id: &str) {
        let released = lock(&self.runs)
            .get(tracking_id)
            .map(|run| run.released.clone());
        if let Some(mut released) = released {
            // A dropped sender also means released.
            let _ = released.wait_for(|done| *done).await;
        }
    }
}

/// Ownership of one active run's slot in the controller.
///
/// Dropping it releases the slot as well.
pub struct RunRegistration {
    tracking_id: String,
    generation: u64,
    cancel: CancellationToken,
    released_tx: watch::Sender<bool>,
    runs: RunTable,
    done: bool,
}

impl std::fmt::Debug for RunRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunRegistration")
            .field("tracking_id", &self.tracking_id)
            .field("generation", &self.generation)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl RunRegistration {
    pub fn tracking_id(&self) -> &str {
        &self.tracking_id
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Remove the run from the controller and wake `wait_released` callers.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        {
            let mut runs = lock(&self.runs);
            if runs
                .get(&self.tracking_id)
                .is_some_and(|run| run.generation == self.generation)
            {
                runs.remove(&self.tracking_id);
            }
        }
        let _ = self.released_tx.send(true);
        debug!("Released run {} for {}", self.generation, self.tracking_id);
    }
}

impl Drop for RunRegistration {
    fn drop(&mut self) {
        self.release_inner();
    }
}
