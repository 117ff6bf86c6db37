//! Permission broker.
//!
//! Parks a single tool invocation until a human decides on it. Decisions are
//! correlated by `(session_id, tool_use_id)` and each slot resolves exactly
//! once: by `resolve`, by `deny_all`, or by the run's abort token.

use std::collections::HashMap;
use std::sync::Mutex;

use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use tandem_protocol::{PendingPermission, PermissionDecision};

/// Message handed to tools denied because their run was stopped.
pub const ABORT_DENY_MESSAGE: &str = "Session aborted";

struct Slot {
    tool_name: String,
    input: Value,
    tx: oneshot::Sender<PermissionDecision>,
}

/// Table of parked tool invocations, keyed by session then tool use id.
#[derive(Default)]
pub struct PermissionBroker {
    slots: Mutex<HashMap<String, HashMap<String, Slot>>>,
}

impl std::fmt::Debug for PermissionBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionBroker")
            .field("sessions", &self.with_slots(|slots| slots.len()))
            .finish()
    }
}

impl PermissionBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_slots<R>(&self, f: impl FnOnce(&mut HashMap<String, HashMap<String, Slot>>) -> R) -> R {
        let mut guard = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Record a pending tool invocation and return the handle its runner waits on.
    ///
    /// Parking the same `tool_use_id` twice replaces the earlier slot, whose
    /// waiter then observes a deny.
    pub fn park(
        &self,
        session_id: &str,
        tool_use_id: &str,
        tool_name: &str,
        input: Value,
    ) -> PermissionTicket {
        let (tx, rx) = oneshot::channel();
        let replaced = self.with_slots(|slots| {
            slots.entry(session_id.to_string()).or_default().insert(
                tool_use_id.to_string(),
                Slot {
                    tool_name: tool_name.to_string(),
                    input,
                    tx,
                },
            )
        });
        if replaced.is_some() {
            warn!(
                "Replaced pending permission {} for session {}",
                tool_use_id, session_id
            );
        }
        debug!(
            "Parked permission {} ({}) for session {}",
            tool_use_id, tool_name, session_id
        );

        PermissionTicket {
            session_id: session_id.to_string(),
            tool_use_id: tool_use_id.to_string(),
            rx,
        }
    }

    fn take(&self, session_id: &str, tool_use_id: &str) -> Option<Slot> {
        self.with_slots(|slots| {
            let session = slots.get_mut(session_id)?;
            let slot = session.remove(tool_use_id);
            if session.is_empty() {
                slots.remove(session_id);
            }
            slot
        })
    }

    /// Resolve a parked invocation.
    ///
    /// Returns `false` when the slot is absent or already resolved.
    pub fn resolve(&self, session_id: &str, tool_use_id: &str, decision: PermissionDecision) -> bool {
        let Some(slot) = self.take(session_id, tool_use_id) else {
            debug!(
                "No pending permission {} for session {}",
                tool_use_id, session_id
            );
            return false;
        };
        info!(
            "Resolved permission {} ({}) for session {}: {}",
            tool_use_id,
            slot.tool_name,
            session_id,
            if decision.is_allow() { "allow" } else { "deny" }
        );
        // The waiter may have gone away with its run; the slot is consumed either way.
        let _ = slot.tx.send(decision);
        true
    }

    /// Deny every outstanding invocation of a session. Returns how many were denied.
    pub fn deny_all(&self, session_id: &str) -> usize {
        let Some(session) = self.with_slots(|slots| slots.remove(session_id)) else {
            return 0;
        };
        let count = session.len();
        for (_, slot) in session {
            let _ = slot.tx.send(PermissionDecision::deny(ABORT_DENY_MESSAGE));
        }
        if count > 0 {
            info!("Denied {} pending permissions for session {}", count, session_id);
        }
        count
    }

    /// Snapshot of a session's outstanding invocations.
    pub fn pending(&self, session_id: &str) -> Vec<PendingPermission> {
        self.with_slots(|slots| {
            let mut pending: Vec<PendingPermission> = slots
                .get(session_id)
                .map(|session| {
                    session
                        .iter()
                        .map(|(tool_use_id, slot)| PendingPermission {
                            tool_use_id: tool_use_id.clone(),
                            tool_name: slot.tool_name.clone(),
                            input: slot.input.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            pending.sort_by(|a, b| a.tool_use_id.cmp(&b.tool_use_id));
            pending
        })
    }

    pub fn has_pending(&self, session_id: &str) -> bool {
        self.with_slots(|slots| slots.contains_key(session_id))
    }
}

/// The waiting half of a parked invocation.
#[derive(Debug)]
pub struct PermissionTicket {
    session_id: String,
    tool_use_id: String,
    rx: oneshot::Receiver<PermissionDecision>,
}

impl PermissionTicket {
    pub fn tool_use_id(&self) -> &str {
        &self.tool_use_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Wait for a human decision or for `cancel`, whichever comes first.
    ///
    /// Abort and a dropped slot both resolve to deny.
    pub async fn wait(self, cancel: &CancellationToken) -> PermissionDecision {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => PermissionDecision::deny(ABORT_DENY_MESSAGE),
            decision = self.rx => decision.unwrap_or_else(|_| PermissionDecision::deny(ABORT_DENY_MESSAGE)),
        }
    }
}
