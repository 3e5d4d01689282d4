//! Reply correlation between the reader task and in-flight senders.
//!
//! The controller does not echo our sequence number in status replies, so
//! replies are correlated by *content*: a string key derived from the reply
//! kind (and plan id where one applies). The reader inserts decoded replies
//! under their key; a sender blocks on the set of keys that would resolve its
//! command and takes the first hit.
//!
//! A later reply under the same key overwrites the earlier one. Replies are
//! not queued: only the latest state of the device matters, and a stale entry
//! left by a timed-out send must not satisfy the next send's wait ahead of the
//! device's actual answer.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::protocol::payload::PlanReadback;

/// A decoded reply stored for correlation.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// A raw destuffed frame (command results, strategy status, NAKs).
    Frame(Vec<u8>),
    /// A merged plan readback assembled from its two status frames.
    Plan(PlanReadback),
}

/// Correlation key for a positive (0F80) or negative (0F81) command result
/// echoing `label`, e.g. `0f805f10`.
pub fn result_key(positive: bool, label: &str) -> String {
    if positive { format!("0f80{label}") } else { format!("0f81{label}") }
}

/// Correlation key for a NAK to the frame we sent with `seq`.
pub fn nak_key(seq: u8) -> String {
    format!("aaee{seq:03x}")
}

/// Correlation key for the 5FC0 strategy status reply.
pub fn strategy_status_key() -> String {
    "5fc0".to_string()
}

/// Correlation key for the 5FC4 subphase echo of `plan_id`.
pub fn subphase_readback_key(plan_id: u8) -> String {
    format!("5fc4{plan_id:02}")
}

/// Correlation key for the 5FC5 summary echo of `plan_id`.
pub fn plan_summary_readback_key(plan_id: u8) -> String {
    format!("5fc5{plan_id:02}")
}

/// Correlation key for the merged plan readback of `plan_id`.
pub fn plan_readback_key(plan_id: u8) -> String {
    format!("plan{plan_id:02}")
}

/// Per-connection table of decoded replies awaiting pickup.
#[derive(Debug, Default)]
pub struct ResponseTable {
    entries: Mutex<HashMap<String, Response>>,
    changed: Notify,
}

impl ResponseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a reply under `key`, replacing any earlier entry, and wake every
    /// waiter so it can re-check its key set.
    pub fn insert(&self, key: impl Into<String>, response: Response) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.into(), response);
        drop(entries);
        self.changed.notify_waiters();
    }

    /// Remove and return the entry under `key`, if present.
    pub fn take(&self, key: &str) -> Option<Response> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key)
    }

    /// Remove an entry without looking at it.
    pub fn remove(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
    }

    /// Whether `key` currently has a stored reply.
    pub fn contains(&self, key: &str) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.contains_key(key)
    }

    /// Drop every stored reply. Called when the connection is torn down so a
    /// reconnect starts from a clean table.
    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.clear();
        drop(entries);
        self.changed.notify_waiters();
    }

    fn first_hit(&self, keys: &[String]) -> Option<(String, Response)> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        for key in keys {
            if let Some(response) = entries.get(key) {
                return Some((key.clone(), response.clone()));
            }
        }
        None
    }

    /// Wait until any of `keys` has a stored reply or `timeout` elapses.
    ///
    /// The winning entry stays in the table: the waiter decides whether to
    /// remove it. A two-frame handshake deliberately leaves its first half in
    /// place until the second half resolves. Keys earlier in `keys` win ties.
    pub async fn wait_any(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Option<(String, Response)> {
        let deadline = Instant::now() + timeout;
        loop {
            // Arm the notification before checking so an insert between the
            // check and the await still wakes us.
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(hit) = self.first_hit(keys) {
                return Some(hit);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                // Deadline passed while parked; one last check in case the
                // reply landed right at the boundary.
                return self.first_hit(keys);
            }
        }
    }
}
