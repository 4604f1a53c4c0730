//! Correlation of in-flight tool invocations with client answers.
//!
//! A tool handler registers before presenting anything to the client and
//! then awaits the returned receiver; the transport resolves the matching
//! id when the client answers. An id resolves at most once, and resolving
//! an unknown or stale id is a no-op rather than an error, so answers from
//! a superseded session cannot disturb the current one.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

pub struct ToolCallRegistry {
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    counter: AtomicU64,
    // Millisecond salt fixed at construction; ids stay unique across
    // registry instances within one process lifetime.
    salt: i64,
}

impl ToolCallRegistry {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
            salt: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Allocates a fresh call id and parks a one-shot slot for its answer.
    pub fn register(&self) -> (String, oneshot::Receiver<Value>) {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("tc_{}_{}", n, self.salt);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("tool registry lock poisoned")
            .insert(id.clone(), tx);
        (id, rx)
    }

    /// Fulfills the suspension waiting on `id`, if any.
    pub fn resolve(&self, id: &str, answer: Value) {
        let slot = self
            .pending
            .lock()
            .expect("tool registry lock poisoned")
            .remove(id);
        match slot {
            // The receiver may already be gone if the session was discarded.
            Some(tx) => {
                let _ = tx.send(answer);
            }
            None => debug!(%id, "ignoring answer for unknown or already-resolved tool call"),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .expect("tool registry lock poisoned")
            .len()
    }
}

impl Default for ToolCallRegistry {
    fn default() -> Self {
        Self::new()
    }
}
