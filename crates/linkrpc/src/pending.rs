//! Correlation table for in-flight calls.
//!
//! Each outgoing request gets an entry keyed by its id. A blocking entry
//! is resolved once and removed; a feedback entry stays in place and its
//! callback runs for every response carrying that id until released.

use linkrpc_core::{RequestId, Result, RpcError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};

/// Callback invoked for every response addressed to a feedback call.
pub type FeedbackCallback = Arc<dyn Fn(Result<Value>) + Send + Sync>;

enum Waiter {
    Blocking(oneshot::Sender<Result<Value>>),
    Callback(FeedbackCallback),
}

/// Pending calls of one client, keyed by correlation id.
#[derive(Default)]
pub struct CorrelationTable {
    entries: Mutex<HashMap<RequestId, Waiter>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a blocking entry and return the receiver its response lands on.
    pub async fn insert_waiter(&self, id: RequestId) -> oneshot::Receiver<Result<Value>> {
        let (tx, rx) = oneshot::channel();
        self.entries.lock().await.insert(id, Waiter::Blocking(tx));
        rx
    }

    /// Insert a feedback entry.
    pub async fn insert_callback(&self, id: RequestId, callback: FeedbackCallback) {
        self.entries
            .lock()
            .await
            .insert(id, Waiter::Callback(callback));
    }

    /// Route a response to the entry with the same id.
    ///
    /// Returns `false` when no entry matches.
    pub async fn resolve(&self, id: RequestId, outcome: Result<Value>) -> bool {
        let callback = {
            let mut entries = self.entries.lock().await;
            match entries.remove(&id) {
                None => return false,
                Some(Waiter::Blocking(tx)) => {
                    // The caller may have given up (timeout); nothing to do then.
                    let _ = tx.send(outcome);
                    return true;
                }
                Some(Waiter::Callback(callback)) => {
                    entries.insert(id, Waiter::Callback(callback.clone()));
                    callback
                }
            }
        };
        callback(outcome);
        true
    }

    /// Drop an entry of either kind. Returns whether one was present.
    pub async fn remove(&self, id: RequestId) -> bool {
        self.entries.lock().await.remove(&id).is_some()
    }

    /// Fail every blocking entry with the error built by `make_err`.
    ///
    /// Feedback entries are kept. Returns how many calls were failed.
    pub async fn fail_waiters(&self, make_err: impl Fn() -> RpcError) -> usize {
        let mut entries = self.entries.lock().await;
        let blocking: Vec<RequestId> = entries
            .iter()
            .filter(|(_, waiter)| matches!(waiter, Waiter::Blocking(_)))
            .map(|(id, _)| *id)
            .collect();

        for id in &blocking {
            if let Some(Waiter::Blocking(tx)) = entries.remove(id) {
                let _ = tx.send(Err(make_err()));
            }
        }
        blocking.len()
    }

    pub async fn contains(&self, id: RequestId) -> bool {
        self.entries.lock().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
