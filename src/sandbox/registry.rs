//! Execution registry
//!
//! Map of execution id to handle behind one mutex. Every transition for an
//! id happens under the lock, so readers never see a half-updated handle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::executor::{ExecutionId, ExecutionResult, ExecutionStatus};
use crate::error::{Error, Result};

/// Snapshot of one execution's lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionHandle {
    pub execution_id: ExecutionId,
    pub language: String,
    pub session: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub cancel_requested: bool,
}

/// Cancellation signal shared between the registry and the driver
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

struct Entry {
    handle: ExecutionHandle,
    token: CancelToken,
    result: Option<ExecutionResult>,
    /// Outcome decided; the entry only awaits its result
    settled: bool,
}

/// Tracks executions by id; keeps a bounded history of finished ones
pub struct ExecutionRegistry {
    entries: Mutex<HashMap<ExecutionId, Entry>>,
    history_limit: usize,
}

impl ExecutionRegistry {
    pub fn new(history_limit: usize) -> Self {
        ExecutionRegistry {
            entries: Mutex::new(HashMap::new()),
            history_limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ExecutionId, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a new Pending execution
    pub fn register(&self, id: &ExecutionId, language: &str, session: &str) -> Result<CancelToken> {
        let mut entries = self.lock();
        if entries.contains_key(id) {
            return Err(Error::Internal(format!("execution id {} already registered", id)));
        }

        let token = CancelToken::default();
        entries.insert(
            id.clone(),
            Entry {
                handle: ExecutionHandle {
                    execution_id: id.clone(),
                    language: language.to_string(),
                    session: session.to_string(),
                    started_at: Utc::now(),
                    finished_at: None,
                    status: ExecutionStatus::Pending,
                    cancel_requested: false,
                },
                token: token.clone(),
                result: None,
                settled: false,
            },
        );
        debug!("Registered execution {}", id);
        Ok(token)
    }

    /// Pending -> Running. False when the execution was cancelled first or
    /// is not Pending.
    pub fn mark_running(&self, id: &ExecutionId) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(id) {
            Some(entry)
                if entry.handle.status == ExecutionStatus::Pending
                    && !entry.handle.cancel_requested =>
            {
                entry.handle.status = ExecutionStatus::Running;
                true
            }
            _ => false,
        }
    }

    /// Fix the outcome of a Running execution once its unit has stopped
    ///
    /// False when cancellation was requested first; afterwards `cancel`
    /// is refused, since there is nothing left to stop.
    pub fn settle(&self, id: &ExecutionId) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(id) {
            Some(entry) if !entry.handle.cancel_requested => {
                entry.settled = true;
                true
            }
            _ => false,
        }
    }

    /// Move to a terminal status. Only the first terminal transition wins.
    pub fn finish(&self, id: &ExecutionId, result: ExecutionResult) -> bool {
        let status = result.status;
        if !status.is_terminal() {
            warn!("Ignoring non-terminal finish for {}: {}", id, status);
            return false;
        }

        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(id) else {
            return false;
        };
        if entry.handle.status.is_terminal() {
            return false;
        }

        entry.handle.status = status;
        entry.handle.finished_at = Some(Utc::now());
        entry.result = Some(result);
        debug!("Execution {} finished: {}", id, status);

        Self::evict(&mut entries, self.history_limit);
        true
    }

    /// Request cancellation of a live execution
    ///
    /// True only for the first request against a Pending or Running entry
    /// whose outcome is not settled yet.
    pub fn cancel(&self, id: &ExecutionId) -> bool {
        let token = {
            let mut entries = self.lock();
            match entries.get_mut(id) {
                Some(entry)
                    if entry.handle.status.is_live()
                        && !entry.handle.cancel_requested
                        && !entry.settled =>
                {
                    entry.handle.cancel_requested = true;
                    entry.token.clone()
                }
                _ => return false,
            }
        };
        token.cancel();
        debug!("Cancellation requested for {}", id);
        true
    }

    pub fn is_cancel_requested(&self, id: &ExecutionId) -> bool {
        self.lock()
            .get(id)
            .map_or(false, |entry| entry.handle.cancel_requested)
    }

    pub fn get(&self, id: &ExecutionId) -> Option<ExecutionHandle> {
        self.lock().get(id).map(|entry| entry.handle.clone())
    }

    /// Final result, once terminal
    pub fn result(&self, id: &ExecutionId) -> Option<ExecutionResult> {
        self.lock().get(id).and_then(|entry| entry.result.clone())
    }

    /// All known executions, oldest first
    pub fn list(&self) -> Vec<ExecutionHandle> {
        let mut handles: Vec<_> = self.lock().values().map(|e| e.handle.clone()).collect();
        handles.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        handles
    }

    pub fn list_for_session(&self, session: &str) -> Vec<ExecutionHandle> {
        self.list()
            .into_iter()
            .filter(|handle| handle.session == session)
            .collect()
    }

    /// Number of Pending or Running executions
    pub fn active_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|e| e.handle.status.is_live())
            .count()
    }

    fn evict(entries: &mut HashMap<ExecutionId, Entry>, limit: usize) {
        let mut finished: Vec<(DateTime<Utc>, ExecutionId)> = entries
            .values()
            .filter_map(|e| e.handle.finished_at.map(|at| (at, e.handle.execution_id.clone())))
            .collect();
        if finished.len() <= limit {
            return;
        }
        finished.sort();
        let excess = finished.len() - limit;
        for (_, id) in finished.into_iter().take(excess) {
            entries.remove(&id);
        }
    }
}

impl Default for ExecutionRegistry {
    fn default() -> Self {
        ExecutionRegistry::new(256)
    }
}
