//! Fire-and-forget remote calls.
//!
//! Best-effort calls (point upserts, live publishes) run as detached tasks so a
//! slow service never holds up ingestion. Their outcomes come back through
//! [`TaskSupervisor::next_completion`] and failures are kept in a bounded log.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use tokio::task::{Id, JoinSet};

use crate::error::Result;

/// Failures kept for diagnostics.
const FAILURE_LOG_CAPACITY: usize = 32;

/// What a supervised task was doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    PointUpsert,
    SnappedPointUpsert,
    LivePublish,
}

/// A supervised task that failed.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub kind: TaskKind,
    pub message: String,
}

type Outcome = std::result::Result<(), TaskFailure>;

#[derive(Debug, Default)]
pub struct TaskSupervisor {
    tasks: JoinSet<Outcome>,
    /// Kind of every running task, so a panic can still be attributed
    kinds: HashMap<Id, TaskKind>,
    failures: VecDeque<TaskFailure>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fut` in the background.
    pub fn spawn<F>(&mut self, kind: TaskKind, fut: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let handle = self.tasks.spawn(async move {
            fut.await.map_err(|e| TaskFailure {
                kind,
                message: e.message(),
            })
        });
        self.kinds.insert(handle.id(), kind);
    }

    pub fn is_idle(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Recent failures, oldest first.
    pub fn failures(&self) -> impl Iterator<Item = &TaskFailure> {
        self.failures.iter()
    }

    /// Wait for the next task to finish.
    ///
    /// Returns `Some(Ok(()))` for a success and `Some(Err(_))` for a failure
    /// (also recorded in the log). `None` when nothing is running.
    pub async fn next_completion(&mut self) -> Option<Outcome> {
        let joined = self.tasks.join_next_with_id().await?;
        let outcome = match joined {
            Ok((id, outcome)) => {
                self.kinds.remove(&id);
                outcome
            }
            Err(e) => {
                let kind = self.kinds.remove(&e.id());
                if e.is_cancelled() {
                    Ok(())
                } else {
                    let kind = kind.unwrap_or(TaskKind::PointUpsert);
                    warn!("[TaskSupervisor] {:?} task panicked: {}", kind, e);
                    Err(TaskFailure {
                        kind,
                        message: format!("Task error: {}", e),
                    })
                }
            }
        };
        if let Err(failure) = &outcome {
            warn!("[TaskSupervisor] {:?} failed: {}", failure.kind, failure.message);
            if self.failures.len() == FAILURE_LOG_CAPACITY {
                self.failures.pop_front();
            }
            self.failures.push_back(failure.clone());
        }
        Some(outcome)
    }

    /// Let in-flight tasks finish for up to `grace`, then abort the rest.
    /// Returns the failures observed while draining.
    pub async fn drain(&mut self, grace: Duration) -> Vec<TaskFailure> {
        let mut failures = Vec::new();
        let deadline = tokio::time::Instant::now() + grace;
        while !self.tasks.is_empty() {
            match tokio::time::timeout_at(deadline, self.next_completion()).await {
                Ok(Some(Err(failure))) => failures.push(failure),
                Ok(Some(Ok(()))) => {}
                Ok(None) => break,
                Err(_) => {
                    debug!("[TaskSupervisor] Aborting {} unfinished tasks", self.tasks.len());
                    self.tasks.shutdown().await;
                    self.kinds.clear();
                    break;
                }
            }
        }
        failures
    }
}
