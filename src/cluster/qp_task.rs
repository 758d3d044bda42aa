//! Query-processing task admission, redirect and deadline handling
//!
//! A QP task holds an admission permit from the moment it is submitted until
//! it finishes, so `max_queue_num_of_qp_task` bounds queued plus running
//! tasks. Admission never waits: a full queue rejects immediately. Running
//! tasks share `concurrent_qp_sub_task_thread` worker permits. Every task is
//! bounded by `qp_task_timeout`, redirects included.

use super::NodeId;
use crate::config::ClusterConfig;
use crate::{Error, Result};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

const BACKOFF_BASE_MS: u64 = 5;
const BACKOFF_MAX_MS: u64 = 100;

/// Outcome of one attempt of a redirectable task
#[derive(Debug)]
pub enum Attempt<T> {
    Done(T),
    /// The contacted node cannot serve the task; optionally names who can
    Redirect(Option<NodeId>),
}

#[derive(Debug, Clone)]
pub struct QpTaskPool {
    admission: Arc<Semaphore>,
    capacity: usize,
    workers: Arc<Semaphore>,
    redo_count: usize,
    timeout: Duration,
}

impl QpTaskPool {
    pub fn from_config(config: &ClusterConfig) -> Self {
        Self::new(
            config.max_queue_num_of_qp_task,
            config.effective_qp_sub_task_threads(),
            config.qp_task_redo_count,
            config.qp_task_timeout(),
        )
    }

    pub fn new(capacity: usize, workers: usize, redo_count: usize, timeout: Duration) -> Self {
        Self {
            admission: Arc::new(Semaphore::new(capacity)),
            capacity,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            redo_count,
            timeout,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tasks currently admitted (queued or running)
    pub fn outstanding(&self) -> usize {
        self.capacity - self.admission.available_permits()
    }

    pub fn redo_count(&self) -> usize {
        self.redo_count
    }

    /// Run `task` under admission control, a worker permit and the deadline
    pub async fn submit<T, Fut>(&self, task: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let _admitted = self
            .admission
            .clone()
            .try_acquire_owned()
            .map_err(|_| {
                warn!(capacity = self.capacity, "QP task rejected, queue is full");
                Error::QueueRejected {
                    capacity: self.capacity,
                }
            })?;

        let run = async {
            let _worker = self
                .workers
                .acquire()
                .await
                .map_err(|_| Error::Internal("QP worker pool closed".to_string()))?;
            task.await
        };

        match tokio::time::timeout(self.timeout, run).await {
            Ok(result) => result,
            Err(_) => {
                let after_ms = self.timeout.as_millis() as u64;
                warn!(after_ms, "QP task timed out");
                Err(Error::Timeout { after_ms })
            }
        }
    }

    /// Run a task that may need redirecting to another replica
    ///
    /// `attempt` is tried against `candidates[0]` first. A redirect follows
    /// the returned leader hint when there is one and otherwise moves to the
    /// next candidate. Redirectable errors count as redirects. After
    /// `redo_count` attempts the task fails with `RedirectExhausted`.
    pub async fn submit_redirected<T, F, Fut>(
        &self,
        candidates: Vec<NodeId>,
        attempt: F,
    ) -> Result<T>
    where
        F: FnMut(NodeId) -> Fut,
        Fut: Future<Output = Result<Attempt<T>>>,
    {
        self.submit(redirect_loop(candidates, self.redo_count, attempt))
            .await
    }
}

async fn redirect_loop<T, F, Fut>(
    candidates: Vec<NodeId>,
    redo_count: usize,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut(NodeId) -> Fut,
    Fut: Future<Output = Result<Attempt<T>>>,
{
    if candidates.is_empty() {
        return Err(Error::Internal("QP task has no candidate nodes".to_string()));
    }

    let mut cursor = 0usize;
    let mut target = candidates[0].clone();
    for tried in 0..redo_count {
        let hint = match attempt(target.clone()).await {
            Ok(Attempt::Done(value)) => return Ok(value),
            Ok(Attempt::Redirect(hint)) => hint,
            Err(e) if e.is_redirectable() => {
                debug!(node = %target, error = %e, "QP attempt failed, redirecting");
                match e {
                    Error::NotLeader { leader, .. } => leader,
                    _ => None,
                }
            }
            Err(e) => return Err(e),
        };
        if tried + 1 == redo_count {
            break;
        }

        target = match hint {
            Some(leader) if leader != target => leader,
            _ => {
                cursor = (cursor + 1) % candidates.len();
                candidates[cursor].clone()
            }
        };
        debug!(attempt = tried + 1, next = %target, "Redirecting QP task");
        tokio::time::sleep(backoff(tried)).await;
    }

    warn!(attempts = redo_count, "QP task redirect budget exhausted");
    Err(Error::RedirectExhausted {
        attempts: redo_count,
    })
}

fn backoff(attempt: usize) -> Duration {
    let delay = BACKOFF_BASE_MS.saturating_mul(2_u64.saturating_pow(attempt as u32));
    let jitter = rand::random::<u64>() % BACKOFF_BASE_MS;
    Duration::from_millis(delay.min(BACKOFF_MAX_MS) + jitter)
}
