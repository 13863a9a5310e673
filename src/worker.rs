//! Bounded worker pool for CPU-heavy script preprocessing.
//!
//! A fixed set of workers drains a bounded queue; each task runs the
//! preprocessing pass on the blocking thread pool so a multi-megabyte scan
//! never stalls the async runtime. Transient failures (timeout, panic) are
//! retried with a short pause; a malformed payload is permanent and fails
//! immediately.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::ServiceError;
use crate::metrics::Metrics;
use crate::solver::{self, AnalyzerError};

const RETRY_DELAY: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum WorkerError {
    /// Every attempt hit the per-task timeout.
    Timeout { attempts: u32 },
    /// The payload is not a player script; not retried.
    Malformed(String),
    /// Transient failures exhausted the retry budget.
    RetriesExhausted { attempts: u32, last: String },
    /// The pool shut down while the task was queued or running.
    PoolClosed,
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::Timeout { attempts } => {
                write!(f, "preprocessing timed out after {attempts} attempts")
            }
            WorkerError::Malformed(msg) => write!(f, "{msg}"),
            WorkerError::RetriesExhausted { attempts, last } => {
                write!(f, "preprocessing failed after {attempts} attempts: {last}")
            }
            WorkerError::PoolClosed => write!(f, "worker pool is shut down"),
        }
    }
}

impl std::error::Error for WorkerError {}

impl From<WorkerError> for ServiceError {
    fn from(e: WorkerError) -> Self {
        match e {
            WorkerError::Timeout { .. } => {
                ServiceError::internal("WORKER_TIMEOUT", e.to_string())
            }
            WorkerError::Malformed(_) => {
                ServiceError::internal("INVALID_PLAYER_CONTENT", e.to_string())
            }
            WorkerError::RetriesExhausted { .. } => {
                ServiceError::internal("WORKER_FAILED", e.to_string())
            }
            WorkerError::PoolClosed => ServiceError::internal("WORKER_FAILED", e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

struct Task {
    id: u64,
    payload: String,
    submitted_at: Instant,
    respond: oneshot::Sender<Result<String, WorkerError>>,
}

pub struct WorkerPool {
    queue: mpsc::Sender<Task>,
    /// Shared with the workers; held here so the queue stays open for the
    /// pool's whole lifetime even with zero workers.
    _queue_rx: Arc<Mutex<mpsc::Receiver<Task>>>,
    next_id: AtomicU64,
    concurrency: usize,
    metrics: Arc<Metrics>,
}

impl WorkerPool {
    /// Spawn `concurrency` workers sharing one bounded queue.
    pub fn spawn(
        concurrency: usize,
        queue_capacity: usize,
        task_timeout: Duration,
        max_retries: u32,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<Task>(queue_capacity);
        let rx = Arc::new(Mutex::new(rx));

        metrics.workers_idle.set(concurrency as i64);
        metrics.workers_active.set(0);

        for worker_id in 0..concurrency {
            let rx = Arc::clone(&rx);
            let metrics = Arc::clone(&metrics);
            tokio::spawn(async move {
                loop {
                    let task = { rx.lock().await.recv().await };
                    let Some(task) = task else { break };

                    metrics.workers_idle.add(-1);
                    metrics.workers_active.add(1);

                    let started = Instant::now();
                    let queued_for = started.duration_since(task.submitted_at);
                    let (result, attempts) =
                        run_attempts(&task.payload, task_timeout, max_retries).await;
                    let duration = started.elapsed();

                    let status = match &result {
                        Ok(_) => "success",
                        Err(WorkerError::Timeout { .. }) => "timeout",
                        Err(WorkerError::Malformed(_)) => "malformed",
                        Err(_) => "error",
                    };
                    metrics.worker_tasks_total.with(&[status]).inc();
                    metrics.worker_task_duration.observe(duration);
                    tracing::info!(
                        "[pool] worker={} task={} status={} attempts={} queued={:?} ran={:?}",
                        worker_id,
                        task.id,
                        status,
                        attempts,
                        queued_for,
                        duration
                    );

                    // Receiver may be gone if the caller hung up; the result
                    // is simply dropped in that case.
                    let _ = task.respond.send(result);

                    metrics.workers_active.add(-1);
                    metrics.workers_idle.add(1);
                }
            });
        }

        Arc::new(Self {
            queue: tx,
            _queue_rx: rx,
            next_id: AtomicU64::new(1),
            concurrency,
            metrics,
        })
    }

    /// Enqueue a raw script for preprocessing and wait for the result.
    /// Submission fails fast with `QueueFull` when the queue is at capacity.
    pub async fn run(&self, payload: String) -> crate::error::Result<String> {
        let rx = self.submit(payload)?;
        match rx.await {
            Ok(result) => result.map_err(ServiceError::from),
            Err(_) => Err(WorkerError::PoolClosed.into()),
        }
    }

    fn submit(
        &self,
        payload: String,
    ) -> crate::error::Result<oneshot::Receiver<Result<String, WorkerError>>> {
        let (tx, rx) = oneshot::channel();
        let task = Task {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            payload,
            submitted_at: Instant::now(),
            respond: tx,
        };
        self.queue.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                self.metrics
                    .worker_tasks_total
                    .with(&["rejected"])
                    .inc();
                ServiceError::QueueFull
            }
            mpsc::error::TrySendError::Closed(_) => WorkerError::PoolClosed.into(),
        })?;
        Ok(rx)
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }
}

/// Attempt loop: permanent errors return immediately, transient ones burn
/// through the attempt budget with a pause in between.
async fn run_attempts(
    payload: &str,
    task_timeout: Duration,
    max_retries: u32,
) -> (Result<String, WorkerError>, u32) {
    let budget = max_retries.max(1);
    let mut attempt = 0u32;
    let mut last_error = String::new();
    let mut timed_out = false;

    loop {
        attempt += 1;
        let owned = payload.to_string();
        let outcome = tokio::time::timeout(
            task_timeout,
            tokio::task::spawn_blocking(move || solver::preprocess(&owned)),
        )
        .await;

        match outcome {
            Ok(Ok(Ok(preprocessed))) => return (Ok(preprocessed), attempt),
            Ok(Ok(Err(AnalyzerError::Malformed(msg)))) => {
                return (Err(WorkerError::Malformed(msg)), attempt);
            }
            Ok(Ok(Err(other))) => {
                last_error = other.to_string();
                timed_out = false;
            }
            Ok(Err(join_err)) => {
                last_error = format!("preprocessing panicked: {join_err}");
                timed_out = false;
            }
            Err(_) => {
                last_error = format!("attempt exceeded {task_timeout:?}");
                timed_out = true;
            }
        }

        if attempt >= budget {
            let err = if timed_out {
                WorkerError::Timeout { attempts: attempt }
            } else {
                WorkerError::RetriesExhausted {
                    attempts: attempt,
                    last: last_error,
                }
            };
            return (Err(err), attempt);
        }
        tokio::time::sleep(RETRY_DELAY).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_script() -> String {
        r#"
var Wk={c9:function(a){a.reverse()},J2:function(a,b){a.splice(0,b)}};
var dec=function(a){a=a.split("");Wk.J2(a,1);Wk.c9(a,0);return a.join("")};
padding padding padding padding padding padding padding padding padding
"#
        .to_string()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn run_preprocesses_a_valid_script() {
        let pool = WorkerPool::spawn(
            2,
            8,
            Duration::from_secs(10),
            3,
            Metrics::new(),
        );
        let pp = pool.run(fixture_script()).await.unwrap();
        let pair = solver::extract(&pp).unwrap();
        assert!(pair.sig.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn malformed_payload_fails_without_retries() {
        let metrics = Metrics::new();
        let pool = WorkerPool::spawn(
            1,
            8,
            Duration::from_secs(10),
            5,
            Arc::clone(&metrics),
        );
        let started = Instant::now();
        let err = pool.run("tiny".to_string()).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_PLAYER_CONTENT");
        // A permanent error must not burn the retry budget (5 x 100ms delay).
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(metrics.worker_tasks_total.with(&["malformed"]).get(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_submissions_all_complete() {
        let pool = WorkerPool::spawn(
            4,
            32,
            Duration::from_secs(10),
            3,
            Metrics::new(),
        );
        let mut handles = Vec::new();
        for _ in 0..10 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move { pool.run(fixture_script()).await }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn full_queue_rejects_with_typed_error() {
        // No workers drain the queue, so capacity 1 fills after one submit.
        let metrics = Metrics::new();
        let pool = WorkerPool::spawn(0, 1, Duration::from_secs(1), 1, Arc::clone(&metrics));
        let _held = pool.submit(fixture_script()).unwrap();
        let err = pool.submit(fixture_script()).unwrap_err();
        assert!(matches!(err, ServiceError::QueueFull));
        assert_eq!(metrics.worker_tasks_total.with(&["rejected"]).get(), 1);
    }
}
