use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tracing::warn;

use crate::config::ResponseHandlerConfig;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Bounded dispatch of response callbacks off the connection reader tasks.
///
/// At most `max_pool_size` callbacks run concurrently; up to
/// `max_waiting_queue_size` more wait behind them. Past both bounds the
/// callback runs inline on the submitting task, with a warning, so no
/// completion is ever dropped. A panicking callback is caught and logged; it
/// never takes a worker or a reader down with it.
pub struct ResponseExecutor {
    queue: mpsc::Sender<Job>,
    permits: Arc<Semaphore>,
}

impl ResponseExecutor {
    pub fn new(config: ResponseHandlerConfig) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(config.max_pool_size.max(1)));
        let (queue, mut rx) = mpsc::channel::<Job>(config.max_waiting_queue_size.max(1));

        let drain_permits = Arc::clone(&permits);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                // The semaphore is never closed, so acquisition only fails
                // if the executor itself is gone.
                let Ok(permit) = Arc::clone(&drain_permits).acquire_owned().await else {
                    run_job(job);
                    continue;
                };
                tokio::spawn(async move {
                    run_job(job);
                    drop(permit);
                });
            }
        });

        Arc::new(Self { queue, permits })
    }

    /// Runs `job` on the pool, queueing or falling back to inline execution
    /// under saturation. Never blocks.
    pub(crate) fn execute(&self, job: Job) {
        if let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() {
            tokio::spawn(async move {
                run_job(job);
                drop(permit);
            });
            return;
        }

        match self.queue.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) | Err(TrySendError::Closed(job)) => {
                warn!("response executor saturated; running callback inline");
                run_job(job);
            }
        }
    }
}

fn run_job(job: Job) {
    if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        warn!("response callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn executor(max_pool: usize, queue: usize) -> Arc<ResponseExecutor> {
        ResponseExecutor::new(ResponseHandlerConfig {
            core_pool_size: 1,
            max_pool_size: max_pool,
            keep_alive_time_ms: 1000,
            max_waiting_queue_size: queue,
        })
    }

    #[tokio::test]
    async fn test_jobs_run() {
        let executor = executor(4, 16);
        let ran = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let ran = Arc::clone(&ran);
            executor.execute(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while ran.load(Ordering::SeqCst) < 10 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("all jobs should run");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_saturation_runs_inline() {
        let executor = executor(1, 1);
        let (block_tx, block_rx) = std::sync::mpsc::channel::<()>();

        // Occupy the single worker slot
        executor.execute(Box::new(move || {
            let _ = block_rx.recv_timeout(Duration::from_secs(2));
        }));
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Fill the queue, then overflow: the overflow job must complete on
        // this task before execute returns
        let inline_ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let inline_ran = Arc::clone(&inline_ran);
            executor.execute(Box::new(move || {
                inline_ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert!(inline_ran.load(Ordering::SeqCst) >= 1);

        block_tx.send(()).unwrap();
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_kill_workers() {
        let executor = executor(1, 4);
        executor.execute(Box::new(|| panic!("callback exploded")));

        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        executor.execute(Box::new(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        }));

        tokio::time::timeout(Duration::from_secs(2), async {
            while ran.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("executor should survive a panicking callback");
    }
}
