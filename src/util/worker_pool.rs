use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A fixed number of worker tasks pulling jobs from a shared queue, i.e. at most `num_workers`
///  jobs of a pool are running at any given time regardless of how many are submitted.
///
/// The queue is unbounded: jobs may submit follow-up jobs to their own pool without risking a
///  deadlock.
pub struct WorkerPool {
    name: &'static str,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: &'static str, num_workers: usize, runtime: &Handle) -> WorkerPool {
        let (sender, receiver) = mpsc::unbounded_channel::<Job>();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let workers = (0..num_workers)
            .map(|index| runtime.spawn(Self::run_worker(name, index, receiver.clone(), runtime.clone())))
            .collect();

        debug!(pool = name, num_workers, "started worker pool");

        WorkerPool {
            name,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    async fn run_worker(name: &'static str, index: usize, receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>, runtime: Handle) {
        loop {
            let job = receiver.lock().await
                .recv().await;

            match job {
                Some(job) => {
                    // running the job as a separate task contains panics to that job
                    if let Err(e) = runtime.spawn(job).await {
                        error!(pool = name, worker = index, "job terminated abnormally: {}", e);
                    }
                }
                None => {
                    trace!(pool = name, worker = index, "job queue closed, stopping worker");
                    break;
                }
            }
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns `false` if the pool was shut down and the job was discarded
    pub fn submit(&self, job: impl Future<Output = ()> + Send + 'static) -> bool {
        let sender = self.sender.lock()
            .unwrap_or_else(PoisonError::into_inner);

        match sender.as_ref() {
            Some(sender) => {
                if sender.send(Box::pin(job)).is_err() {
                    debug!(pool = self.name, "submitting job to a pool without workers - discarding");
                    return false;
                }
                true
            }
            None => {
                debug!(pool = self.name, "submitting job to a pool that is shut down - discarding");
                false
            }
        }
    }

    /// Closes the job queue: jobs that were submitted before are still processed, but new jobs
    ///  are rejected. Workers terminate once the queue is drained.
    pub fn shutdown(&self) {
        if self.sender.lock().unwrap_or_else(PoisonError::into_inner).take().is_some() {
            debug!(pool = self.name, "shutting down worker pool");
        }
    }

    /// Waits for all workers to terminate after [WorkerPool::shutdown]
    pub async fn join(&self) {
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for worker in workers {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let pool = WorkerPool::new("test", 2, &Handle::current());

        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let running = running.clone();
            let max_running = max_running.clone();
            let done = done.clone();
            assert!(pool.submit(async move {
                let now_running = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_running.fetch_max(now_running, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }

        pool.shutdown();
        pool.join().await;

        assert_eq!(done.load(Ordering::SeqCst), 10);
        assert_eq!(max_running.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown() {
        let pool = WorkerPool::new("test", 1, &Handle::current());
        pool.shutdown();
        assert!(!pool.submit(async {}));
        pool.join().await;
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new("test", 1, &Handle::current());
        let done = Arc::new(AtomicUsize::new(0));

        pool.submit(async { panic!("job failure") });
        let done2 = done.clone();
        pool.submit(async move { done2.fetch_add(1, Ordering::SeqCst); });

        pool.shutdown();
        pool.join().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
