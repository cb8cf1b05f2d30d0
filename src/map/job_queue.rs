//! Main-thread job queue.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Collects short jobs from any thread and runs them at the start of the next update on the
/// main thread. After [`JobQueue::stop`], jobs run immediately on the adding thread.
#[derive(Default)]
pub struct JobQueue {
    jobs: Mutex<Vec<Job>>,
    stopped: AtomicBool,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, job: impl FnOnce() + Send + 'static) {
        if self.stopped.load(Ordering::Acquire) {
            job();
            return;
        }

        self.jobs.lock().push(Box::new(job));
    }

    /// Runs the collected jobs. Must only be called from the main thread.
    pub fn run_jobs(&self) {
        let jobs: Vec<Job> = std::mem::take(&mut *self.jobs.lock());
        for job in jobs {
            job();
        }
    }

    /// Runs the remaining jobs and makes subsequent jobs run inline.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.run_jobs();
    }
}
