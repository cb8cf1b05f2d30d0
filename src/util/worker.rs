//! Background task execution: an ordered single worker and a multi-worker pool.

use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// A single background worker with a FIFO task queue.
///
/// Tasks execute in enqueue order, one at a time. Dropping the worker lets the queued tasks run
/// to completion and joins the thread. Tasks enqueued after [`AsyncWorker::stop`] run inline on
/// the calling thread.
pub struct AsyncWorker {
    sender: Mutex<Option<Sender<Task>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncWorker {
    pub fn new(name: &str) -> Self {
        let (sender, receiver) = unbounded::<Task>();
        let handle = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                while let Ok(task) = receiver.recv() {
                    task();
                }
            })
            .expect("failed to spawn worker thread");

        Self {
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn enqueue(&self, task: impl FnOnce() + Send + 'static) {
        let sender = self.sender.lock();
        match &*sender {
            Some(channel) => {
                if let Err(err) = channel.send(Box::new(task)) {
                    drop(sender);
                    (err.0)();
                }
            }
            None => {
                drop(sender);
                task();
            }
        }
    }

    /// Finishes the queued tasks and joins the worker thread.
    pub fn stop(&self) {
        *self.sender.lock() = None;
        if let Some(handle) = self.handle.lock().take() {
            // The last reference can be dropped from a task running on the worker itself; the
            // thread then just drains and exits detached.
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                log::error!("Worker thread panicked");
            }
        }
    }
}

impl Drop for AsyncWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A pool of workers drawing tasks from a shared queue. No ordering guarantee.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Task>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(worker_count: usize, name: &str) -> Self {
        let (sender, receiver) = unbounded::<Task>();

        let mut handles = Vec::with_capacity(worker_count);
        for index in 0..worker_count.max(1) {
            let receiver = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || {
                    while let Ok(task) = receiver.recv() {
                        task();
                    }
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Self {
            sender: Mutex::new(Some(sender)),
            handles: Mutex::new(handles),
        }
    }

    pub fn enqueue(&self, task: impl FnOnce() + Send + 'static) {
        let sender = self.sender.lock();
        match &*sender {
            Some(channel) => {
                if let Err(err) = channel.send(Box::new(task)) {
                    drop(sender);
                    (err.0)();
                }
            }
            None => {
                drop(sender);
                task();
            }
        }
    }

    pub fn stop(&self) {
        *self.sender.lock() = None;
        for handle in self.handles.lock().drain(..) {
            if handle.thread().id() == std::thread::current().id() {
                continue;
            }
            if handle.join().is_err() {
                log::error!("Worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}
