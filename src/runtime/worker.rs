//! Fixed-size pool of worker threads draining the task queue.

use crate::runtime::task::{SubmitError, Task, TaskQueue};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace};

/// Executes tasks on a worker thread.
///
/// A panic inside `handle` is caught and the worker moves on to the next
/// task. Implementations hand back anything a task holds from a drop guard,
/// or it is lost to the unwind.
pub trait TaskHandler: Send + Sync + 'static {
    fn handle(&self, task: Task);
}

/// Owns the worker threads and the queue feeding them.
pub struct WorkerPool<H: TaskHandler> {
    queue: Arc<TaskQueue>,
    handles: Vec<JoinHandle<()>>,
    handler: Arc<H>,
}

impl<H: TaskHandler> WorkerPool<H> {
    /// Start `workers` threads consuming a queue of `queue_capacity` tasks.
    ///
    /// If a thread fails to spawn, the threads already running are shut down
    /// and joined before the error is returned.
    pub fn new(workers: usize, queue_capacity: usize, handler: Arc<H>) -> io::Result<Self> {
        if workers == 0 || queue_capacity == 0 {
            error!(workers, queue_capacity, "Invalid thread count or queue size");
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "worker count and queue capacity must be greater than zero",
            ));
        }

        let mut pool = Self {
            queue: Arc::new(TaskQueue::new(queue_capacity)),
            handles: Vec::with_capacity(workers),
            handler,
        };

        for worker_id in 0..workers {
            let queue = Arc::clone(&pool.queue);
            let handler = Arc::clone(&pool.handler);

            let spawned = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, &queue, &*handler));

            match spawned {
                Ok(handle) => pool.handles.push(handle),
                Err(e) => {
                    error!(worker = worker_id, error = %e, "Failed to create worker thread");
                    pool.shutdown();
                    return Err(e);
                }
            }
        }

        info!(workers, queue_capacity, "Worker pool created");
        Ok(pool)
    }

    /// Queue a task without blocking.
    pub fn submit(&self, task: Task) -> Result<(), SubmitError> {
        self.queue.try_push(task)?;
        trace!(token = task.token.0, queued = self.queue.len(), "Task queued");
        Ok(())
    }

    /// Stop accepting tasks, let the workers drain the queue, join them.
    ///
    /// Calling this again after the threads are joined does nothing.
    pub fn shutdown(&mut self) {
        self.queue.shutdown();

        if self.handles.is_empty() {
            return;
        }
        for (worker_id, handle) in self.handles.drain(..).enumerate() {
            if handle.join().is_err() {
                error!(worker = worker_id, "Failed to join worker thread");
            }
        }
        debug_assert!(self.queue.is_empty(), "workers exited with tasks queued");
        info!("Worker pool destroyed");
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

impl<H: TaskHandler> Drop for WorkerPool<H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<H: TaskHandler>(worker_id: usize, queue: &TaskQueue, handler: &H) {
    while let Some(task) = queue.wait_pop() {
        debug!(worker = worker_id, token = task.token.0, kind = ?task.kind, "Worker processing task");

        // A panicking task must not take the worker down with it.
        let result = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(task)));
        if result.is_err() {
            error!(worker = worker_id, token = task.token.0, "Worker task failed");
        }
    }
    info!(worker = worker_id, "Worker thread exiting");
}
