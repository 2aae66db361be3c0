//! Work items handed from the reactor to the worker pool.
//!
//! The queue is a fixed-capacity ring buffer guarded by one mutex and one
//! condition variable. Producers never wait: a full queue is reported back to
//! the caller, which sheds the connection.

use mio::Token;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// What a worker should do with a ready connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Drain the socket and write every byte back.
    Echo,
}

/// One unit of reactor-dispatched work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Task {
    /// Connection the task operates on.
    pub token: Token,
    pub kind: TaskKind,
}

impl Task {
    pub fn echo(token: Token) -> Self {
        Self {
            token,
            kind: TaskKind::Echo,
        }
    }
}

/// Why a task could not be queued.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("task queue is full")]
    Full,
    #[error("worker pool is shutting down")]
    ShuttingDown,
}

struct Ring {
    slots: Box<[Option<Task>]>,
    front: usize,
    rear: usize,
    count: usize,
    shutdown: bool,
}

/// Bounded FIFO queue of tasks.
pub struct TaskQueue {
    ring: Mutex<Ring>,
    ready: Condvar,
    capacity: usize,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(Ring {
                slots: vec![None; capacity].into_boxed_slice(),
                front: 0,
                rear: 0,
                count: 0,
                shutdown: false,
            }),
            ready: Condvar::new(),
            capacity,
        }
    }

    /// Enqueue a task without blocking.
    pub fn try_push(&self, task: Task) -> Result<(), SubmitError> {
        let mut ring = self.ring.lock();
        if ring.shutdown {
            return Err(SubmitError::ShuttingDown);
        }
        if ring.count >= self.capacity {
            return Err(SubmitError::Full);
        }

        let rear = ring.rear;
        ring.slots[rear] = Some(task);
        ring.rear = (rear + 1) % self.capacity;
        ring.count += 1;
        drop(ring);

        self.ready.notify_one();
        Ok(())
    }

    /// Block until a task is available.
    ///
    /// Returns `None` once the queue has been shut down and fully drained.
    pub fn wait_pop(&self) -> Option<Task> {
        let mut ring = self.ring.lock();
        while ring.count == 0 && !ring.shutdown {
            self.ready.wait(&mut ring);
        }
        if ring.count == 0 {
            return None;
        }

        let front = ring.front;
        let task = ring.slots[front].take();
        ring.front = (front + 1) % self.capacity;
        ring.count -= 1;
        task
    }

    /// Refuse further submissions and wake every waiting consumer.
    ///
    /// Tasks already queued are still handed out by [`wait_pop`](Self::wait_pop).
    pub fn shutdown(&self) {
        self.ring.lock().shutdown = true;
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.ring.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
