//! Reactor, worker pool and buffer management for the echo server.
//!
//! Pieces, leaves first:
//! - `BlockPool`: fixed-size buffers shared by the workers
//! - `TaskQueue` / `WorkerPool`: bounded queue drained by worker threads
//! - `ConnectionTable`: token-indexed sockets and their registrations
//! - `reactor`: accept loop and client dispatch on the reactor thread

mod buffer;
mod connection;
pub mod reactor;
mod task;
mod worker;

pub use buffer::{Block, BlockPool, PoolError};
pub use connection::ConnectionTable;
pub use task::{SubmitError, Task, TaskKind};
pub use worker::{TaskHandler, WorkerPool};
