//! Echo task handler for the worker pool.

use crate::runtime::{Block, BlockPool, ConnectionTable, Task, TaskHandler, TaskKind};
use mio::net::TcpStream;
use mio::Token;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, trace};

/// How a drain of the socket ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drain {
    /// The socket has nothing more to read right now.
    WouldBlock,
    /// Read budget spent with data possibly still pending.
    Budget,
    /// The peer closed its write side.
    PeerClosed,
}

/// A block checked out for one task.
///
/// Hands the block back on drop. If the task unwinds, the connection it was
/// serving is closed as well, since it is disarmed and nothing would re-arm it.
struct Checkout<'a> {
    service: &'a EchoService,
    token: Token,
    block: Option<Block>,
}

impl Drop for Checkout<'_> {
    fn drop(&mut self) {
        if let Some(block) = self.block.take() {
            self.service.blocks.release(block);
        }
        if thread::panicking() {
            error!(token = self.token.0, "Echo task unwound, closing connection");
            self.service.connections.close(self.token);
        }
    }
}

/// Worker-side echo service.
pub struct EchoService {
    connections: Arc<ConnectionTable>,
    blocks: Arc<BlockPool>,
    send_timeout: Duration,
    max_reads: usize,
}

impl EchoService {
    pub fn new(
        connections: Arc<ConnectionTable>,
        blocks: Arc<BlockPool>,
        send_timeout: Duration,
        max_reads: usize,
    ) -> Self {
        Self {
            connections,
            blocks,
            send_timeout,
            max_reads: max_reads.max(1),
        }
    }

    fn echo(&self, token: Token) {
        let stream = match self.connections.get(token) {
            Some(stream) => stream,
            None => {
                debug!(token = token.0, "Task for a connection that is already closed");
                return;
            }
        };
        let fd = stream.as_raw_fd();

        let block = match self.blocks.acquire() {
            Some(block) => block,
            None => {
                error!(fd, "Failed to allocate buffer for client");
                self.connections.close(token);
                return;
            }
        };
        trace!(fd, block = block.index(), "Buffer acquired");

        let mut checkout = Checkout {
            service: self,
            token,
            block: Some(block),
        };
        let outcome = match checkout.block.as_deref_mut() {
            Some(buf) => self.drain(&stream, buf),
            None => return,
        };
        // Released before the connection is re-armed or closed.
        drop(checkout);

        match outcome {
            Ok(Drain::WouldBlock) | Ok(Drain::Budget) => {
                if let Err(e) = self.connections.rearm(token) {
                    error!(fd, error = %e, "Failed to re-arm client");
                    self.connections.close(token);
                }
            }
            Ok(Drain::PeerClosed) => {
                info!(fd, "Client disconnected");
                self.connections.close(token);
            }
            Err(e) => {
                error!(fd, error = %e, "Client I/O failed");
                self.connections.close(token);
            }
        }
    }

    /// Read until the socket would block, writing each chunk back before the
    /// next read. Edge-triggered readiness will not fire again for bytes
    /// left unread.
    fn drain(&self, stream: &TcpStream, buf: &mut [u8]) -> io::Result<Drain> {
        let mut reader = stream;
        let mut reads = 0;
        while reads < self.max_reads {
            let n = match reader.read(buf) {
                Ok(0) => return Ok(Drain::PeerClosed),
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Drain::WouldBlock)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            reads += 1;
            trace!(fd = stream.as_raw_fd(), bytes = n, "Received from client");

            send_all(stream, &buf[..n], self.send_timeout)?;
            trace!(fd = stream.as_raw_fd(), bytes = n, "Sent to client");
        }
        Ok(Drain::Budget)
    }
}

impl TaskHandler for EchoService {
    fn handle(&self, task: Task) {
        match task.kind {
            TaskKind::Echo => self.echo(task.token),
        }
    }
}

/// Write all of `data`, waiting up to `timeout` whenever the socket's send
/// buffer is full.
fn send_all(stream: &TcpStream, mut data: &[u8], timeout: Duration) -> io::Result<()> {
    let mut writer = stream;
    while !data.is_empty() {
        match writer.write(data) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
            Ok(n) => data = &data[n..],
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                if !wait_writable(stream.as_raw_fd(), timeout)? {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "peer stopped reading",
                    ));
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Block until `fd` is writable. Returns `false` on timeout.
fn wait_writable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);

    loop {
        // SAFETY: `pollfd` is a valid, exclusively borrowed pollfd and nfds is 1.
        let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        match rc {
            0 => return Ok(false),
            n if n > 0 => return Ok(true),
            _ => {
                let e = io::Error::last_os_error();
                if e.kind() != io::ErrorKind::Interrupted {
                    return Err(e);
                }
            }
        }
    }
}
