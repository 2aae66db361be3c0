//! Reactor-side event handling.
//!
//! Runs only on the reactor thread. Listener readiness is handled inline by
//! accepting every pending connection; client readiness becomes a task for
//! the worker pool. A client is disarmed before its task is queued, so at
//! most one task per connection is ever in flight.

use crate::runtime::{ConnectionTable, SubmitError, Task, TaskHandler, WorkerPool};
use mio::event::Event;
use mio::net::TcpListener;
use mio::Token;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use tracing::{debug, error, info, warn};

pub const LISTENER_TOKEN: Token = Token(usize::MAX);
pub const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Create a non-blocking TCP listener bound to `addr`.
pub fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

    let listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(listener))
}

/// Accept until the listener would block.
///
/// Returns the number of connections registered.
pub fn accept_connections(listener: &TcpListener, connections: &ConnectionTable) -> usize {
    let mut accepted = 0;
    loop {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                let fd = stream.as_raw_fd();
                match connections.insert(stream) {
                    Ok(token) => {
                        accepted += 1;
                        info!(
                            fd,
                            token = token.0,
                            peer = %peer_addr,
                            active_connections = connections.active(),
                            "New connection accepted"
                        );
                    }
                    Err(e) => {
                        warn!(
                            fd,
                            peer = %peer_addr,
                            max_connections = connections.capacity(),
                            error = %e,
                            "Rejecting connection"
                        );
                    }
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                break;
            }
        }
    }
    accepted
}

/// Hand a ready client connection to the worker pool.
///
/// A connection that cannot be queued is closed on the spot.
pub fn dispatch_client<H: TaskHandler>(
    token: Token,
    event: &Event,
    connections: &ConnectionTable,
    workers: &WorkerPool<H>,
) {
    if !(event.is_readable() || event.is_read_closed() || event.is_error()) {
        return;
    }

    if let Err(e) = connections.disarm(token) {
        debug!(token = token.0, error = %e, "Failed to disarm connection");
        connections.close(token);
        return;
    }

    match workers.submit(Task::echo(token)) {
        Ok(()) => {}
        Err(SubmitError::Full) => {
            warn!(token = token.0, queued = workers.queued(), "Task queue full, closing connection");
            connections.close(token);
        }
        Err(SubmitError::ShuttingDown) => {
            debug!(token = token.0, "Worker pool shutting down, closing connection");
            connections.close(token);
        }
    }
}
