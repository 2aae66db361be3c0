//! Registry of open client connections shared by the reactor and workers.
//!
//! A connection has no protocol state. The table only maps its token to the
//! socket, and owns the readiness registrations made for it. The active
//! connection count has its own lock, separate from the slab.

use mio::net::TcpStream;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;
use slab::Slab;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use tracing::{debug, warn};

/// Shared handle to the reactor's registrations and open sockets.
pub struct ConnectionTable {
    registry: Registry,
    streams: Mutex<Slab<Arc<TcpStream>>>,
    active: Mutex<usize>,
    max_connections: usize,
}

impl ConnectionTable {
    pub fn new(registry: Registry, max_connections: usize) -> Self {
        Self {
            registry,
            streams: Mutex::new(Slab::with_capacity(max_connections)),
            active: Mutex::new(0),
            max_connections,
        }
    }

    /// Take ownership of an accepted stream and register it for
    /// edge-triggered readable events.
    ///
    /// On failure the stream is dropped, which closes the socket.
    pub fn insert(&self, stream: TcpStream) -> io::Result<Token> {
        let fd = stream.as_raw_fd();
        let stream = Arc::new(stream);

        let token = {
            let mut streams = self.streams.lock();
            if streams.len() >= self.max_connections {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "connection limit reached",
                ));
            }
            Token(streams.insert(Arc::clone(&stream)))
        };

        if let Err(e) = self.arm(fd, token) {
            self.streams.lock().try_remove(token.0);
            return Err(e);
        }

        *self.active.lock() += 1;
        Ok(token)
    }

    /// Look up the socket for a token.
    pub fn get(&self, token: Token) -> Option<Arc<TcpStream>> {
        self.streams.lock().get(token.0).cloned()
    }

    /// Stop readiness delivery for a connection while a task owns it.
    pub fn disarm(&self, token: Token) -> io::Result<()> {
        let stream = self
            .get(token)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;
        self.registry.deregister(&mut SourceFd(&stream.as_raw_fd()))
    }

    /// Restore readiness delivery after a task completes.
    ///
    /// Registering reports readiness that is already pending, so bytes that
    /// arrived after the last would-block still produce an event.
    pub fn rearm(&self, token: Token) -> io::Result<()> {
        let stream = self
            .get(token)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;
        self.arm(stream.as_raw_fd(), token)
    }

    /// Unregister, close and forget a connection.
    ///
    /// Returns `false` if the token was not open. The socket itself closes
    /// once the last in-flight reference to it is dropped.
    pub fn close(&self, token: Token) -> bool {
        let stream = match self.streams.lock().try_remove(token.0) {
            Some(stream) => stream,
            None => return false,
        };

        let fd = stream.as_raw_fd();
        // Already gone while a task held the connection.
        if let Err(e) = self.registry.deregister(&mut SourceFd(&fd)) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(fd, error = %e, "Failed to remove connection from poll");
            }
        }

        let active = {
            let mut active = self.active.lock();
            *active = active.saturating_sub(1);
            *active
        };
        debug!(fd, token = token.0, active_connections = active, "Connection closed");
        true
    }

    /// Close every remaining connection. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let tokens: Vec<Token> = self
            .streams
            .lock()
            .iter()
            .map(|(key, _)| Token(key))
            .collect();
        tokens.into_iter().filter(|&token| self.close(token)).count()
    }

    /// Number of open connections.
    pub fn active(&self) -> usize {
        *self.active.lock()
    }

    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    fn arm(&self, fd: RawFd, token: Token) -> io::Result<()> {
        self.registry
            .register(&mut SourceFd(&fd), token, Interest::READABLE)
    }
}
