//! Echo server lifecycle.
//!
//! `Server::start` builds every resource the server needs, in order:
//! listening socket, poll instance, listener and waker registrations, block
//! pool, worker pool. If any step fails, whatever was already built is
//! dropped in reverse order and the server never reaches `Running`.
//!
//! `Server::run` drives the reactor until a [`ShutdownHandle`] asks it to
//! stop, then tears everything down and reports what was left open.

use crate::config::Config;
use crate::protocols::echo::EchoService;
use crate::runtime::reactor::{self, LISTENER_TOKEN, WAKER_TOKEN};
use crate::runtime::{BlockPool, ConnectionTable, PoolError, WorkerPool};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Waker};
use std::io;
use std::net::{AddrParseError, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Lifecycle of a server instance. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Running,
    Stopping,
    Destroyed,
}

/// Errors that prevent the server from starting or keep it from running.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid listen address '{addr}': {source}")]
    Addr {
        addr: String,
        #[source]
        source: AddrParseError,
    },
    #[error("failed to create server socket on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to create poll instance: {0}")]
    Poll(#[source] io::Error),
    #[error("failed to register {what} with poll: {source}")]
    Register {
        what: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("failed to create block pool: {0}")]
    BlockPool(#[from] PoolError),
    #[error("failed to create worker pool: {0}")]
    Workers(#[source] io::Error),
    #[error("readiness wait failed: {0}")]
    Wait(#[source] io::Error),
}

/// Cloneable trigger that stops a running server.
#[derive(Clone)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Ask the server to stop. Safe to call any number of times.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Shutdown requested");
        }
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake reactor");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// What teardown found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub state: ServerState,
    /// Connections still open when the reactor stopped.
    pub connections_closed: usize,
    /// Blocks still checked out after the workers were joined.
    pub blocks_in_use: usize,
}

/// Reactor thread state plus the pools it feeds.
pub struct Server {
    poll: Poll,
    listener: TcpListener,
    connections: Arc<ConnectionTable>,
    blocks: Arc<BlockPool>,
    workers: WorkerPool<EchoService>,
    shutdown: ShutdownHandle,
    local_addr: SocketAddr,
    poll_timeout: Duration,
    max_events: usize,
    state: ServerState,
}

impl Server {
    /// Build every resource and enter the `Running` state.
    pub fn start(config: &Config) -> Result<Self, ServerError> {
        let listen = config.listen_addr();
        let addr: SocketAddr = listen.parse().map_err(|source| ServerError::Addr {
            addr: listen.clone(),
            source,
        })?;

        let mut listener = reactor::create_listener(addr, config.backlog)
            .map_err(|source| ServerError::Listen { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Listen { addr, source })?;
        info!(addr = %local_addr, backlog = config.backlog, "Server socket listening");

        let poll = Poll::new().map_err(ServerError::Poll)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(|source| ServerError::Register {
                what: "listener",
                source,
            })?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(|source| {
            ServerError::Register {
                what: "waker",
                source,
            }
        })?;

        let registry = poll.registry().try_clone().map_err(ServerError::Poll)?;
        let connections = Arc::new(ConnectionTable::new(registry, config.max_connections));
        let blocks = Arc::new(BlockPool::new(config.block_size, config.pool_capacity)?);

        let service = Arc::new(EchoService::new(
            Arc::clone(&connections),
            Arc::clone(&blocks),
            config.send_timeout,
            config.max_reads_per_event,
        ));
        let workers = WorkerPool::new(config.workers, config.queue_capacity, service)
            .map_err(ServerError::Workers)?;

        let mut server = Self {
            poll,
            listener,
            connections,
            blocks,
            workers,
            shutdown: ShutdownHandle {
                running: Arc::new(AtomicBool::new(true)),
                waker: Arc::new(waker),
            },
            local_addr,
            poll_timeout: config.poll_timeout,
            max_events: config.max_events,
            state: ServerState::Created,
        };
        server.transition(ServerState::Running);

        info!(
            addr = %local_addr,
            workers = server.workers.worker_count(),
            queue_capacity = config.queue_capacity,
            block_size = server.blocks.block_size(),
            pool_capacity = server.blocks.capacity(),
            "Server is running"
        );
        Ok(server)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[cfg(test)]
    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Shared handle to the block pool, for inspecting it from outside.
    #[cfg(test)]
    pub fn block_pool(&self) -> Arc<BlockPool> {
        Arc::clone(&self.blocks)
    }

    /// Run the reactor until shutdown is requested, then tear down.
    pub fn run(mut self) -> Result<ShutdownReport, ServerError> {
        let mut events = Events::with_capacity(self.max_events);
        let mut outcome = Ok(());

        while self.shutdown.is_running() {
            if let Err(e) = self.poll.poll(&mut events, Some(self.poll_timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "Failed to wait for events");
                outcome = Err(ServerError::Wait(e));
                break;
            }

            for event in events.iter() {
                if !self.shutdown.is_running() {
                    break;
                }
                match event.token() {
                    LISTENER_TOKEN => {
                        reactor::accept_connections(&self.listener, &self.connections);
                    }
                    WAKER_TOKEN => {}
                    token => {
                        reactor::dispatch_client(token, event, &self.connections, &self.workers)
                    }
                }
            }
        }

        let report = self.teardown();
        outcome.map(|()| report)
    }

    fn teardown(mut self) -> ShutdownReport {
        self.transition(ServerState::Stopping);
        info!("Server is shutting down");

        if let Err(e) = self.poll.registry().deregister(&mut self.listener) {
            debug!(error = %e, "Failed to deregister listener");
        }

        // In-flight tasks finish before any connection is force-closed.
        self.workers.shutdown();
        let connections_closed = self.connections.close_all();
        let blocks_in_use = self.blocks.in_use();
        debug!(
            blocks_available = self.blocks.available(),
            blocks_in_use, "Block pool after drain"
        );
        self.transition(ServerState::Destroyed);

        let Server {
            poll,
            listener,
            connections,
            blocks,
            workers,
            ..
        } = self;
        // The echo service holds the other references to the pools.
        drop(workers);
        match Arc::try_unwrap(blocks) {
            Ok(pool) => pool.destroy(),
            Err(_) => debug!("Block pool still referenced, freeing on last release"),
        }
        drop(connections);
        drop(poll);
        drop(listener);

        info!(connections_closed, blocks_in_use, "Server shutdown complete");
        ShutdownReport {
            state: ServerState::Destroyed,
            connections_closed,
            blocks_in_use,
        }
    }

    fn transition(&mut self, next: ServerState) {
        debug!(from = ?self.state, to = ?next, "Server state change");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{Shutdown, TcpStream};
    use std::thread::{self, JoinHandle};

    struct Running {
        addr: SocketAddr,
        handle: ShutdownHandle,
        blocks: Arc<BlockPool>,
        thread: JoinHandle<Result<ShutdownReport, ServerError>>,
    }

    impl Running {
        fn stop(self) -> ShutdownReport {
            self.handle.shutdown();
            self.thread.join().unwrap().unwrap()
        }
    }

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            backlog: 64,
            max_connections: 64,
            poll_timeout: Duration::from_millis(50),
            max_events: 64,
            send_timeout: Duration::from_secs(1),
            max_reads_per_event: 16,
            workers: 4,
            queue_capacity: 64,
            block_size: 64,
            pool_capacity: 16,
            log_level: "debug".to_string(),
        }
    }

    fn spawn(config: Config) -> Running {
        let server = Server::start(&config).unwrap();
        assert_eq!(server.state(), ServerState::Running);
        let addr = server.local_addr();
        let handle = server.shutdown_handle();
        let blocks = server.block_pool();
        let thread = thread::spawn(move || server.run());
        Running {
            addr,
            handle,
            blocks,
            thread,
        }
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn echo(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
        stream.write_all(payload).unwrap();
        let mut buf = vec![0u8; payload.len()];
        stream.read_exact(&mut buf).unwrap();
        buf
    }

    fn assert_closed_without_echo(stream: &mut TcpStream) {
        let mut buf = [0u8; 64];
        match stream.read(&mut buf) {
            Ok(n) => assert_eq!(n, 0, "expected close, got {n} bytes"),
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
        }
    }

    #[test]
    fn test_echo_single_byte() {
        let server = spawn(test_config());
        let mut client = connect(server.addr);
        assert_eq!(echo(&mut client, b"x"), b"x");
        drop(client);
        server.stop();
    }

    #[test]
    fn test_echo_at_block_size_boundary() {
        let config = test_config();
        let block_size = config.block_size;
        let server = spawn(config);
        let mut client = connect(server.addr);

        for len in [block_size - 1, block_size, block_size + 1, block_size * 5 + 3] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            assert_eq!(echo(&mut client, &payload), payload, "length {len}");
        }
        drop(client);
        server.stop();
    }

    #[test]
    fn test_empty_send_is_disconnect() {
        let server = spawn(test_config());
        let mut client = connect(server.addr);
        client.shutdown(Shutdown::Write).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
        server.stop();
    }

    #[test]
    fn test_concurrent_clients() {
        let server = spawn(test_config());
        let addr = server.addr;

        let clients: Vec<_> = (0..8)
            .map(|id| {
                thread::spawn(move || {
                    let mut client = connect(addr);
                    for round in 0..20 {
                        let payload = format!("client-{id}-round-{round}");
                        assert_eq!(echo(&mut client, payload.as_bytes()), payload.as_bytes());
                    }
                })
            })
            .collect();

        for client in clients {
            client.join().unwrap();
        }
        let report = server.stop();
        assert_eq!(report.blocks_in_use, 0);
    }

    #[test]
    fn test_exhausted_pool_sheds_connection() {
        let config = Config {
            pool_capacity: 2,
            ..test_config()
        };
        let server = spawn(config);

        // N + 1 concurrent requests against N blocks, made deterministic by
        // holding all N here: the extra request is shed without an echo and
        // the server serves again once the blocks come back.
        let held = [
            server.blocks.acquire().unwrap(),
            server.blocks.acquire().unwrap(),
        ];
        let mut shed = connect(server.addr);
        shed.write_all(b"no room").unwrap();
        assert_closed_without_echo(&mut shed);

        for block in held {
            server.blocks.release(block);
        }
        let mut served = connect(server.addr);
        assert_eq!(echo(&mut served, b"room now"), b"room now");

        drop(served);
        let report = server.stop();
        assert_eq!(report.blocks_in_use, 0);
    }

    #[test]
    fn test_shutdown_drains_cleanly() {
        let server = spawn(test_config());
        let addr = server.addr;
        let blocks = Arc::clone(&server.blocks);

        let mut client = connect(addr);
        assert_eq!(echo(&mut client, b"before shutdown"), b"before shutdown");

        let handle = server.handle.clone();
        let report = server.stop();
        // A second request is a no-op.
        handle.shutdown();
        assert!(!handle.is_running());

        assert_eq!(report.state, ServerState::Destroyed);
        assert_eq!(report.connections_closed, 1);
        assert_eq!(report.blocks_in_use, 0);
        assert_eq!(blocks.available(), blocks.capacity());

        // The open connection was closed and the listener is gone.
        let mut buf = [0u8; 8];
        assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));
        assert!(TcpStream::connect(addr).is_err());
    }

    #[test]
    fn test_start_fails_on_bad_address() {
        let config = Config {
            host: "not an address".to_string(),
            ..test_config()
        };
        assert!(matches!(
            Server::start(&config),
            Err(ServerError::Addr { .. })
        ));
    }

    #[test]
    fn test_start_fails_when_port_taken() {
        let first = Server::start(&test_config()).unwrap();
        let config = Config {
            port: first.local_addr().port(),
            ..test_config()
        };
        // The first listener holds the port without SO_REUSEPORT.
        assert!(matches!(
            Server::start(&config),
            Err(ServerError::Listen { .. })
        ));
        first.shutdown_handle().shutdown();
        first.run().unwrap();
    }

    #[test]
    fn test_start_fails_on_zero_workers() {
        let config = Config {
            workers: 0,
            ..test_config()
        };
        assert!(matches!(
            Server::start(&config),
            Err(ServerError::Workers(_))
        ));
    }
}
