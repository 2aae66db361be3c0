//! Raw echo service.
//!
//! Every byte a client sends is written straight back. There is no framing,
//! no length prefix and no handshake:
//!
//! ```text
//! Client sends:  hello
//! Server sends:  hello
//! ```
//!
//! A client that closes its write side ends the connection. A client that
//! cannot be served (no free buffer, full task queue) is disconnected without
//! any reply.

pub mod handler;

pub use handler::EchoService;
