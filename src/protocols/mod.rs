//! Task handlers run by the worker pool.
//!
//! - `echo`: write every received byte back to the sender

pub mod echo;
