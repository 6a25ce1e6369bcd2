//! This module exports a minimal message-passing API, which is encapsulated
//! by a `Communicator` trait. Implementors only need to write non-blocking
//! `send` and timed `recv_timeout` operations for a given transport layer.
//! Two transports are included: in-process channels, where each rank is a
//! thread, and a pure-Rust TCP transport for ranks in separate processes.
//!

mod backoff;
pub mod comm;
pub mod local;
pub mod tcp;
pub mod util;

pub use comm::Communicator;
pub use local::LocalCommunicator;
pub use tcp::{TcpCommunicator, TcpHost};

/// Index of a process within a communicator.
pub type Rank = usize;
