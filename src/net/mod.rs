//! Everything between a socket and a group: framing, per-connection I/O,
//! the accept loop and TLS setup.

pub mod codec;
pub mod connection;
pub mod server;
pub mod tls;
