#![warn(missing_docs)]

//! microrpc transport layer: message-oriented sockets, in-memory and TCP transports, and the client connection pool.

pub mod error;
pub mod memory;
pub mod message;
pub mod pool;
pub mod protocol;
pub mod tcp;
pub mod transport;

pub use error::{Result, TransportError};
pub use memory::MemoryTransport;
pub use message::TransportMessage;
pub use pool::{ConnectionPool, PoolConfig, PoolConn, PoolStats};
pub use tcp::{TcpTransport, TcpTransportConfig};
pub use transport::{DialOptions, Listener, Socket, Transport};
