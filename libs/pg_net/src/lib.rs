//! Socket, TLS session, and HTTP/1.1 client with AWS SigV4 / Azure Shared
//! Key request signing (spec §4.2, §4.3, §6).

pub mod connection;
pub mod http;
pub mod socket;
pub mod tls;

pub use connection::Connection;
pub use socket::{KeepaliveConfig, SocketOptions};
