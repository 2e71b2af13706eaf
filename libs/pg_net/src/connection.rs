//! A plain-TCP-or-TLS byte stream, unified behind one set of methods so the
//! HTTP client doesn't care which transport a session uses.

use pg_util::CoreError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::tls::TlsSession;

pub enum Connection {
    Plain(TcpStream),
    Tls(TlsSession),
}

impl Connection {
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, CoreError> {
        match self {
            Connection::Plain(s) => s.read(buf).await.map_err(|e| CoreError::io("read", "<socket>", e)),
            Connection::Tls(s) => s.read(buf).await,
        }
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), CoreError> {
        match self {
            Connection::Plain(s) => s.write_all(buf).await.map_err(|e| CoreError::io("write", "<socket>", e)),
            Connection::Tls(s) => s.write_all(buf).await,
        }
    }

    pub async fn flush(&mut self) -> Result<(), CoreError> {
        match self {
            Connection::Plain(s) => s.flush().await.map_err(|e| CoreError::io("flush", "<socket>", e)),
            Connection::Tls(s) => s.flush().await,
        }
    }

    pub async fn close(&mut self) -> Result<(), CoreError> {
        match self {
            Connection::Plain(s) => {
                let _ = s.shutdown().await;
                Ok(())
            }
            Connection::Tls(s) => s.close().await,
        }
    }
}
