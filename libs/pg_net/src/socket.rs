//! TCP connect and socket options (spec §4.2 "Socket & TLS Session").
//!
//! Readiness in the source is a manual `poll()` loop around a non-blocking
//! fd; under `tokio` the same per-operation timeout budget is expressed as
//! `tokio::time::timeout` wrapping the async call, so [`ready`] here is just
//! that wrapper plus the error mapping the rest of this crate expects.

use std::time::Duration;

use pg_util::CoreError;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

#[derive(Debug, Clone, Copy)]
pub struct KeepaliveConfig {
    pub idle: Duration,
    pub interval: Duration,
    pub count: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct SocketOptions {
    pub connect_timeout: Duration,
    pub keepalive: Option<KeepaliveConfig>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(60),
            keepalive: None,
        }
    }
}

/// Await `fut`, translating a timeout into a [`CoreError::Protocol`] the way
/// a fatal `ready()` failure would surface in the source.
pub async fn ready<F, T>(fut: F, timeout: Duration, what: &'static str) -> Result<T, CoreError>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(CoreError::io(what, "<socket>", e)),
        Err(_) => Err(CoreError::Protocol(format!("{what} timed out after {timeout:?}"))),
    }
}

/// One connect attempt (per open); outer retry lives in the HTTP client.
pub async fn connect(host: &str, port: u16, opts: &SocketOptions) -> Result<TcpStream, CoreError> {
    let addr = format!("{host}:{port}");
    let stream = ready(TcpStream::connect(addr), opts.connect_timeout, "connect").await?;

    stream
        .set_nodelay(true)
        .map_err(|e| CoreError::io("setsockopt(TCP_NODELAY)", host.to_string(), e))?;

    if let Some(ka) = opts.keepalive {
        let sock_ref = SockRef::from(&stream);
        let keepalive = TcpKeepalive::new()
            .with_time(ka.idle)
            .with_interval(ka.interval);
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let keepalive = keepalive.with_retries(ka.count);
        sock_ref
            .set_tcp_keepalive(&keepalive)
            .map_err(|e| CoreError::io("setsockopt(SO_KEEPALIVE)", host.to_string(), e))?;
    }

    Ok(stream)
}
