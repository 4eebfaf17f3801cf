//! Byte-stream transport abstraction.
//!
//! The session only needs an async duplex byte stream. [`TcpConnector`]
//! covers the plain-TCP case; TLS and anything more exotic plugs in through
//! [`Connector`], which receives the session's opaque `transport_opts`.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Hard ceiling on transport connection establishment.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub trait FixTransport: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> FixTransport for T {}

impl std::fmt::Debug for dyn FixTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn FixTransport")
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        opts: &HashMap<String, serde_json::Value>,
    ) -> io::Result<Box<dyn FixTransport>>;
}

/// Plain TCP with `TCP_NODELAY`, bounded by [`CONNECT_TIMEOUT`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        _opts: &HashMap<String, serde_json::Value>,
    ) -> io::Result<Box<dyn FixTransport>> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {host}:{port} timed out"),
                )
            })??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
