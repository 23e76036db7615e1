//! TCP endpoint: listens and bridges one client at a time

use crate::transport::traits::{TransportConnector, TransportStream};
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tracing::info;

/// TCP stream wrapper implementing TransportStream
pub struct TcpTransportStream {
    inner: TcpStream,
    peer_addr: SocketAddr,
}

impl TcpTransportStream {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            inner: stream,
            peer_addr,
        }
    }
}

impl AsyncRead for TcpTransportStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpTransportStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl TransportStream for TcpTransportStream {
    fn peer(&self) -> String {
        self.peer_addr.to_string()
    }

    async fn close(&mut self) -> Result<()> {
        tokio::io::AsyncWriteExt::shutdown(&mut self.inner).await?;
        Ok(())
    }
}

/// Accepts bridge clients on a listening socket
pub struct TcpConnector {
    address: String,
    listener: Option<TcpListener>,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            listener: None,
        }
    }

    /// Bind the listening socket now instead of on the first accept
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.address)
            .await
            .with_context(|| format!("binding {}", self.address))?;
        let local = listener.local_addr()?;
        info!("[BRIDGE] Listening on {}", local);
        self.listener = Some(listener);
        Ok(local)
    }
}

#[async_trait]
impl TransportConnector for TcpConnector {
    async fn connect(&mut self) -> Result<Box<dyn TransportStream>> {
        if self.listener.is_none() {
            self.bind().await?;
        }
        let Some(listener) = self.listener.as_ref() else {
            anyhow::bail!("listener for {} not bound", self.address);
        };
        let (stream, peer_addr) = listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(TcpTransportStream::new(stream, peer_addr)))
    }

    fn name(&self) -> &'static str {
        "TCP"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_accepts_client() {
        let mut connector = TcpConnector::new("127.0.0.1:0");
        let addr = connector.bind().await.unwrap();
        assert_eq!(connector.name(), "TCP");

        let client = tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            client.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut stream = connector.connect().await.unwrap();
        assert!(stream.peer().starts_with("127.0.0.1:"));
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        stream.write_all(b"pong").await.unwrap();

        assert_eq!(&client.await.unwrap(), b"pong");
        stream.close().await.unwrap();
    }
}
