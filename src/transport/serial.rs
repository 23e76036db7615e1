//! Serial port endpoint

use crate::transport::traits::{TransportConnector, TransportStream};
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Serial port wrapper implementing TransportStream
pub struct SerialTransportStream {
    inner: SerialStream,
    path: String,
}

impl AsyncRead for SerialTransportStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for SerialTransportStream {
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
impl TransportStream for SerialTransportStream {
    fn peer(&self) -> String {
        self.path.clone()
    }

    async fn close(&mut self) -> Result<()> {
        tokio::io::AsyncWriteExt::flush(&mut self.inner).await?;
        Ok(())
    }
}

/// Opens a serial device
pub struct SerialConnector {
    path: String,
    baud: u32,
}

impl SerialConnector {
    pub fn new(path: impl Into<String>, baud: u32) -> Self {
        Self {
            path: path.into(),
            baud,
        }
    }
}

#[async_trait]
impl TransportConnector for SerialConnector {
    async fn connect(&mut self) -> Result<Box<dyn TransportStream>> {
        let inner = tokio_serial::new(&self.path, self.baud)
            .open_native_async()
            .with_context(|| format!("opening {} at {} baud", self.path, self.baud))?;
        Ok(Box::new(SerialTransportStream {
            inner,
            path: self.path.clone(),
        }))
    }

    fn name(&self) -> &'static str {
        "serial"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_device_fails() {
        let mut connector = SerialConnector::new("/dev/nrfuart-does-not-exist", 115_200);
        assert_eq!(connector.name(), "serial");
        assert!(connector.reconnects());
        let err = connector.connect().await.err().unwrap();
        assert!(err.to_string().contains("/dev/nrfuart-does-not-exist"));
    }
}
