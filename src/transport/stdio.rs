//! Standard input/output endpoint

use crate::transport::traits::{TransportConnector, TransportStream};
use anyhow::Result;
use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, Stdin, Stdout};

/// Reads from stdin, writes to stdout
pub struct StdioStream {
    stdin: Stdin,
    stdout: Stdout,
}

impl StdioStream {
    pub fn new() -> Self {
        Self {
            stdin: tokio::io::stdin(),
            stdout: tokio::io::stdout(),
        }
    }
}

impl AsyncRead for StdioStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_read(cx, buf)
    }
}

impl AsyncWrite for StdioStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdout).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_shutdown(cx)
    }
}

#[async_trait]
impl TransportStream for StdioStream {
    fn peer(&self) -> String {
        "stdio".into()
    }

    async fn close(&mut self) -> Result<()> {
        tokio::io::AsyncWriteExt::flush(&mut self.stdout).await?;
        Ok(())
    }
}

/// Hands out the process's stdio once
#[derive(Default)]
pub struct StdioConnector;

#[async_trait]
impl TransportConnector for StdioConnector {
    async fn connect(&mut self) -> Result<Box<dyn TransportStream>> {
        Ok(Box::new(StdioStream::new()))
    }

    fn name(&self) -> &'static str {
        "stdio"
    }

    /// stdin cannot be reopened after EOF
    fn reconnects(&self) -> bool {
        false
    }
}
