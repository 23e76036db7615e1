//! Local endpoint abstraction for the bytes bridged over the UART link

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// A local byte stream the UART link is bridged to
#[async_trait]
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Describes the other end, for logging
    fn peer(&self) -> String;

    /// Close the stream gracefully
    async fn close(&mut self) -> Result<()>;
}

/// Opens local streams
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Wait for and open the next stream
    async fn connect(&mut self) -> Result<Box<dyn TransportStream>>;

    /// Human-readable name for this endpoint
    fn name(&self) -> &'static str;

    /// Whether a closed stream should be replaced by a new one
    fn reconnects(&self) -> bool {
        true
    }
}
