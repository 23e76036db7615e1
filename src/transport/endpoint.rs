//! Pumps bytes between a local endpoint and the UART link

use crate::transport::traits::{TransportConnector, TransportStream};
use anyhow::Result;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Delay before reopening an endpoint that failed to open
const REOPEN_DELAY: Duration = Duration::from_secs(1);

const READ_BUFFER: usize = 1024;

/// Split `data` into pieces of at most `chunk_size` bytes
pub fn chunk(data: Bytes, chunk_size: usize) -> Vec<Bytes> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(data.len().div_ceil(chunk_size));
    let mut rest = data;
    while !rest.is_empty() {
        let n = rest.len().min(chunk_size);
        chunks.push(rest.split_to(n));
    }
    chunks
}

/// Bridge the endpoint until the UART side goes away or a
/// non-reconnecting endpoint closes
pub async fn run_endpoint(
    mut connector: Box<dyn TransportConnector>,
    mut inbound_rx: mpsc::UnboundedReceiver<Bytes>,
    outbound_tx: mpsc::Sender<Bytes>,
    chunk_size: usize,
) -> Result<()> {
    loop {
        let stream = match connector.connect().await {
            Ok(stream) => stream,
            Err(e) if connector.reconnects() => {
                warn!("[BRIDGE] Failed to open {} endpoint: {:#}", connector.name(), e);
                tokio::time::sleep(REOPEN_DELAY).await;
                continue;
            }
            Err(e) => return Err(e),
        };
        info!("[BRIDGE] {} endpoint open: {}", connector.name(), stream.peer());

        // Bytes received while no endpoint was open have nowhere to go
        let mut stale = 0;
        while let Ok(data) = inbound_rx.try_recv() {
            stale += data.len();
        }
        if stale > 0 {
            debug!("[BRIDGE] Dropped {} bytes received before {} opened", stale, stream.peer());
        }

        match pump(stream, &mut inbound_rx, &outbound_tx, chunk_size).await {
            Ok(PumpExit::StreamClosed) => {
                info!("[BRIDGE] {} endpoint closed", connector.name());
            }
            Ok(PumpExit::LinkGone) => {
                debug!("[BRIDGE] UART side closed, stopping endpoint");
                return Ok(());
            }
            Err(e) => warn!("[BRIDGE] {} endpoint error: {:#}", connector.name(), e),
        }

        if !connector.reconnects() {
            return Ok(());
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum PumpExit {
    StreamClosed,
    LinkGone,
}

async fn pump(
    stream: Box<dyn TransportStream>,
    inbound_rx: &mut mpsc::UnboundedReceiver<Bytes>,
    outbound_tx: &mpsc::Sender<Bytes>,
    chunk_size: usize,
) -> Result<PumpExit> {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut read_buf = vec![0u8; READ_BUFFER];

    let exit = loop {
        tokio::select! {
            result = reader.read(&mut read_buf) => {
                let n = result?;
                if n == 0 {
                    break PumpExit::StreamClosed;
                }
                let data = Bytes::copy_from_slice(&read_buf[..n]);
                for piece in chunk(data, chunk_size) {
                    if outbound_tx.send(piece).await.is_err() {
                        break;
                    }
                }
                if outbound_tx.is_closed() {
                    break PumpExit::LinkGone;
                }
            }

            received = inbound_rx.recv() => {
                let Some(data) = received else {
                    break PumpExit::LinkGone;
                };
                writer.write_all(&data).await?;
                writer.flush().await?;
            }
        }
    };

    let mut stream = reader.unsplit(writer);
    if let Err(e) = stream.close().await {
        debug!("[BRIDGE] Close of {} failed: {:#}", stream.peer(), e);
    }
    Ok(exit)
}
