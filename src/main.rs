mod config;
mod connection;
mod radio;
mod transport;

use anyhow::{bail, Result};
use clap::Parser;
use config::{BridgeConfig, Cli};
use connection::UartLink;
use radio::BluerRadio;
use std::time::Duration;
use tokio::sync::mpsc;
use transport::run_endpoint;

use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Bytes from the local endpoint waiting for the UART link
const OUTBOUND_QUEUE: usize = 64;

const ENDPOINT_GRACE: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
    let config = BridgeConfig::from(Cli::parse());

    // stdout may be the bridged endpoint, so logs go to stderr
    let level = if config.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    let Some(target) = config.target.as_deref() else {
        bail!("no accessory name given, pass --target NAME");
    };
    info!("[MAIN] nrfuart bridge starting: target {:?}", target);
    info!("[MAIN]   endpoint: {:?}", config.endpoint);
    if let Some(timeout) = config.ready_timeout {
        info!("[MAIN]   readiness timeout: {:?}", timeout);
    }

    let (radio, radio_rx) = BluerRadio::open(config.adapter.as_deref()).await?;

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let connector = transport::connector_for(&config.endpoint);
    let mut endpoint = tokio::spawn(run_endpoint(
        connector,
        inbound_rx,
        outbound_tx,
        config.chunk_size,
    ));

    let link = UartLink::new(
        radio,
        config.manager_config(),
        config.ready_timeout,
        inbound_tx,
    );
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("[MAIN] Unable to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let result = link.run(radio_rx, outbound_rx, shutdown).await;

    // The endpoint sees the link go away unless it is waiting for a client
    match tokio::time::timeout(ENDPOINT_GRACE, &mut endpoint).await {
        Ok(Ok(Err(e))) => return Err(e.context("local endpoint failed")),
        Ok(Err(e)) => error!("[MAIN] Endpoint task panicked: {}", e),
        Ok(Ok(Ok(()))) => {}
        Err(_) => endpoint.abort(),
    }

    info!("[MAIN] Bridge stopped");
    result
}
