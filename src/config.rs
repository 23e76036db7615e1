//! Command line and bridge configuration

use clap::Parser;
use nrfuart_core::ManagerConfig;
use std::time::Duration;

/// Default BLE write chunk, the ATT payload of a 23-byte MTU
pub const DEFAULT_CHUNK_SIZE: usize = 20;

/// Default serial line rate
pub const DEFAULT_BAUD: u32 = 115_200;

/// Bridge a BLE UART accessory to a local endpoint
#[derive(Debug, Parser)]
#[command(name = "nrfuart-bridge", version, about)]
pub struct Cli {
    /// Advertised name of the accessory
    #[arg(short, long)]
    pub target: Option<String>,

    /// BlueZ adapter to use (e.g. hci0); the default adapter otherwise
    #[arg(long)]
    pub adapter: Option<String>,

    /// Connect once and do not reconnect after the link drops
    #[arg(long)]
    pub no_auto_connect: bool,

    /// Debug logging and payload dumps
    #[arg(short, long)]
    pub verbose: bool,

    /// Listen on this address and bridge one TCP client at a time
    #[arg(long, value_name = "ADDR", conflicts_with = "serial")]
    pub tcp: Option<String>,

    /// Bridge to a serial device instead of stdio
    #[arg(long, value_name = "PATH")]
    pub serial: Option<String>,

    /// Serial line rate
    #[arg(long, default_value_t = DEFAULT_BAUD)]
    pub baud: u32,

    /// Largest write handed to the TX characteristic
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Promote a UART-bound link after this many seconds without a hardware revision
    #[arg(long, value_name = "SECS")]
    pub ready_timeout: Option<u64>,
}

/// Where UART bytes are bridged to
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EndpointConfig {
    #[default]
    Stdio,
    Tcp {
        listen: String,
    },
    Serial {
        path: String,
        baud: u32,
    },
}

/// Configuration for the bridge process
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub adapter: Option<String>,
    pub target: Option<String>,
    pub auto_connect: bool,
    pub verbose: bool,
    pub endpoint: EndpointConfig,
    pub chunk_size: usize,
    pub ready_timeout: Option<Duration>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            adapter: None,
            target: None,
            auto_connect: true,
            verbose: false,
            endpoint: EndpointConfig::Stdio,
            chunk_size: DEFAULT_CHUNK_SIZE,
            ready_timeout: None,
        }
    }
}

impl From<Cli> for BridgeConfig {
    fn from(cli: Cli) -> Self {
        let endpoint = match (cli.tcp, cli.serial) {
            (Some(listen), _) => EndpointConfig::Tcp { listen },
            (None, Some(path)) => EndpointConfig::Serial {
                path,
                baud: cli.baud,
            },
            (None, None) => EndpointConfig::Stdio,
        };

        Self {
            adapter: cli.adapter,
            target: cli.target,
            auto_connect: !cli.no_auto_connect,
            verbose: cli.verbose,
            endpoint,
            chunk_size: cli.chunk_size.max(1),
            ready_timeout: cli.ready_timeout.map(Duration::from_secs),
        }
    }
}

impl BridgeConfig {
    /// Core manager settings for this bridge
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            target: self.target.clone(),
            auto_connect: self.auto_connect,
            verbose: self.verbose,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> BridgeConfig {
        let mut argv = vec!["nrfuart-bridge"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv).into()
    }

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert!(config.auto_connect);
        assert!(!config.verbose);
        assert_eq!(config.endpoint, EndpointConfig::Stdio);
        assert_eq!(config.chunk_size, 20);
        assert!(config.ready_timeout.is_none());
    }

    #[test]
    fn test_cli_defaults_match_config_defaults() {
        let config = parse(&[]);
        let defaults = BridgeConfig::default();
        assert_eq!(config.auto_connect, defaults.auto_connect);
        assert_eq!(config.endpoint, defaults.endpoint);
        assert_eq!(config.chunk_size, defaults.chunk_size);
        assert!(config.target.is_none());
    }

    #[test]
    fn test_cli_mapping() {
        let config = parse(&[
            "-t",
            "UART",
            "--adapter",
            "hci1",
            "--no-auto-connect",
            "-v",
            "--tcp",
            "127.0.0.1:7000",
            "--chunk-size",
            "64",
            "--ready-timeout",
            "5",
        ]);
        assert_eq!(config.target.as_deref(), Some("UART"));
        assert_eq!(config.adapter.as_deref(), Some("hci1"));
        assert!(!config.auto_connect);
        assert!(config.verbose);
        assert_eq!(
            config.endpoint,
            EndpointConfig::Tcp {
                listen: "127.0.0.1:7000".into()
            }
        );
        assert_eq!(config.chunk_size, 64);
        assert_eq!(config.ready_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_serial_endpoint() {
        let config = parse(&["--serial", "/dev/ttyUSB0", "--baud", "9600"]);
        assert_eq!(
            config.endpoint,
            EndpointConfig::Serial {
                path: "/dev/ttyUSB0".into(),
                baud: 9600
            }
        );
    }

    #[test]
    fn test_tcp_and_serial_conflict() {
        let result = Cli::try_parse_from([
            "nrfuart-bridge",
            "--tcp",
            "127.0.0.1:7000",
            "--serial",
            "/dev/ttyUSB0",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_chunk_size_is_clamped() {
        let config = parse(&["--chunk-size", "0"]);
        assert_eq!(config.chunk_size, 1);
    }

    #[test]
    fn test_manager_config() {
        let config = parse(&["-t", "UART", "--no-auto-connect"]);
        let manager = config.manager_config();
        assert_eq!(manager.target.as_deref(), Some("UART"));
        assert!(!manager.auto_connect);
        assert!(!manager.allow_duplicates);
    }
}
