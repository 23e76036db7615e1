pub mod endpoint;
pub mod serial;
pub mod stdio;
pub mod tcp;
pub mod traits;

pub use endpoint::run_endpoint;
pub use serial::SerialConnector;
pub use stdio::StdioConnector;
pub use tcp::TcpConnector;
pub use traits::{TransportConnector, TransportStream};

use crate::config::EndpointConfig;

/// Build the connector for the configured endpoint
pub fn connector_for(endpoint: &EndpointConfig) -> Box<dyn TransportConnector> {
    match endpoint {
        EndpointConfig::Stdio => Box::new(StdioConnector),
        EndpointConfig::Tcp { listen } => Box::new(TcpConnector::new(listen.clone())),
        EndpointConfig::Serial { path, baud } => {
            Box::new(SerialConnector::new(path.clone(), *baud))
        }
    }
}
