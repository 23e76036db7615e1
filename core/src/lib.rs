//! nrfuart core
//!
//! Connection lifecycle and GATT binding for one BLE peripheral exposing the
//! Nordic UART service. The crate is a synchronous, event-driven state
//! machine: the host feeds it [`RadioEvent`]s and it issues requests through a
//! [`RadioAdapter`] implementation.

pub mod adapter;
pub mod error;
pub mod manager;
pub mod session;

#[cfg(test)]
pub(crate) mod mock;

pub use adapter::{
    CharProperties, CharacteristicInfo, ConnectedPeripheral, RadioAdapter, RadioEvent,
    ServiceInfo, WriteType,
};
pub use error::UartError;
pub use manager::{ConnectionHandler, ConnectionManager, ManagerConfig};
pub use session::{PeripheralSession, ReadinessGate, SessionEvent, WritePolicy};

/// Power state of the local radio as reported by the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RadioPowerState {
    #[default]
    Off,
    On,
}

/// Externally visible connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Scanning,
    Connected,
}

/// Logical protocol running over the link once connected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionMode {
    #[default]
    None,
    /// Reserved for the nRF8001 pin I/O protocol, never entered
    PinIo,
    Uart,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Scanning => write!(f, "scanning"),
            ConnectionStatus::Connected => write!(f, "connected"),
        }
    }
}

/// Fixed GATT identifiers of the UART accessory
pub mod uuids {
    use uuid::Uuid;

    /// Nordic UART service
    pub const UART_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

    /// TX characteristic (central writes here)
    pub const TX_CHARACTERISTIC: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

    /// RX characteristic (peripheral notifies here)
    pub const RX_CHARACTERISTIC: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

    /// Device Information service (0x180A)
    pub const DEVICE_INFORMATION_SERVICE: Uuid = from_short(0x180a);

    /// Hardware Revision String characteristic (0x2A27)
    pub const HARDWARE_REVISION_STRING: Uuid = from_short(0x2a27);

    const BLUETOOTH_BASE: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

    /// Expand a 16-bit assigned number onto the Bluetooth base UUID
    pub const fn from_short(short: u16) -> Uuid {
        Uuid::from_u128(BLUETOOTH_BASE | ((short as u128) << 96))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uart_uuids() {
        assert_eq!(
            uuids::UART_SERVICE.to_string(),
            "6e400001-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(
            uuids::TX_CHARACTERISTIC.to_string(),
            "6e400002-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(
            uuids::RX_CHARACTERISTIC.to_string(),
            "6e400003-b5a3-f393-e0a9-e50e24dcca9e"
        );
    }

    #[test]
    fn test_short_uuids_expand_on_base() {
        assert_eq!(
            uuids::DEVICE_INFORMATION_SERVICE.to_string(),
            "0000180a-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            uuids::HARDWARE_REVISION_STRING.to_string(),
            "00002a27-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_defaults() {
        assert_eq!(ConnectionStatus::default(), ConnectionStatus::Disconnected);
        assert_eq!(ConnectionMode::default(), ConnectionMode::None);
        assert_eq!(RadioPowerState::default(), RadioPowerState::Off);
    }
}
