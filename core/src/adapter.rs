//! Radio adapter abstraction
//!
//! The adapter owns the BLE stack. Every request below is fire-and-forget:
//! its outcome comes back later as a [`RadioEvent`] on the single serialized
//! event stream the host feeds into the
//! [`ConnectionManager`](crate::ConnectionManager).

use std::fmt;
use uuid::Uuid;

use crate::RadioPowerState;

/// GATT write mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

/// Subset of characteristic properties the UART binding cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
}

/// A discovered GATT service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    /// Adapter-assigned handle
    pub handle: u16,
}

/// A discovered GATT characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    /// Handle of the owning service
    pub service: u16,
    /// Adapter-assigned handle
    pub handle: u16,
    pub properties: CharProperties,
}

/// A peripheral the adapter already holds a transport link to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedPeripheral<P> {
    pub peripheral: P,
    pub name: Option<String>,
}

/// Requests the core issues to the BLE stack
pub trait RadioAdapter {
    /// Opaque, non-owning reference to a transport-level peripheral
    type Peripheral: Clone + PartialEq + fmt::Debug;

    /// Peripherals already linked at the transport level that advertise any of `services`
    fn connected_peripherals(
        &self,
        services: &[Uuid],
    ) -> Vec<ConnectedPeripheral<Self::Peripheral>>;

    /// Start scanning for peripherals advertising any of `services`
    fn scan(&mut self, services: &[Uuid], allow_duplicates: bool);

    fn stop_scan(&mut self);

    fn connect(&mut self, peripheral: &Self::Peripheral);

    /// Cancel a pending connect or tear down an established link
    fn cancel_connection(&mut self, peripheral: &Self::Peripheral);

    /// Services the adapter has cached for `peripheral`, if any
    fn services(&self, peripheral: &Self::Peripheral) -> Option<Vec<ServiceInfo>>;

    /// Characteristics the adapter has cached for `service`, if any
    fn characteristics(
        &self,
        peripheral: &Self::Peripheral,
        service: &ServiceInfo,
    ) -> Option<Vec<CharacteristicInfo>>;

    fn discover_services(&mut self, peripheral: &Self::Peripheral, services: &[Uuid]);

    fn discover_characteristics(
        &mut self,
        peripheral: &Self::Peripheral,
        service: &ServiceInfo,
        characteristics: &[Uuid],
    );

    fn set_notify(
        &mut self,
        peripheral: &Self::Peripheral,
        characteristic: &CharacteristicInfo,
        enabled: bool,
    );

    fn read_value(&mut self, peripheral: &Self::Peripheral, characteristic: &CharacteristicInfo);

    fn write_value(
        &mut self,
        peripheral: &Self::Peripheral,
        characteristic: &CharacteristicInfo,
        value: &[u8],
        write_type: WriteType,
    );

    /// Sees every event before the manager does. Adapters use it to keep
    /// their link and GATT caches current.
    fn observe(&mut self, event: &RadioEvent<Self::Peripheral>) {
        let _ = event;
    }
}

/// Results and unsolicited notifications from the BLE stack
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent<P> {
    /// Radio powered on or off
    PowerStateChanged(RadioPowerState),
    /// Scan report with the advertised local name
    Discovered {
        peripheral: P,
        name: String,
        rssi: Option<i16>,
    },
    /// Transport link established
    Connected(P),
    /// Transport connect attempt failed
    ConnectFailed { peripheral: P, error: String },
    /// Transport link lost or torn down
    Disconnected { peripheral: P, error: Option<String> },
    /// Completion of `discover_services`
    ServicesDiscovered {
        peripheral: P,
        result: Result<Vec<ServiceInfo>, String>,
    },
    /// Completion of `discover_characteristics`
    CharacteristicsDiscovered {
        peripheral: P,
        service: ServiceInfo,
        result: Result<Vec<CharacteristicInfo>, String>,
    },
    /// Completion of `set_notify`
    NotifyStateUpdated {
        peripheral: P,
        characteristic: CharacteristicInfo,
        result: Result<bool, String>,
    },
    /// Read response or notification
    ValueUpdated {
        peripheral: P,
        characteristic: CharacteristicInfo,
        result: Result<Vec<u8>, String>,
    },
    /// Completion of an acknowledged write
    ValueWritten {
        peripheral: P,
        characteristic: CharacteristicInfo,
        result: Result<(), String>,
    },
}

impl<P> RadioEvent<P> {
    /// Peripheral the event refers to, if any
    pub fn peripheral(&self) -> Option<&P> {
        match self {
            RadioEvent::PowerStateChanged(_) => None,
            RadioEvent::Discovered { peripheral, .. }
            | RadioEvent::ConnectFailed { peripheral, .. }
            | RadioEvent::Disconnected { peripheral, .. }
            | RadioEvent::ServicesDiscovered { peripheral, .. }
            | RadioEvent::CharacteristicsDiscovered { peripheral, .. }
            | RadioEvent::NotifyStateUpdated { peripheral, .. }
            | RadioEvent::ValueUpdated { peripheral, .. }
            | RadioEvent::ValueWritten { peripheral, .. } => Some(peripheral),
            RadioEvent::Connected(peripheral) => Some(peripheral),
        }
    }
}
