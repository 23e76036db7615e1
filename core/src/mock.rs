//! Recording radio adapter and handler used by the unit tests

use std::collections::HashMap;
use uuid::Uuid;

use crate::adapter::{
    CharProperties, CharacteristicInfo, ConnectedPeripheral, RadioAdapter, ServiceInfo, WriteType,
};
use crate::manager::ConnectionHandler;
use crate::uuids;
use crate::UartError;

pub type MockPeripheral = u32;

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Scan { services: Vec<Uuid>, allow_duplicates: bool },
    StopScan,
    Connect(MockPeripheral),
    CancelConnection(MockPeripheral),
    DiscoverServices { peripheral: MockPeripheral, services: Vec<Uuid> },
    DiscoverCharacteristics {
        peripheral: MockPeripheral,
        service: Uuid,
        characteristics: Vec<Uuid>,
    },
    SetNotify { peripheral: MockPeripheral, characteristic: Uuid, enabled: bool },
    ReadValue { peripheral: MockPeripheral, characteristic: Uuid },
    WriteValue { peripheral: MockPeripheral, value: Vec<u8>, write_type: WriteType },
}

#[derive(Debug, Default)]
pub struct MockRadio {
    pub requests: Vec<Request>,
    pub connected: Vec<ConnectedPeripheral<MockPeripheral>>,
    pub cached_services: HashMap<MockPeripheral, Vec<ServiceInfo>>,
    pub cached_characteristics: HashMap<(MockPeripheral, u16), Vec<CharacteristicInfo>>,
}

impl MockRadio {
    /// Drain recorded requests
    pub fn take(&mut self) -> Vec<Request> {
        std::mem::take(&mut self.requests)
    }

    pub fn count(&self, predicate: impl Fn(&Request) -> bool) -> usize {
        self.requests.iter().filter(|r| predicate(r)).count()
    }

    pub fn writes(&self) -> usize {
        self.count(|r| matches!(r, Request::WriteValue { .. }))
    }
}

impl RadioAdapter for MockRadio {
    type Peripheral = MockPeripheral;

    fn connected_peripherals(
        &self,
        _services: &[Uuid],
    ) -> Vec<ConnectedPeripheral<MockPeripheral>> {
        self.connected.clone()
    }

    fn scan(&mut self, services: &[Uuid], allow_duplicates: bool) {
        self.requests.push(Request::Scan {
            services: services.to_vec(),
            allow_duplicates,
        });
    }

    fn stop_scan(&mut self) {
        self.requests.push(Request::StopScan);
    }

    fn connect(&mut self, peripheral: &MockPeripheral) {
        self.requests.push(Request::Connect(*peripheral));
    }

    fn cancel_connection(&mut self, peripheral: &MockPeripheral) {
        self.requests.push(Request::CancelConnection(*peripheral));
    }

    fn services(&self, peripheral: &MockPeripheral) -> Option<Vec<ServiceInfo>> {
        self.cached_services.get(peripheral).cloned()
    }

    fn characteristics(
        &self,
        peripheral: &MockPeripheral,
        service: &ServiceInfo,
    ) -> Option<Vec<CharacteristicInfo>> {
        self.cached_characteristics
            .get(&(*peripheral, service.handle))
            .cloned()
    }

    fn discover_services(&mut self, peripheral: &MockPeripheral, services: &[Uuid]) {
        self.requests.push(Request::DiscoverServices {
            peripheral: *peripheral,
            services: services.to_vec(),
        });
    }

    fn discover_characteristics(
        &mut self,
        peripheral: &MockPeripheral,
        service: &ServiceInfo,
        characteristics: &[Uuid],
    ) {
        self.requests.push(Request::DiscoverCharacteristics {
            peripheral: *peripheral,
            service: service.uuid,
            characteristics: characteristics.to_vec(),
        });
    }

    fn set_notify(
        &mut self,
        peripheral: &MockPeripheral,
        characteristic: &CharacteristicInfo,
        enabled: bool,
    ) {
        self.requests.push(Request::SetNotify {
            peripheral: *peripheral,
            characteristic: characteristic.uuid,
            enabled,
        });
    }

    fn read_value(&mut self, peripheral: &MockPeripheral, characteristic: &CharacteristicInfo) {
        self.requests.push(Request::ReadValue {
            peripheral: *peripheral,
            characteristic: characteristic.uuid,
        });
    }

    fn write_value(
        &mut self,
        peripheral: &MockPeripheral,
        _characteristic: &CharacteristicInfo,
        value: &[u8],
        write_type: WriteType,
    ) {
        self.requests.push(Request::WriteValue {
            peripheral: *peripheral,
            value: value.to_vec(),
            write_type,
        });
    }
}

/// Handler that records every callback
#[derive(Debug, Default)]
pub struct RecordingHandler {
    pub connects: usize,
    pub disconnects: usize,
    pub data: Vec<(Vec<u8>, Option<String>)>,
    pub errors: Vec<UartError>,
}

impl ConnectionHandler for RecordingHandler {
    fn on_connect(&mut self) {
        self.connects += 1;
    }

    fn on_disconnect(&mut self) {
        self.disconnects += 1;
    }

    fn on_data(&mut self, data: &[u8], text: Option<&str>) {
        self.data.push((data.to_vec(), text.map(str::to_owned)));
    }

    fn on_error(&mut self, error: &UartError) {
        self.errors.push(error.clone());
    }
}

pub fn uart_service() -> ServiceInfo {
    ServiceInfo {
        uuid: uuids::UART_SERVICE,
        handle: 1,
    }
}

pub fn info_service() -> ServiceInfo {
    ServiceInfo {
        uuid: uuids::DEVICE_INFORMATION_SERVICE,
        handle: 2,
    }
}

pub fn rx_char() -> CharacteristicInfo {
    CharacteristicInfo {
        uuid: uuids::RX_CHARACTERISTIC,
        service: 1,
        handle: 11,
        properties: CharProperties {
            notify: true,
            ..Default::default()
        },
    }
}

pub fn tx_char(write: bool, write_without_response: bool) -> CharacteristicInfo {
    CharacteristicInfo {
        uuid: uuids::TX_CHARACTERISTIC,
        service: 1,
        handle: 12,
        properties: CharProperties {
            write,
            write_without_response,
            ..Default::default()
        },
    }
}

pub fn hw_revision_char() -> CharacteristicInfo {
    CharacteristicInfo {
        uuid: uuids::HARDWARE_REVISION_STRING,
        service: 2,
        handle: 21,
        properties: CharProperties {
            read: true,
            ..Default::default()
        },
    }
}
