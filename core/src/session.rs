//! Peripheral session
//!
//! Turns a bare transport link into a ready UART channel: service discovery,
//! characteristic binding, notification subscription, the readiness check and
//! write-mode selection.

use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::adapter::{CharProperties, CharacteristicInfo, RadioAdapter, ServiceInfo, WriteType};
use crate::error::UartError;
use crate::uuids;

const UART_SERVICES: [Uuid; 2] = [uuids::UART_SERVICE, uuids::DEVICE_INFORMATION_SERVICE];
const UART_CHARACTERISTICS: [Uuid; 2] = [uuids::TX_CHARACTERISTIC, uuids::RX_CHARACTERISTIC];
const INFO_CHARACTERISTICS: [Uuid; 1] = [uuids::HARDWARE_REVISION_STRING];

/// Order in which GATT write modes are tried on the TX characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WritePolicy {
    /// Write without response if supported, else with response
    #[default]
    PreferWithoutResponse,
    /// Write with response if supported, else without response
    PreferWithResponse,
}

impl WritePolicy {
    /// Pick a write mode for a characteristic, `None` if it is not writable
    pub fn select(&self, properties: &CharProperties) -> Option<WriteType> {
        let without = properties
            .write_without_response
            .then_some(WriteType::WithoutResponse);
        let with = properties.write.then_some(WriteType::WithResponse);
        match self {
            WritePolicy::PreferWithoutResponse => without.or(with),
            WritePolicy::PreferWithResponse => with.or(without),
        }
    }
}

/// Condition under which a session counts as protocol-ready
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadinessGate {
    /// A Hardware Revision String value was read and RX/TX are bound.
    /// Peripherals without a Device Information service never get here.
    #[default]
    HardwareRevision,
    /// RX and TX are bound
    UartCharacteristics,
}

/// Where the session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Transport connect requested
    Connecting,
    /// Transport up, GATT discovery in flight
    Discovering,
    Ready,
    /// Discovery failed, waiting for the transport to go away
    Abandoned,
}

/// Outcome of a session step, consumed by the connection manager
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Ready,
    Data(Vec<u8>),
    Error(UartError),
}

/// State bound to one peripheral
#[derive(Debug)]
pub struct PeripheralSession<P> {
    peripheral: P,
    phase: SessionPhase,
    uart_service: Option<ServiceInfo>,
    rx: Option<CharacteristicInfo>,
    tx: Option<CharacteristicInfo>,
    hw_revision: Option<CharacteristicInfo>,
    hardware_revision: Option<String>,
    write_policy: WritePolicy,
    readiness: ReadinessGate,
    verbose: bool,
}

impl<P: Clone + PartialEq + std::fmt::Debug> PeripheralSession<P> {
    pub fn new(peripheral: P, write_policy: WritePolicy, readiness: ReadinessGate) -> Self {
        Self {
            peripheral,
            phase: SessionPhase::Connecting,
            uart_service: None,
            rx: None,
            tx: None,
            hw_revision: None,
            hardware_revision: None,
            write_policy,
            readiness,
            verbose: false,
        }
    }

    pub fn peripheral(&self) -> &P {
        &self.peripheral
    }

    pub fn is_bound_to(&self, peripheral: &P) -> bool {
        &self.peripheral == peripheral
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_ready(&self) -> bool {
        self.phase == SessionPhase::Ready
    }

    /// Both UART characteristics are resolved
    pub fn is_uart_bound(&self) -> bool {
        self.rx.is_some() && self.tx.is_some()
    }

    pub fn uart_service(&self) -> Option<&ServiceInfo> {
        self.uart_service.as_ref()
    }

    pub fn rx(&self) -> Option<&CharacteristicInfo> {
        self.rx.as_ref()
    }

    pub fn tx(&self) -> Option<&CharacteristicInfo> {
        self.tx.as_ref()
    }

    /// Value read from the Hardware Revision String characteristic
    pub fn hardware_revision(&self) -> Option<&str> {
        self.hardware_revision.as_deref()
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    /// Transport link is up; start (or skip) service discovery
    pub fn did_connect<A>(&mut self, adapter: &mut A) -> Vec<SessionEvent>
    where
        A: RadioAdapter<Peripheral = P>,
    {
        self.phase = SessionPhase::Discovering;

        if let Some(services) = adapter.services(&self.peripheral) {
            debug!("[UART] Skipping service discovery for {:?}", self.peripheral);
            return self.bind_services(adapter, services);
        }

        debug!("[UART] Start service discovery: {:?}", self.peripheral);
        adapter.discover_services(&self.peripheral, &UART_SERVICES);
        Vec::new()
    }

    pub fn did_discover_services<A>(
        &mut self,
        adapter: &mut A,
        result: Result<Vec<ServiceInfo>, String>,
    ) -> Vec<SessionEvent>
    where
        A: RadioAdapter<Peripheral = P>,
    {
        if self.phase != SessionPhase::Discovering {
            debug!("[UART] Ignoring service discovery result in {:?}", self.phase);
            return Vec::new();
        }

        match result {
            Ok(services) => self.bind_services(adapter, services),
            Err(e) => self.abandon(format!("Error discovering services: {}", e)),
        }
    }

    pub fn did_discover_characteristics<A>(
        &mut self,
        adapter: &mut A,
        service: &ServiceInfo,
        result: Result<Vec<CharacteristicInfo>, String>,
    ) -> Vec<SessionEvent>
    where
        A: RadioAdapter<Peripheral = P>,
    {
        if self.phase != SessionPhase::Discovering {
            debug!("[UART] Ignoring characteristic discovery result in {:?}", self.phase);
            return Vec::new();
        }

        match result {
            Ok(characteristics) => self.bind_characteristics(adapter, service, characteristics),
            Err(e) => self.abandon(format!(
                "Error discovering characteristics for {}: {}",
                service.uuid, e
            )),
        }
    }

    /// Read response or notification on one of our characteristics
    pub fn did_update_value(
        &mut self,
        characteristic: &CharacteristicInfo,
        result: Result<Vec<u8>, String>,
    ) -> Vec<SessionEvent> {
        let value = match result {
            Ok(value) => value,
            Err(e) => {
                warn!("[UART] Error on characteristic {}: {}", characteristic.uuid, e);
                return vec![SessionEvent::Error(UartError::Characteristic(format!(
                    "Error receiving value for {}: {}",
                    characteristic.uuid, e
                )))];
            }
        };

        if same_attribute(self.rx.as_ref(), characteristic) {
            if value.is_empty() {
                return Vec::new();
            }
            if self.verbose {
                debug!("[UART] Received {} bytes: {:02x?}", value.len(), value);
            } else {
                trace!("[UART] Received {} bytes", value.len());
            }
            return vec![SessionEvent::Data(value)];
        }

        if same_attribute(self.hw_revision.as_ref(), characteristic) {
            let revision = String::from_utf8_lossy(&value).into_owned();
            info!("[UART] HW revision: {}", revision);
            self.hardware_revision = Some(revision);
            return self.check_ready().into_iter().collect();
        }

        Vec::new()
    }

    pub fn did_update_notify(
        &mut self,
        characteristic: &CharacteristicInfo,
        result: Result<bool, String>,
    ) -> Vec<SessionEvent> {
        match result {
            Ok(enabled) => {
                debug!("[UART] Notify on {} = {}", characteristic.uuid, enabled);
                Vec::new()
            }
            Err(e) => vec![SessionEvent::Error(UartError::Characteristic(format!(
                "Error subscribing to {}: {}",
                characteristic.uuid, e
            )))],
        }
    }

    pub fn did_write_value(
        &mut self,
        characteristic: &CharacteristicInfo,
        result: Result<(), String>,
    ) -> Vec<SessionEvent> {
        match result {
            Ok(()) => Vec::new(),
            Err(e) => vec![SessionEvent::Error(UartError::Characteristic(format!(
                "Error writing {}: {}",
                characteristic.uuid, e
            )))],
        }
    }

    /// Force readiness once the UART characteristics are bound.
    /// Returns true if the session was promoted.
    pub fn promote(&mut self) -> bool {
        if self.phase == SessionPhase::Discovering && self.is_uart_bound() {
            self.phase = SessionPhase::Ready;
            return true;
        }
        false
    }

    pub fn write_string<A>(&mut self, adapter: &mut A, value: &str) -> Result<(), UartError>
    where
        A: RadioAdapter<Peripheral = P>,
    {
        debug!("[UART] Write string: {:?}", value);
        self.write_raw_data(adapter, value.as_bytes())
    }

    pub fn write_raw_data<A>(&mut self, adapter: &mut A, data: &[u8]) -> Result<(), UartError>
    where
        A: RadioAdapter<Peripheral = P>,
    {
        let tx = self.tx.as_ref().ok_or(UartError::NotReady)?;
        let write_type = self.write_policy.select(&tx.properties).ok_or_else(|| {
            warn!("[UART] No write property on TX characteristic: {:?}", tx.properties);
            UartError::Unwritable
        })?;

        if self.verbose {
            debug!("[UART] Write {} bytes ({:?}): {:02x?}", data.len(), write_type, data);
        } else {
            trace!("[UART] Write {} bytes ({:?})", data.len(), write_type);
        }
        adapter.write_value(&self.peripheral, tx, data, write_type);
        Ok(())
    }

    fn bind_services<A>(&mut self, adapter: &mut A, services: Vec<ServiceInfo>) -> Vec<SessionEvent>
    where
        A: RadioAdapter<Peripheral = P>,
    {
        if !services.iter().any(|s| s.uuid == uuids::UART_SERVICE) {
            return self.abandon("UART service not found".into());
        }
        if !services
            .iter()
            .any(|s| s.uuid == uuids::DEVICE_INFORMATION_SERVICE)
        {
            warn!("[UART] No Device Information service on {:?}", self.peripheral);
        }

        let mut events = Vec::new();
        for service in services {
            let wanted: &[Uuid] = if service.uuid == uuids::UART_SERVICE {
                debug!("[UART] Found UART service");
                self.uart_service = Some(service.clone());
                &UART_CHARACTERISTICS
            } else if service.uuid == uuids::DEVICE_INFORMATION_SERVICE {
                &INFO_CHARACTERISTICS
            } else {
                continue;
            };

            match adapter.characteristics(&self.peripheral, &service) {
                Some(characteristics) => {
                    events.extend(self.bind_characteristics(adapter, &service, characteristics));
                }
                None => adapter.discover_characteristics(&self.peripheral, &service, wanted),
            }

            if self.phase == SessionPhase::Abandoned {
                break;
            }
        }
        events
    }

    fn bind_characteristics<A>(
        &mut self,
        adapter: &mut A,
        service: &ServiceInfo,
        characteristics: Vec<CharacteristicInfo>,
    ) -> Vec<SessionEvent>
    where
        A: RadioAdapter<Peripheral = P>,
    {
        for characteristic in characteristics {
            if characteristic.uuid == uuids::RX_CHARACTERISTIC {
                debug!("[UART] Found RX characteristic");
                adapter.set_notify(&self.peripheral, &characteristic, true);
                self.rx = Some(characteristic);
            } else if characteristic.uuid == uuids::TX_CHARACTERISTIC {
                debug!("[UART] Found TX characteristic");
                self.tx = Some(characteristic);
            } else if characteristic.uuid == uuids::HARDWARE_REVISION_STRING {
                debug!("[UART] Found Hardware Revision String characteristic");
                adapter.read_value(&self.peripheral, &characteristic);
                self.hw_revision = Some(characteristic);
            }
        }

        if service.uuid == uuids::UART_SERVICE {
            if self.rx.is_none() {
                return self.abandon("UART service has no RX characteristic".into());
            }
            if self.tx.is_none() {
                return self.abandon("UART service has no TX characteristic".into());
            }
        }

        self.check_ready().into_iter().collect()
    }

    fn check_ready(&mut self) -> Option<SessionEvent> {
        if self.phase != SessionPhase::Discovering || !self.is_uart_bound() {
            return None;
        }
        let gate_open = match self.readiness {
            ReadinessGate::HardwareRevision => self.hardware_revision.is_some(),
            ReadinessGate::UartCharacteristics => true,
        };
        if !gate_open {
            return None;
        }

        info!("[UART] Peripheral {:?} ready", self.peripheral);
        self.phase = SessionPhase::Ready;
        Some(SessionEvent::Ready)
    }

    fn abandon(&mut self, reason: String) -> Vec<SessionEvent> {
        warn!("[UART] {}", reason);
        self.phase = SessionPhase::Abandoned;
        vec![SessionEvent::Error(UartError::Discovery(reason))]
    }
}

fn same_attribute(bound: Option<&CharacteristicInfo>, other: &CharacteristicInfo) -> bool {
    bound.is_some_and(|c| c.service == other.service && c.handle == other.handle)
}
