//! Connection manager
//!
//! Owns the connection lifecycle of the single UART peripheral: power state,
//! scanning, binding a [`PeripheralSession`], the readiness transition and
//! unconditional auto-reconnect. It is driven entirely by
//! [`ConnectionManager::handle_event`] and the caller-facing operations.

use tracing::{debug, error, info, trace, warn};

use crate::adapter::{RadioAdapter, RadioEvent};
use crate::error::UartError;
use crate::session::{PeripheralSession, ReadinessGate, SessionEvent, WritePolicy};
use crate::{uuids, ConnectionMode, ConnectionStatus, RadioPowerState};

/// Caller callbacks. `on_connect`/`on_disconnect` fire only when the status
/// crosses into or out of [`ConnectionStatus::Connected`].
pub trait ConnectionHandler {
    fn on_connect(&mut self);

    fn on_disconnect(&mut self);

    /// Inbound bytes, with a UTF-8 decoding when the bytes are valid UTF-8
    fn on_data(&mut self, data: &[u8], text: Option<&str>);

    /// Discovery, characteristic and connect failures
    fn on_error(&mut self, error: &UartError) {
        let _ = error;
    }
}

/// Configuration for the connection manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Advertised name of the accessory to connect to
    pub target: Option<String>,
    /// Connect on power-on and reconnect after every transport loss
    pub auto_connect: bool,
    /// Log payload bytes of every transfer
    pub verbose: bool,
    /// Ask the adapter to report duplicate advertisements while scanning
    pub allow_duplicates: bool,
    pub write_policy: WritePolicy,
    pub readiness: ReadinessGate,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            target: None,
            auto_connect: true,
            verbose: false,
            allow_duplicates: false,
            write_policy: WritePolicy::default(),
            readiness: ReadinessGate::default(),
        }
    }
}

/// Manages the link to one UART peripheral
pub struct ConnectionManager<A: RadioAdapter, H: ConnectionHandler> {
    adapter: A,
    handler: H,
    config: ManagerConfig,
    power: RadioPowerState,
    status: ConnectionStatus,
    mode: ConnectionMode,
    target: Option<String>,
    session: Option<PeripheralSession<A::Peripheral>>,
    /// A connect was requested while the radio was off
    connect_pending: bool,
    /// The caller asked for the current link to be torn down
    disconnect_requested: bool,
}

impl<A: RadioAdapter, H: ConnectionHandler> ConnectionManager<A, H> {
    pub fn new(adapter: A, handler: H, config: ManagerConfig) -> Self {
        Self {
            adapter,
            handler,
            target: config.target.clone(),
            config,
            power: RadioPowerState::Off,
            status: ConnectionStatus::Disconnected,
            mode: ConnectionMode::None,
            session: None,
            connect_pending: false,
            disconnect_requested: false,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    pub fn power_state(&self) -> RadioPowerState {
        self.power
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn session(&self) -> Option<&PeripheralSession<A::Peripheral>> {
        self.session.as_ref()
    }

    /// Hardware revision reported by the bound peripheral
    pub fn hardware_revision(&self) -> Option<&str> {
        self.session.as_ref().and_then(|s| s.hardware_revision())
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn adapter_mut(&mut self) -> &mut A {
        &mut self.adapter
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.config.verbose = verbose;
        if let Some(session) = self.session.as_mut() {
            session.set_verbose(verbose);
        }
    }

    pub fn set_auto_connect(&mut self, auto_connect: bool) {
        self.config.auto_connect = auto_connect;
    }

    /// Connect to the peripheral advertising `target`
    pub fn connect(&mut self, target: impl Into<String>) {
        if self.status == ConnectionStatus::Connected {
            info!(
                "[UART] Already connected to {:?}, ignoring connect",
                self.session.as_ref().map(|s| s.peripheral())
            );
            return;
        }

        self.target = Some(target.into());
        self.disconnect_requested = false;
        self.start_connect();
    }

    /// Request teardown of the current link. State is cleared when the
    /// adapter reports the disconnect.
    pub fn disconnect(&mut self) {
        let Some(session) = self.session.as_ref() else {
            info!("[UART] No peripheral to disconnect");
            return;
        };

        info!("[UART] Disconnecting {:?}", session.peripheral());
        self.disconnect_requested = true;
        let peripheral = session.peripheral().clone();
        self.adapter.cancel_connection(&peripheral);
    }

    pub fn write_string(&mut self, value: &str) -> Result<(), UartError> {
        self.write_data(value.as_bytes())
    }

    pub fn write_data(&mut self, data: &[u8]) -> Result<(), UartError> {
        if self.status != ConnectionStatus::Connected {
            debug!("[UART] Write of {} bytes refused: {}", data.len(), self.status);
            return Err(UartError::NotReady);
        }
        let session = self.session.as_mut().ok_or(UartError::NotReady)?;
        session.write_raw_data(&mut self.adapter, data)
    }

    /// Promote a UART-bound session whose readiness check never answered
    pub fn on_readiness_timeout(&mut self, peripheral: &A::Peripheral) {
        if self.status == ConnectionStatus::Connected {
            return;
        }
        let Some(session) = self.session.as_mut().filter(|s| s.is_bound_to(peripheral)) else {
            return;
        };
        if session.promote() {
            warn!(
                "[UART] Readiness check timed out on {:?}, using UART characteristics only",
                peripheral
            );
            self.set_status(ConnectionStatus::Connected);
        } else {
            debug!("[UART] Readiness timeout ignored in {:?}", session.phase());
        }
    }

    /// Feed one event from the adapter's serialized event stream
    pub fn handle_event(&mut self, event: RadioEvent<A::Peripheral>) {
        self.adapter.observe(&event);
        match event {
            RadioEvent::PowerStateChanged(state) => self.on_power_state(state),
            RadioEvent::Discovered {
                peripheral,
                name,
                rssi,
            } => self.on_discovered(peripheral, &name, rssi),
            RadioEvent::Connected(peripheral) => self.on_transport_connected(&peripheral),
            RadioEvent::ConnectFailed { peripheral, error } => {
                self.on_connect_failed(&peripheral, error)
            }
            RadioEvent::Disconnected { peripheral, error } => {
                self.on_transport_disconnected(&peripheral, error)
            }
            RadioEvent::ServicesDiscovered { peripheral, result } => {
                let Some(session) = bound(&mut self.session, &peripheral) else {
                    return;
                };
                let events = session.did_discover_services(&mut self.adapter, result);
                self.apply(events);
            }
            RadioEvent::CharacteristicsDiscovered {
                peripheral,
                service,
                result,
            } => {
                let Some(session) = bound(&mut self.session, &peripheral) else {
                    return;
                };
                let events =
                    session.did_discover_characteristics(&mut self.adapter, &service, result);
                self.apply(events);
            }
            RadioEvent::NotifyStateUpdated {
                peripheral,
                characteristic,
                result,
            } => {
                let Some(session) = bound(&mut self.session, &peripheral) else {
                    return;
                };
                let events = session.did_update_notify(&characteristic, result);
                self.apply(events);
            }
            RadioEvent::ValueUpdated {
                peripheral,
                characteristic,
                result,
            } => {
                let Some(session) = bound(&mut self.session, &peripheral) else {
                    trace!("[UART] Dropping value from unbound {:?}", peripheral);
                    return;
                };
                let events = session.did_update_value(&characteristic, result);
                self.apply(events);
            }
            RadioEvent::ValueWritten {
                peripheral,
                characteristic,
                result,
            } => {
                let Some(session) = bound(&mut self.session, &peripheral) else {
                    return;
                };
                let events = session.did_write_value(&characteristic, result);
                self.apply(events);
            }
        }
    }

    fn on_power_state(&mut self, state: RadioPowerState) {
        self.power = state;
        match state {
            RadioPowerState::On => {
                info!("[UART] Radio powered on");
                if self.status == ConnectionStatus::Connected {
                    debug!("[UART] Already connected, ignoring power-on");
                    return;
                }
                if self.config.auto_connect || self.connect_pending {
                    self.start_connect();
                }
            }
            RadioPowerState::Off => {
                info!("[UART] Radio powered off");
                self.session = None;
                self.disconnect_requested = false;
                self.set_status(ConnectionStatus::Disconnected);
            }
        }
    }

    fn on_discovered(&mut self, peripheral: A::Peripheral, name: &str, rssi: Option<i16>) {
        if self.status != ConnectionStatus::Scanning {
            trace!("[UART] Ignoring discovery of {} while {}", name, self.status);
            return;
        }
        if self.target.as_deref() != Some(name) {
            debug!("[UART] Ignoring peripheral {:?} ({})", peripheral, name);
            return;
        }

        info!("[UART] Did discover peripheral: {} rssi={:?}", name, rssi);
        self.adapter.stop_scan();
        if let Some(previous) = self.session.take() {
            if !previous.is_bound_to(&peripheral) {
                self.adapter.cancel_connection(previous.peripheral());
            }
        }
        self.bind(peripheral, true);
    }

    fn on_transport_connected(&mut self, peripheral: &A::Peripheral) {
        let Some(session) = bound(&mut self.session, peripheral) else {
            debug!("[UART] Ignoring connect of unbound {:?}", peripheral);
            return;
        };
        info!("[UART] Did connect peripheral {:?}", peripheral);
        let events = session.did_connect(&mut self.adapter);
        self.apply(events);
    }

    fn on_connect_failed(&mut self, peripheral: &A::Peripheral, error: String) {
        if bound(&mut self.session, peripheral).is_none() {
            return;
        }
        warn!("[UART] Unable to connect {:?}: {}", peripheral, error);
        self.handler.on_error(&UartError::ConnectFailed(error));
        self.lose_link();
    }

    fn on_transport_disconnected(&mut self, peripheral: &A::Peripheral, error: Option<String>) {
        if bound(&mut self.session, peripheral).is_none() {
            debug!("[UART] Ignoring disconnect of unbound {:?}", peripheral);
            return;
        }
        match error {
            Some(e) => warn!("[UART] Peripheral {:?} disconnected: {}", peripheral, e),
            None => info!("[UART] Peripheral {:?} disconnected", peripheral),
        }
        self.lose_link();
    }

    /// Drop the session after the transport went away, then reconnect per policy
    fn lose_link(&mut self) {
        self.session = None;
        self.set_status(ConnectionStatus::Disconnected);

        if self.disconnect_requested {
            self.disconnect_requested = false;
            self.target = None;
            return;
        }
        if self.config.auto_connect {
            self.start_connect();
        }
    }

    fn start_connect(&mut self) {
        let Some(target) = self.target.clone() else {
            debug!("[UART] No target to connect to");
            return;
        };
        if self.power == RadioPowerState::Off {
            info!("[UART] Radio is off, deferring connect to {}", target);
            self.connect_pending = true;
            return;
        }
        self.connect_pending = false;

        if let Some(stale) = self.session.take() {
            debug!("[UART] Abandoning in-flight session {:?}", stale.peripheral());
            self.disconnect_requested = false;
            self.adapter.cancel_connection(stale.peripheral());
        }
        self.set_status(ConnectionStatus::Scanning);

        let already_connected = self
            .adapter
            .connected_peripherals(&[uuids::UART_SERVICE])
            .into_iter()
            .find(|c| c.name.as_deref() == Some(target.as_str()));
        if let Some(found) = already_connected {
            info!("[UART] Already connected to {} at transport level", target);
            self.bind(found.peripheral, false);
            return;
        }

        info!("[UART] Scanning for {}", target);
        self.adapter
            .scan(&[uuids::UART_SERVICE], self.config.allow_duplicates);
    }

    fn bind(&mut self, peripheral: A::Peripheral, cancel_stale: bool) {
        if cancel_stale {
            self.adapter.cancel_connection(&peripheral);
        }
        info!("[UART] Connect to peripheral {:?}", peripheral);
        // A pending caller disconnect referred to the session being replaced
        self.disconnect_requested = false;
        let mut session = PeripheralSession::new(
            peripheral.clone(),
            self.config.write_policy,
            self.config.readiness,
        );
        session.set_verbose(self.config.verbose);
        self.session = Some(session);
        self.adapter.connect(&peripheral);
    }

    fn apply(&mut self, events: Vec<SessionEvent>) {
        for event in events {
            match event {
                SessionEvent::Ready => self.set_status(ConnectionStatus::Connected),
                SessionEvent::Data(data) => self.deliver(&data),
                SessionEvent::Error(err) => {
                    error!("[UART] {}", err);
                    if err.is_fatal() {
                        if let Some(session) = self.session.as_ref() {
                            let peripheral = session.peripheral().clone();
                            self.adapter.cancel_connection(&peripheral);
                        }
                    }
                    self.handler.on_error(&err);
                }
            }
        }
    }

    fn deliver(&mut self, data: &[u8]) {
        match self.status {
            ConnectionStatus::Connected | ConnectionStatus::Scanning => {
                let text = std::str::from_utf8(data).ok();
                self.handler.on_data(data, text);
            }
            ConnectionStatus::Disconnected => {
                debug!("[UART] Dropping {} bytes while disconnected", data.len());
            }
        }
    }

    /// Single place the status changes; fires callbacks on Connected edges only
    fn set_status(&mut self, status: ConnectionStatus) {
        let previous = self.status;
        self.status = status;
        self.mode = match status {
            ConnectionStatus::Connected => ConnectionMode::Uart,
            _ => ConnectionMode::None,
        };
        if previous == status {
            return;
        }

        debug!("[UART] Status {} -> {}", previous, status);
        if status == ConnectionStatus::Connected {
            self.handler.on_connect();
        } else if previous == ConnectionStatus::Connected {
            self.handler.on_disconnect();
        }
    }
}

fn bound<'a, P: Clone + PartialEq + std::fmt::Debug>(
    session: &'a mut Option<PeripheralSession<P>>,
    peripheral: &P,
) -> Option<&'a mut PeripheralSession<P>> {
    session.as_mut().filter(|s| s.is_bound_to(peripheral))
}
