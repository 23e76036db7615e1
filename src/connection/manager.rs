//! UART link driver: the single event loop that owns the connection manager

use anyhow::{anyhow, Result};
use bytes::Bytes;
use nrfuart_core::{
    ConnectionHandler, ConnectionManager, ManagerConfig, RadioAdapter, RadioEvent, UartError,
};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// How long a shutdown waits for the peripheral to report the disconnect
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Events emitted by the connection manager callbacks
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// UART link ready for writes
    Connected,
    /// UART link lost
    Disconnected,
    /// Bytes from the peripheral's RX characteristic
    Received { data: Bytes, text: Option<String> },
    /// Discovery, characteristic or connect failure
    Error(UartError),
}

/// Forwards manager callbacks into a channel drained by the link loop
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ChannelHandler {
    pub fn new(tx: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        Self { tx }
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.tx.send(event);
    }
}

impl ConnectionHandler for ChannelHandler {
    fn on_connect(&mut self) {
        self.emit(ConnectionEvent::Connected);
    }

    fn on_disconnect(&mut self) {
        self.emit(ConnectionEvent::Disconnected);
    }

    fn on_data(&mut self, data: &[u8], text: Option<&str>) {
        self.emit(ConnectionEvent::Received {
            data: Bytes::copy_from_slice(data),
            text: text.map(str::to_owned),
        });
    }

    fn on_error(&mut self, error: &UartError) {
        self.emit(ConnectionEvent::Error(error.clone()));
    }
}

/// Owns the [`ConnectionManager`] and serializes everything that touches it:
/// radio events, readiness timeouts and bytes from the local endpoint.
pub struct UartLink<A: RadioAdapter> {
    manager: ConnectionManager<A, ChannelHandler>,
    events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    /// Bytes from the peripheral, toward the local endpoint
    inbound_tx: mpsc::UnboundedSender<Bytes>,
    timeout_tx: mpsc::UnboundedSender<ReadinessTimeout<A::Peripheral>>,
    timeout_rx: mpsc::UnboundedReceiver<ReadinessTimeout<A::Peripheral>>,
    ready_timeout: Option<Duration>,
    /// Bumped on every transport connect; timers from older links are stale
    transport_generation: u64,
    readiness_timer: Option<JoinHandle<()>>,
}

/// Readiness timer expiry for one transport link
#[derive(Debug)]
pub struct ReadinessTimeout<P> {
    pub peripheral: P,
    pub generation: u64,
}

impl<A> UartLink<A>
where
    A: RadioAdapter,
    A::Peripheral: Send + 'static,
{
    pub fn new(
        adapter: A,
        config: ManagerConfig,
        ready_timeout: Option<Duration>,
        inbound_tx: mpsc::UnboundedSender<Bytes>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (timeout_tx, timeout_rx) = mpsc::unbounded_channel();
        let auto_connect = config.auto_connect;
        let target = config.target.clone();

        let mut manager = ConnectionManager::new(adapter, ChannelHandler::new(events_tx), config);
        // Without auto-connect nothing starts the first attempt on power-on
        if !auto_connect {
            if let Some(target) = target {
                manager.connect(target);
            }
        }

        Self {
            manager,
            events_rx,
            inbound_tx,
            timeout_tx,
            timeout_rx,
            ready_timeout,
            transport_generation: 0,
            readiness_timer: None,
        }
    }

    pub fn manager(&self) -> &ConnectionManager<A, ChannelHandler> {
        &self.manager
    }

    /// Feed one radio event to the manager
    pub fn handle_radio_event(&mut self, event: RadioEvent<A::Peripheral>) {
        trace!("[BRIDGE] Radio event for {:?}", event.peripheral());
        let transport_up = match &event {
            RadioEvent::Connected(peripheral) => Some(peripheral.clone()),
            _ => None,
        };

        self.manager.handle_event(event);

        // Connects for peripherals other than the bound one are ignored by the manager
        if let Some(peripheral) = transport_up {
            let bound = self.manager.session().is_some_and(|s| s.is_bound_to(&peripheral));
            if bound {
                self.arm_readiness_timer(peripheral);
            }
        }
        self.dispatch();
    }

    pub fn handle_readiness_timeout(&mut self, timeout: ReadinessTimeout<A::Peripheral>) {
        if timeout.generation != self.transport_generation {
            debug!(
                "[BRIDGE] Ignoring readiness timeout of an earlier link to {:?}",
                timeout.peripheral
            );
            return;
        }
        self.readiness_timer = None;
        self.manager.on_readiness_timeout(&timeout.peripheral);
        self.dispatch();
    }

    fn arm_readiness_timer(&mut self, peripheral: A::Peripheral) {
        self.cancel_readiness_timer();
        self.transport_generation += 1;
        let Some(delay) = self.ready_timeout else {
            return;
        };

        let tx = self.timeout_tx.clone();
        let generation = self.transport_generation;
        self.readiness_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(ReadinessTimeout {
                peripheral,
                generation,
            });
        }));
    }

    fn cancel_readiness_timer(&mut self) {
        if let Some(timer) = self.readiness_timer.take() {
            timer.abort();
        }
    }

    /// Write bytes from the local endpoint to the peripheral
    pub fn handle_outbound(&mut self, data: &[u8]) {
        if let Err(e) = self.manager.write_data(data) {
            warn!("[BRIDGE] Dropped {} bytes: {}", data.len(), e);
        }
        self.dispatch();
    }

    fn dispatch(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                ConnectionEvent::Connected => match self.manager.hardware_revision() {
                    Some(revision) => info!("[BRIDGE] UART link up (hardware {})", revision),
                    None => info!("[BRIDGE] UART link up"),
                },
                ConnectionEvent::Disconnected => info!("[BRIDGE] UART link down"),
                ConnectionEvent::Received { data, text } => {
                    if let Some(text) = text.as_deref() {
                        trace!("[BRIDGE] Received {:?}", text);
                    }
                    if self.inbound_tx.send(data).is_err() {
                        debug!("[BRIDGE] No endpoint for received bytes");
                    }
                }
                ConnectionEvent::Error(e) => warn!("[BRIDGE] {}", e),
            }
        }
    }

    /// Run until `shutdown` resolves or the local endpoint goes away, then
    /// tear the link down
    pub async fn run(
        mut self,
        mut radio_rx: mpsc::UnboundedReceiver<RadioEvent<A::Peripheral>>,
        mut outbound_rx: mpsc::Receiver<Bytes>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                event = radio_rx.recv() => {
                    let Some(event) = event else {
                        return Err(anyhow!("radio event stream closed"));
                    };
                    self.handle_radio_event(event);
                }

                Some(timeout) = self.timeout_rx.recv() => {
                    self.handle_readiness_timeout(timeout);
                }

                data = outbound_rx.recv() => {
                    match data {
                        Some(data) => self.handle_outbound(&data),
                        None => {
                            info!("[BRIDGE] Local endpoint finished");
                            break;
                        }
                    }
                }

                _ = &mut shutdown => {
                    info!("[BRIDGE] Shutting down");
                    break;
                }
            }
        }

        self.teardown(&mut radio_rx).await;
        Ok(())
    }

    async fn teardown(
        &mut self,
        radio_rx: &mut mpsc::UnboundedReceiver<RadioEvent<A::Peripheral>>,
    ) {
        self.manager.set_auto_connect(false);
        if self.manager.session().is_none() {
            return;
        }
        self.manager.disconnect();

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while self.manager.session().is_some() {
                match radio_rx.recv().await {
                    Some(event) => self.handle_radio_event(event),
                    None => break,
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("[BRIDGE] Peripheral did not report the disconnect in time");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nrfuart_core::{
        uuids, CharProperties, CharacteristicInfo, ConnectedPeripheral, ConnectionStatus,
        RadioPowerState, ServiceInfo, WriteType,
    };
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    const TARGET: &str = "Adafruit Bluefruit LE";
    const PERIPHERAL: u8 = 7;

    /// Adapter that answers every request immediately and records writes
    struct FakeRadio {
        events: mpsc::UnboundedSender<RadioEvent<u8>>,
        writes: Arc<Mutex<Vec<(Vec<u8>, WriteType)>>>,
        device_info: bool,
        linked: bool,
    }

    fn uart_service() -> ServiceInfo {
        ServiceInfo {
            uuid: uuids::UART_SERVICE,
            handle: 1,
        }
    }

    fn info_service() -> ServiceInfo {
        ServiceInfo {
            uuid: uuids::DEVICE_INFORMATION_SERVICE,
            handle: 2,
        }
    }

    fn characteristic(
        uuid: Uuid,
        service: u16,
        handle: u16,
        properties: CharProperties,
    ) -> CharacteristicInfo {
        CharacteristicInfo {
            uuid,
            service,
            handle,
            properties,
        }
    }

    impl RadioAdapter for FakeRadio {
        type Peripheral = u8;

        fn connected_peripherals(&self, _services: &[Uuid]) -> Vec<ConnectedPeripheral<u8>> {
            Vec::new()
        }

        fn scan(&mut self, _services: &[Uuid], _allow_duplicates: bool) {}

        fn stop_scan(&mut self) {}

        fn connect(&mut self, peripheral: &u8) {
            self.linked = true;
            let _ = self.events.send(RadioEvent::Connected(*peripheral));
        }

        fn cancel_connection(&mut self, peripheral: &u8) {
            if std::mem::take(&mut self.linked) {
                let _ = self.events.send(RadioEvent::Disconnected {
                    peripheral: *peripheral,
                    error: None,
                });
            }
        }

        fn services(&self, _peripheral: &u8) -> Option<Vec<ServiceInfo>> {
            None
        }

        fn characteristics(
            &self,
            _peripheral: &u8,
            _service: &ServiceInfo,
        ) -> Option<Vec<CharacteristicInfo>> {
            None
        }

        fn discover_services(&mut self, peripheral: &u8, _services: &[Uuid]) {
            let mut services = vec![uart_service()];
            if self.device_info {
                services.push(info_service());
            }
            let _ = self.events.send(RadioEvent::ServicesDiscovered {
                peripheral: *peripheral,
                result: Ok(services),
            });
        }

        fn discover_characteristics(
            &mut self,
            peripheral: &u8,
            service: &ServiceInfo,
            _characteristics: &[Uuid],
        ) {
            let found = if service.uuid == uuids::UART_SERVICE {
                vec![
                    characteristic(uuids::RX_CHARACTERISTIC, 1, 11, CharProperties {
                        notify: true,
                        ..Default::default()
                    }),
                    characteristic(uuids::TX_CHARACTERISTIC, 1, 12, CharProperties {
                        write_without_response: true,
                        ..Default::default()
                    }),
                ]
            } else {
                vec![characteristic(uuids::HARDWARE_REVISION_STRING, 2, 21, CharProperties {
                    read: true,
                    ..Default::default()
                })]
            };
            let _ = self.events.send(RadioEvent::CharacteristicsDiscovered {
                peripheral: *peripheral,
                service: service.clone(),
                result: Ok(found),
            });
        }

        fn set_notify(
            &mut self,
            peripheral: &u8,
            characteristic: &CharacteristicInfo,
            enabled: bool,
        ) {
            let _ = self.events.send(RadioEvent::NotifyStateUpdated {
                peripheral: *peripheral,
                characteristic: characteristic.clone(),
                result: Ok(enabled),
            });
        }

        fn read_value(&mut self, peripheral: &u8, characteristic: &CharacteristicInfo) {
            let _ = self.events.send(RadioEvent::ValueUpdated {
                peripheral: *peripheral,
                characteristic: characteristic.clone(),
                result: Ok(b"QFAAG".to_vec()),
            });
        }

        fn write_value(
            &mut self,
            _peripheral: &u8,
            _characteristic: &CharacteristicInfo,
            value: &[u8],
            write_type: WriteType,
        ) {
            if let Ok(mut writes) = self.writes.lock() {
                writes.push((value.to_vec(), write_type));
            }
        }
    }

    struct Harness {
        link: UartLink<FakeRadio>,
        radio_rx: mpsc::UnboundedReceiver<RadioEvent<u8>>,
        inbound_rx: mpsc::UnboundedReceiver<Bytes>,
        writes: Arc<Mutex<Vec<(Vec<u8>, WriteType)>>>,
    }

    fn harness(device_info: bool, auto_connect: bool) -> Harness {
        let (radio_tx, radio_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let writes = Arc::new(Mutex::new(Vec::new()));
        let radio = FakeRadio {
            events: radio_tx,
            writes: writes.clone(),
            device_info,
            linked: false,
        };
        let config = ManagerConfig {
            target: Some(TARGET.into()),
            auto_connect,
            ..Default::default()
        };
        Harness {
            link: UartLink::new(radio, config, None, inbound_tx),
            radio_rx,
            inbound_rx,
            writes,
        }
    }

    impl Harness {
        fn feed(&mut self, event: RadioEvent<u8>) {
            self.link.handle_radio_event(event);
            while let Ok(event) = self.radio_rx.try_recv() {
                self.link.handle_radio_event(event);
            }
        }

        fn power_on_and_discover(&mut self) {
            self.feed(RadioEvent::PowerStateChanged(RadioPowerState::On));
            self.feed(RadioEvent::Discovered {
                peripheral: PERIPHERAL,
                name: TARGET.into(),
                rssi: Some(-50),
            });
        }

        fn writes(&self) -> Vec<(Vec<u8>, WriteType)> {
            self.writes.lock().map(|w| w.clone()).unwrap_or_default()
        }
    }

    #[test]
    fn test_link_comes_up_and_bridges_bytes() {
        let mut h = harness(true, true);
        h.power_on_and_discover();

        assert_eq!(h.link.manager().status(), ConnectionStatus::Connected);
        assert_eq!(h.link.manager().hardware_revision(), Some("QFAAG"));

        h.link.handle_outbound(b"AT");
        assert_eq!(h.writes(), vec![(b"AT".to_vec(), WriteType::WithoutResponse)]);

        let rx = characteristic(uuids::RX_CHARACTERISTIC, 1, 11, CharProperties {
            notify: true,
            ..Default::default()
        });
        h.feed(RadioEvent::ValueUpdated {
            peripheral: PERIPHERAL,
            characteristic: rx,
            result: Ok(vec![0x48, 0x69]),
        });
        assert_eq!(h.inbound_rx.try_recv().unwrap(), Bytes::from_static(b"Hi"));
    }

    #[test]
    fn test_outbound_dropped_until_ready() {
        let mut h = harness(false, true);
        h.power_on_and_discover();

        // No device information service, so the hardware revision never arrives
        assert_eq!(h.link.manager().status(), ConnectionStatus::Scanning);
        h.link.handle_outbound(b"lost");
        assert!(h.writes().is_empty());

        h.link.handle_readiness_timeout(ReadinessTimeout {
            peripheral: PERIPHERAL,
            generation: 1,
        });
        assert_eq!(h.link.manager().status(), ConnectionStatus::Connected);
        h.link.handle_outbound(b"sent");
        assert_eq!(h.writes().len(), 1);
    }

    #[test]
    fn test_timeout_of_earlier_link_ignored() {
        let mut h = harness(false, true);
        h.power_on_and_discover();
        assert_eq!(h.link.transport_generation, 1);

        // Link lost before readiness; the manager rescans and binds again
        h.feed(RadioEvent::Disconnected {
            peripheral: PERIPHERAL,
            error: Some("link lost".into()),
        });
        assert_eq!(h.link.manager().status(), ConnectionStatus::Scanning);
        h.feed(RadioEvent::Discovered {
            peripheral: PERIPHERAL,
            name: TARGET.into(),
            rssi: Some(-60),
        });
        assert_eq!(h.link.transport_generation, 2);
        assert!(h.link.manager().session().is_some_and(|s| s.is_uart_bound()));

        // The first link's timer must not promote the second link
        h.link.handle_readiness_timeout(ReadinessTimeout {
            peripheral: PERIPHERAL,
            generation: 1,
        });
        assert_eq!(h.link.manager().status(), ConnectionStatus::Scanning);
        h.link.handle_outbound(b"early");
        assert!(h.writes().is_empty());

        h.link.handle_readiness_timeout(ReadinessTimeout {
            peripheral: PERIPHERAL,
            generation: 2,
        });
        assert_eq!(h.link.manager().status(), ConnectionStatus::Connected);
    }

    #[test]
    fn test_connects_without_auto_connect() {
        let mut h = harness(true, false);
        // Deferred until the radio powers on
        assert_eq!(h.link.manager().target(), Some(TARGET));
        h.power_on_and_discover();
        assert_eq!(h.link.manager().status(), ConnectionStatus::Connected);

        // Transport loss does not reconnect
        h.feed(RadioEvent::Disconnected {
            peripheral: PERIPHERAL,
            error: Some("timeout".into()),
        });
        assert_eq!(h.link.manager().status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_run_times_out_readiness_and_shuts_down() {
        let (radio_tx, radio_rx) = mpsc::unbounded_channel();
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let writes = Arc::new(Mutex::new(Vec::new()));
        let radio = FakeRadio {
            events: radio_tx.clone(),
            writes: writes.clone(),
            device_info: false,
            linked: false,
        };
        let config = ManagerConfig {
            target: Some(TARGET.into()),
            ..Default::default()
        };
        let link = UartLink::new(radio, config, Some(Duration::from_millis(20)), inbound_tx);
        let task = tokio::spawn(link.run(radio_rx, outbound_rx, async {
            let _ = stop_rx.await;
        }));

        radio_tx
            .send(RadioEvent::PowerStateChanged(RadioPowerState::On))
            .unwrap();
        radio_tx
            .send(RadioEvent::Discovered {
                peripheral: PERIPHERAL,
                name: TARGET.into(),
                rssi: None,
            })
            .unwrap();

        // Writes are refused until the readiness timeout promotes the link
        let mut written = false;
        for _ in 0..100 {
            outbound_tx.send(Bytes::from_static(b"ping")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            if !writes.lock().unwrap().is_empty() {
                written = true;
                break;
            }
        }
        assert!(written);

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}
