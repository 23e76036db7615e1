//! BlueZ radio adapter
//!
//! Every request spawns a task on the tokio runtime; results are posted to
//! one unbounded channel that the link loop drains in order.

use anyhow::{anyhow, Context as _, Result};
use bluer::gatt::remote::{Characteristic, CharacteristicWriteRequest};
use bluer::gatt::WriteOp;
use bluer::{
    Adapter, AdapterEvent, AdapterProperty, Address, Device, DeviceEvent, DeviceProperty,
    DiscoveryFilter, DiscoveryTransport,
};
use futures::StreamExt;
use nrfuart_core::{
    uuids, CharProperties, CharacteristicInfo, ConnectedPeripheral, RadioAdapter, RadioEvent,
    RadioPowerState, ServiceInfo, WriteType,
};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// How long BlueZ may take to resolve services after a connect
const SERVICES_RESOLVE_TIMEOUT: Duration = Duration::from_secs(15);

type EventSender = mpsc::UnboundedSender<RadioEvent<Address>>;

/// A transport link BlueZ holds to a peripheral
#[derive(Debug, Clone, Default)]
struct Link {
    name: Option<String>,
    services: HashSet<Uuid>,
}

struct WriteJob {
    characteristic: CharacteristicInfo,
    value: Vec<u8>,
    write_type: WriteType,
}

struct Writer {
    jobs: mpsc::UnboundedSender<WriteJob>,
    task: JoinHandle<()>,
}

/// [`RadioAdapter`] backed by a BlueZ adapter
pub struct BluerRadio {
    adapter: Adapter,
    events: EventSender,
    power_task: JoinHandle<()>,
    scan_task: Option<JoinHandle<()>>,
    scan_services: HashSet<Uuid>,
    connecting: HashMap<Address, JoinHandle<()>>,
    cancelling: HashMap<Address, JoinHandle<()>>,
    /// Watches each linked peripheral for the link going down
    monitors: HashMap<Address, JoinHandle<()>>,
    /// Keyed by peripheral, service handle and characteristic handle
    notifiers: HashMap<(Address, u16, u16), JoinHandle<()>>,
    /// One writer per peripheral keeps TX writes in order
    writers: HashMap<Address, Writer>,
    advertised: HashMap<Address, String>,
    links: HashMap<Address, Link>,
    service_cache: HashMap<Address, Vec<ServiceInfo>>,
    characteristic_cache: HashMap<(Address, u16), Vec<CharacteristicInfo>>,
}

impl BluerRadio {
    /// Open the named BlueZ adapter, or the default one
    pub async fn open(
        adapter_name: Option<&str>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RadioEvent<Address>>)> {
        let session = bluer::Session::new()
            .await
            .context("connecting to bluetoothd")?;
        let adapter = match adapter_name {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };
        info!("[RADIO] Using adapter {} ({})", adapter.name(), adapter.address().await?);

        if let Err(e) = adapter.set_powered(true).await {
            warn!("[RADIO] Could not power on {}: {}", adapter.name(), e);
        }

        let (events, events_rx) = mpsc::unbounded_channel();
        let power_task = tokio::spawn(watch_power(adapter.clone(), events.clone()));

        let mut radio = Self {
            adapter,
            events,
            power_task,
            scan_task: None,
            scan_services: HashSet::new(),
            connecting: HashMap::new(),
            cancelling: HashMap::new(),
            monitors: HashMap::new(),
            notifiers: HashMap::new(),
            writers: HashMap::new(),
            advertised: HashMap::new(),
            links: HashMap::new(),
            service_cache: HashMap::new(),
            characteristic_cache: HashMap::new(),
        };
        radio.snapshot_links().await;
        Ok((radio, events_rx))
    }

    /// Record UART peripherals BlueZ is already connected to, with their
    /// resolved GATT database
    async fn snapshot_links(&mut self) {
        let addresses = match self.adapter.device_addresses().await {
            Ok(addresses) => addresses,
            Err(e) => {
                warn!("[RADIO] Unable to list devices: {}", e);
                return;
            }
        };

        for address in addresses {
            let Ok(device) = self.adapter.device(address) else {
                continue;
            };
            if !device.is_connected().await.unwrap_or(false) {
                continue;
            }
            let services = device.uuids().await.ok().flatten().unwrap_or_default();
            if !services.contains(&uuids::UART_SERVICE) {
                continue;
            }

            let name = device.name().await.ok().flatten();
            info!("[RADIO] {} ({:?}) is already connected", address, name);
            self.links.insert(address, Link { name, services });

            if !device.is_services_resolved().await.unwrap_or(false) {
                continue;
            }
            match gatt_snapshot(&device).await {
                Ok((services, characteristics)) => {
                    self.service_cache.insert(address, services);
                    for (service, found) in characteristics {
                        self.characteristic_cache.insert((address, service), found);
                    }
                }
                Err(e) => debug!("[RADIO] No GATT snapshot for {}: {:#}", address, e),
            }
        }
    }

    fn send(&self, event: RadioEvent<Address>) {
        let _ = self.events.send(event);
    }

    /// Drop every task and cache tied to `peripheral`
    fn forget(&mut self, peripheral: &Address) {
        self.links.remove(peripheral);
        if let Some(task) = self.connecting.remove(peripheral) {
            task.abort();
        }
        if let Some(task) = self.monitors.remove(peripheral) {
            task.abort();
        }
        if let Some(writer) = self.writers.remove(peripheral) {
            writer.task.abort();
        }
        self.notifiers.retain(|(address, _, _), task| {
            if address == peripheral {
                task.abort();
                false
            } else {
                true
            }
        });
        self.service_cache.remove(peripheral);
        self.characteristic_cache.retain(|(address, _), _| address != peripheral);
        self.advertised.remove(peripheral);
        if self
            .cancelling
            .get(peripheral)
            .is_some_and(|task| task.is_finished())
        {
            self.cancelling.remove(peripheral);
        }
    }

    fn forget_all(&mut self) {
        let peripherals: Vec<Address> = self
            .links
            .keys()
            .chain(self.connecting.keys())
            .chain(self.writers.keys())
            .copied()
            .collect();
        for peripheral in peripherals {
            self.forget(&peripheral);
        }
        for (_, task) in self.notifiers.drain() {
            task.abort();
        }
        self.stop_scan();
    }

    fn spawn_monitor(&mut self, peripheral: Address) {
        let Ok(device) = self.adapter.device(peripheral) else {
            return;
        };
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            let error = match watch_link(&device).await {
                Ok(()) => None,
                Err(e) => Some(format!("{:#}", e)),
            };
            let _ = events.send(RadioEvent::Disconnected { peripheral, error });
        });
        if let Some(previous) = self.monitors.insert(peripheral, task) {
            previous.abort();
        }
    }

    fn writer(&mut self, peripheral: Address) -> &mpsc::UnboundedSender<WriteJob> {
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let writer = self.writers.entry(peripheral).or_insert_with(|| {
            let (jobs, jobs_rx) = mpsc::unbounded_channel();
            let task = tokio::spawn(write_loop(adapter, peripheral, jobs_rx, events));
            Writer { jobs, task }
        });
        &writer.jobs
    }
}

impl RadioAdapter for BluerRadio {
    type Peripheral = Address;

    fn connected_peripherals(&self, services: &[Uuid]) -> Vec<ConnectedPeripheral<Address>> {
        self.links
            .iter()
            .filter(|(_, link)| services.iter().any(|uuid| link.services.contains(uuid)))
            .map(|(peripheral, link)| ConnectedPeripheral {
                peripheral: *peripheral,
                name: link.name.clone(),
            })
            .collect()
    }

    fn scan(&mut self, services: &[Uuid], allow_duplicates: bool) {
        self.stop_scan();
        self.scan_services = services.iter().copied().collect();
        self.advertised.clear();

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let filter = DiscoveryFilter {
            uuids: self.scan_services.clone(),
            transport: DiscoveryTransport::Le,
            duplicate_data: allow_duplicates,
            ..Default::default()
        };
        debug!("[RADIO] Scanning for {:?}", services);
        self.scan_task = Some(tokio::spawn(async move {
            if let Err(e) = run_scan(adapter, filter, events).await {
                warn!("[RADIO] Scan failed: {:#}", e);
            }
        }));
    }

    fn stop_scan(&mut self) {
        if let Some(task) = self.scan_task.take() {
            debug!("[RADIO] Scan stopped");
            task.abort();
        }
    }

    fn connect(&mut self, peripheral: &Address) {
        let peripheral = *peripheral;
        let device = match self.adapter.device(peripheral) {
            Ok(device) => device,
            Err(e) => {
                self.send(RadioEvent::ConnectFailed {
                    peripheral,
                    error: e.to_string(),
                });
                return;
            }
        };
        let pending_cancel = self.cancelling.remove(&peripheral);
        let events = self.events.clone();

        let task = tokio::spawn(async move {
            if let Some(pending) = pending_cancel {
                let _ = pending.await;
            }
            let event = match connect_device(&device).await {
                Ok(()) => RadioEvent::Connected(peripheral),
                Err(e) => RadioEvent::ConnectFailed {
                    peripheral,
                    error: e.to_string(),
                },
            };
            let _ = events.send(event);
        });
        if let Some(previous) = self.connecting.insert(peripheral, task) {
            previous.abort();
        }
    }

    fn cancel_connection(&mut self, peripheral: &Address) {
        prune_finished(&mut self.cancelling);
        let in_flight = match self.connecting.remove(peripheral) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        };
        let plan = cancel_plan(
            in_flight,
            self.links.contains_key(peripheral),
            self.monitors.contains_key(peripheral),
        );
        let CancelPlan::Disconnect { report } = plan else {
            trace!("[RADIO] Nothing to cancel for {}", peripheral);
            return;
        };

        // Without a monitor nothing else reports the link going away
        if report {
            self.send(RadioEvent::Disconnected {
                peripheral: *peripheral,
                error: None,
            });
        }

        let Ok(device) = self.adapter.device(*peripheral) else {
            return;
        };
        let address = *peripheral;
        let task = tokio::spawn(async move {
            if let Err(e) = device.disconnect().await {
                debug!("[RADIO] Disconnect of {} failed: {}", address, e);
            }
        });
        self.cancelling.insert(*peripheral, task);
    }

    fn services(&self, peripheral: &Address) -> Option<Vec<ServiceInfo>> {
        self.service_cache.get(peripheral).cloned()
    }

    fn characteristics(
        &self,
        peripheral: &Address,
        service: &ServiceInfo,
    ) -> Option<Vec<CharacteristicInfo>> {
        self.characteristic_cache
            .get(&(*peripheral, service.handle))
            .cloned()
    }

    fn discover_services(&mut self, peripheral: &Address, services: &[Uuid]) {
        let peripheral = *peripheral;
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let wanted: Vec<Uuid> = services.to_vec();
        tokio::spawn(async move {
            let result = discover_services(&adapter, peripheral, &wanted)
                .await
                .map_err(|e| format!("{:#}", e));
            let _ = events.send(RadioEvent::ServicesDiscovered { peripheral, result });
        });
    }

    fn discover_characteristics(
        &mut self,
        peripheral: &Address,
        service: &ServiceInfo,
        characteristics: &[Uuid],
    ) {
        let peripheral = *peripheral;
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let service = service.clone();
        let wanted: Vec<Uuid> = characteristics.to_vec();
        tokio::spawn(async move {
            let result = discover_characteristics(&adapter, peripheral, &service, &wanted)
                .await
                .map_err(|e| format!("{:#}", e));
            let _ = events.send(RadioEvent::CharacteristicsDiscovered {
                peripheral,
                service,
                result,
            });
        });
    }

    fn set_notify(
        &mut self,
        peripheral: &Address,
        characteristic: &CharacteristicInfo,
        enabled: bool,
    ) {
        let key = (*peripheral, characteristic.service, characteristic.handle);
        if let Some(task) = self.notifiers.remove(&key) {
            task.abort();
        }

        let peripheral = *peripheral;
        let characteristic = characteristic.clone();
        if !enabled {
            self.send(RadioEvent::NotifyStateUpdated {
                peripheral,
                characteristic,
                result: Ok(false),
            });
            return;
        }

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            let resolved = resolve(&adapter, peripheral, &characteristic).await;
            let remote = match resolved {
                Ok(remote) => remote,
                Err(e) => return notify_failed(&events, peripheral, characteristic, e),
            };
            let subscribed = remote.notify().await;
            let notifications = match subscribed {
                Ok(notifications) => notifications,
                Err(e) => return notify_failed(&events, peripheral, characteristic, e),
            };
            let _ = events.send(RadioEvent::NotifyStateUpdated {
                peripheral,
                characteristic: characteristic.clone(),
                result: Ok(true),
            });

            futures::pin_mut!(notifications);
            while let Some(value) = notifications.next().await {
                let _ = events.send(RadioEvent::ValueUpdated {
                    peripheral,
                    characteristic: characteristic.clone(),
                    result: Ok(value),
                });
            }
            debug!("[RADIO] Notifications from {} ended", peripheral);
        });
        self.notifiers.insert(key, task);
    }

    fn read_value(&mut self, peripheral: &Address, characteristic: &CharacteristicInfo) {
        let peripheral = *peripheral;
        let characteristic = characteristic.clone();
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = match resolve(&adapter, peripheral, &characteristic).await {
                Ok(remote) => remote.read().await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            let _ = events.send(RadioEvent::ValueUpdated {
                peripheral,
                characteristic,
                result,
            });
        });
    }

    fn write_value(
        &mut self,
        peripheral: &Address,
        characteristic: &CharacteristicInfo,
        value: &[u8],
        write_type: WriteType,
    ) {
        let job = WriteJob {
            characteristic: characteristic.clone(),
            value: value.to_vec(),
            write_type,
        };
        if self.writer(*peripheral).send(job).is_err() {
            warn!("[RADIO] Writer for {} is gone", peripheral);
            self.writers.remove(peripheral);
        }
    }

    fn observe(&mut self, event: &RadioEvent<Address>) {
        match event {
            RadioEvent::PowerStateChanged(RadioPowerState::Off) => self.forget_all(),
            RadioEvent::PowerStateChanged(RadioPowerState::On) => {}
            RadioEvent::Discovered {
                peripheral, name, ..
            } => {
                self.advertised.insert(*peripheral, name.clone());
            }
            RadioEvent::Connected(peripheral) => {
                self.connecting.remove(peripheral);
                let services = self.scan_services.clone();
                let link = self
                    .links
                    .entry(*peripheral)
                    .or_insert_with(|| Link { name: None, services });
                if link.name.is_none() {
                    link.name = self.advertised.get(peripheral).cloned();
                }
                self.spawn_monitor(*peripheral);
            }
            RadioEvent::ConnectFailed { peripheral, .. } => {
                self.connecting.remove(peripheral);
            }
            RadioEvent::Disconnected { peripheral, .. } => self.forget(peripheral),
            RadioEvent::ServicesDiscovered { peripheral, result } => match result {
                Ok(services) => {
                    self.service_cache.insert(*peripheral, services.clone());
                }
                Err(_) => {
                    self.service_cache.remove(peripheral);
                }
            },
            RadioEvent::CharacteristicsDiscovered {
                peripheral,
                service,
                result,
            } => match result {
                Ok(found) => {
                    self.characteristic_cache
                        .insert((*peripheral, service.handle), found.clone());
                }
                Err(_) => {
                    self.characteristic_cache.remove(&(*peripheral, service.handle));
                }
            },
            RadioEvent::NotifyStateUpdated { .. }
            | RadioEvent::ValueUpdated { .. }
            | RadioEvent::ValueWritten { .. } => {}
        }
    }
}

impl Drop for BluerRadio {
    fn drop(&mut self) {
        self.power_task.abort();
        self.forget_all();
        for (_, task) in self.cancelling.drain() {
            task.abort();
        }
    }
}

/// What `cancel_connection` has to do for a peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelPlan {
    Nothing,
    /// Tear the link down. `report` is set when no monitor will see it go.
    Disconnect { report: bool },
}

fn cancel_plan(in_flight: bool, linked: bool, monitored: bool) -> CancelPlan {
    if !in_flight && !linked {
        return CancelPlan::Nothing;
    }
    CancelPlan::Disconnect { report: !monitored }
}

/// Drop handles of tasks that already ran to completion
fn prune_finished<K>(tasks: &mut HashMap<K, JoinHandle<()>>) {
    tasks.retain(|_, task| !task.is_finished());
}

/// Report the initial power state, then every change
async fn watch_power(adapter: Adapter, events: EventSender) {
    let powered = adapter.is_powered().await.unwrap_or(false);
    let _ = events.send(RadioEvent::PowerStateChanged(power_state(powered)));

    let stream = match adapter.events().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("[RADIO] Unable to watch adapter power: {}", e);
            return;
        }
    };
    futures::pin_mut!(stream);
    while let Some(event) = stream.next().await {
        if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
            let _ = events.send(RadioEvent::PowerStateChanged(power_state(powered)));
        }
    }
}

fn notify_failed(
    events: &EventSender,
    peripheral: Address,
    characteristic: CharacteristicInfo,
    error: bluer::Error,
) {
    let _ = events.send(RadioEvent::NotifyStateUpdated {
        peripheral,
        characteristic,
        result: Err(error.to_string()),
    });
}

fn power_state(powered: bool) -> RadioPowerState {
    if powered {
        RadioPowerState::On
    } else {
        RadioPowerState::Off
    }
}

async fn run_scan(adapter: Adapter, filter: DiscoveryFilter, events: EventSender) -> Result<()> {
    adapter.set_discovery_filter(filter).await?;
    let discover = adapter.discover_devices().await?;
    futures::pin_mut!(discover);

    while let Some(event) = discover.next().await {
        let AdapterEvent::DeviceAdded(address) = event else {
            continue;
        };
        let device = adapter.device(address)?;
        let Ok(Some(name)) = device.name().await else {
            trace!("[RADIO] Skipping unnamed {}", address);
            continue;
        };
        let rssi = device.rssi().await.ok().flatten();
        let _ = events.send(RadioEvent::Discovered {
            peripheral: address,
            name,
            rssi,
        });
    }
    Ok(())
}

async fn connect_device(device: &Device) -> bluer::Result<()> {
    if device.is_connected().await? {
        return Ok(());
    }
    device.connect().await
}

/// Resolves when BlueZ reports the link down
async fn watch_link(device: &Device) -> Result<()> {
    let stream = device.events().await?;
    futures::pin_mut!(stream);
    if !device.is_connected().await? {
        return Ok(());
    }
    while let Some(event) = stream.next().await {
        if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
            return Ok(());
        }
    }
    Err(anyhow!("device event stream ended"))
}

async fn wait_services_resolved(device: &Device) -> Result<()> {
    let stream = device.events().await?;
    futures::pin_mut!(stream);
    if device.is_services_resolved().await? {
        return Ok(());
    }

    let resolved = tokio::time::timeout(SERVICES_RESOLVE_TIMEOUT, async {
        while let Some(event) = stream.next().await {
            if let DeviceEvent::PropertyChanged(DeviceProperty::ServicesResolved(true)) = event {
                return true;
            }
        }
        false
    })
    .await;
    match resolved {
        Ok(true) => Ok(()),
        Ok(false) => Err(anyhow!("device went away before services resolved")),
        Err(_) => Err(anyhow!("services not resolved within {:?}", SERVICES_RESOLVE_TIMEOUT)),
    }
}

async fn discover_services(
    adapter: &Adapter,
    peripheral: Address,
    wanted: &[Uuid],
) -> Result<Vec<ServiceInfo>> {
    let device = adapter.device(peripheral)?;
    wait_services_resolved(&device).await?;

    let mut found = Vec::new();
    for service in device.services().await? {
        let uuid = service.uuid().await?;
        if wanted.contains(&uuid) {
            found.push(ServiceInfo {
                uuid,
                handle: service.id(),
            });
        }
    }
    Ok(found)
}

async fn discover_characteristics(
    adapter: &Adapter,
    peripheral: Address,
    service: &ServiceInfo,
    wanted: &[Uuid],
) -> Result<Vec<CharacteristicInfo>> {
    let remote = adapter.device(peripheral)?.service(service.handle).await?;
    let mut found = Vec::new();
    for characteristic in remote.characteristics().await? {
        let info = characteristic_info(service.handle, &characteristic).await?;
        if wanted.contains(&info.uuid) {
            found.push(info);
        }
    }
    Ok(found)
}

async fn characteristic_info(
    service: u16,
    characteristic: &Characteristic,
) -> bluer::Result<CharacteristicInfo> {
    let flags = characteristic.flags().await?;
    Ok(CharacteristicInfo {
        uuid: characteristic.uuid().await?,
        service,
        handle: characteristic.id(),
        properties: CharProperties {
            read: flags.read,
            write: flags.write,
            write_without_response: flags.write_without_response,
            notify: flags.notify,
        },
    })
}

type GattSnapshot = (Vec<ServiceInfo>, HashMap<u16, Vec<CharacteristicInfo>>);

/// Every service and characteristic of an already resolved device
async fn gatt_snapshot(device: &Device) -> Result<GattSnapshot> {
    let mut services = Vec::new();
    let mut characteristics = HashMap::new();
    for service in device.services().await? {
        let handle = service.id();
        services.push(ServiceInfo {
            uuid: service.uuid().await?,
            handle,
        });
        let mut found = Vec::new();
        for characteristic in service.characteristics().await? {
            found.push(characteristic_info(handle, &characteristic).await?);
        }
        characteristics.insert(handle, found);
    }
    Ok((services, characteristics))
}

async fn resolve(
    adapter: &Adapter,
    peripheral: Address,
    characteristic: &CharacteristicInfo,
) -> bluer::Result<Characteristic> {
    adapter
        .device(peripheral)?
        .service(characteristic.service)
        .await?
        .characteristic(characteristic.handle)
        .await
}

async fn write_loop(
    adapter: Adapter,
    peripheral: Address,
    mut jobs: mpsc::UnboundedReceiver<WriteJob>,
    events: EventSender,
) {
    let mut resolved: Option<(CharacteristicInfo, Characteristic)> = None;

    while let Some(job) = jobs.recv().await {
        let result = write_one(&adapter, peripheral, &mut resolved, &job).await;
        if let Err(e) = &result {
            warn!("[RADIO] Write of {} bytes to {} failed: {}", job.value.len(), peripheral, e);
            resolved = None;
        }
        if job.write_type == WriteType::WithResponse || result.is_err() {
            let _ = events.send(RadioEvent::ValueWritten {
                peripheral,
                characteristic: job.characteristic,
                result: result.map_err(|e| e.to_string()),
            });
        }
    }
}

async fn write_one(
    adapter: &Adapter,
    peripheral: Address,
    resolved: &mut Option<(CharacteristicInfo, Characteristic)>,
    job: &WriteJob,
) -> bluer::Result<()> {
    let cached = resolved
        .as_ref()
        .filter(|(info, _)| {
            info.service == job.characteristic.service && info.handle == job.characteristic.handle
        })
        .map(|(_, remote)| remote.clone());
    let remote = match cached {
        Some(remote) => remote,
        None => {
            let remote = resolve(adapter, peripheral, &job.characteristic).await?;
            *resolved = Some((job.characteristic.clone(), remote.clone()));
            remote
        }
    };

    let request = CharacteristicWriteRequest {
        op_type: match job.write_type {
            WriteType::WithResponse => WriteOp::Request,
            WriteType::WithoutResponse => WriteOp::Command,
        },
        ..Default::default()
    };
    remote.write_ext(&job.value, &request).await
}
