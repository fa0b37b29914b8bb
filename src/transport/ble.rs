//! BlueZ GATT transport for iDotMatrix displays

use crate::transport::discovery::{DeviceScanner, ScanConfig};
use crate::transport::traits::{
    DeviceAddress, DisconnectCallback, LinkHandle, LinkTransport, TransportError,
};
use async_trait::async_trait;
use bluer::gatt::remote::{Characteristic, CharacteristicWriteRequest};
use bluer::gatt::WriteOp;
use bluer::{Adapter, Address, Device, DeviceEvent, DeviceProperty, ErrorKind, Uuid};
use futures::{Stream, StreamExt};
use idm_protocol::gatt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Configuration for the BlueZ transport
#[derive(Debug, Clone)]
pub struct BleConfig {
    /// Discovery configuration
    pub scan: ScanConfig,
    /// How long to wait for GATT services after the link is up
    pub services_timeout: Duration,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            scan: ScanConfig::default(),
            services_timeout: Duration::from_secs(10),
        }
    }
}

type CallbackSlot = Arc<Mutex<Option<DisconnectCallback>>>;

struct ActiveLink {
    device: Device,
    write_char: Characteristic,
    read_char: Characteristic,
    /// Write limit from the last MTU query
    max_write: usize,
    /// Set before an explicit disconnect so the watcher stays quiet
    closing: Arc<AtomicBool>,
    callback: CallbackSlot,
    watcher: JoinHandle<()>,
}

/// GATT client talking to the display's vendor characteristics
pub struct BleTransport {
    adapter: Adapter,
    config: BleConfig,
    links: Mutex<HashMap<u64, ActiveLink>>,
    next_id: AtomicU64,
}

impl BleTransport {
    /// Open the default adapter and power it on
    pub async fn new(config: BleConfig) -> Result<Self, TransportError> {
        let adapter = DeviceScanner::get_adapter()
            .await
            .map_err(map_bluer_error)?;
        info!("[BLE] Using adapter {}", adapter.name());

        Ok(Self {
            adapter,
            config,
            links: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        })
    }

    fn lock_links(&self) -> MutexGuard<'_, HashMap<u64, ActiveLink>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write characteristic of a link together with its cached write limit
    fn writable(&self, handle: &LinkHandle) -> Result<(Characteristic, usize), TransportError> {
        self.lock_links()
            .get(&handle.id())
            .map(|link| (link.write_char.clone(), link.max_write))
            .ok_or(TransportError::NotConnected)
    }

    fn read_characteristic(&self, handle: &LinkHandle) -> Result<Characteristic, TransportError> {
        self.lock_links()
            .get(&handle.id())
            .map(|link| link.read_char.clone())
            .ok_or(TransportError::NotConnected)
    }

    async fn wait_for_services(&self, device: &Device) -> Result<(), TransportError> {
        let deadline = Instant::now() + self.config.services_timeout;

        loop {
            if device
                .is_services_resolved()
                .await
                .map_err(map_bluer_error)?
            {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout);
            }
            sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Locate the vendor write and read characteristics
async fn find_characteristics(
    device: &Device,
) -> Result<(Characteristic, Characteristic), TransportError> {
    let write_uuid = Uuid::from_u128(gatt::WRITE_CHARACTERISTIC_UUID);
    let read_uuid = Uuid::from_u128(gatt::READ_CHARACTERISTIC_UUID);

    let mut write_char = None;
    let mut read_char = None;

    for service in device.services().await.map_err(map_bluer_error)? {
        for characteristic in service.characteristics().await.map_err(map_bluer_error)? {
            let uuid = characteristic.uuid().await.map_err(map_bluer_error)?;
            debug!("[BLE]   Characteristic {}", uuid);

            if uuid == write_uuid {
                write_char = Some(characteristic);
            } else if uuid == read_uuid {
                read_char = Some(characteristic);
            }
        }
    }

    match (write_char, read_char) {
        (Some(write_char), Some(read_char)) => Ok((write_char, read_char)),
        _ => Err(TransportError::Backend(
            "display characteristics not found".into(),
        )),
    }
}

/// Largest write the negotiated MTU allows
fn write_limit(mtu: usize) -> usize {
    mtu.saturating_sub(gatt::ATT_HEADER_SIZE)
        .max(gatt::DEFAULT_WRITE_SIZE)
}

async fn query_write_limit(characteristic: &Characteristic) -> usize {
    match characteristic.mtu().await {
        Ok(mtu) => write_limit(mtu),
        Err(e) => {
            debug!("[BLE] MTU unavailable ({}), using default write size", e);
            gatt::DEFAULT_WRITE_SIZE
        }
    }
}

/// Hand `result` back, running `cleanup` first when it is an error
async fn undo_on_error<T>(
    result: Result<T, TransportError>,
    cleanup: impl Future<Output = ()>,
) -> Result<T, TransportError> {
    if result.is_err() {
        cleanup.await;
    }
    result
}

/// Fire the registered callback when the device reports `Connected(false)`
async fn watch_link<S>(address: DeviceAddress, events: S, closing: Arc<AtomicBool>, callback: CallbackSlot)
where
    S: Stream<Item = DeviceEvent> + Send,
{
    tokio::pin!(events);

    while let Some(event) = events.next().await {
        if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
            if closing.load(Ordering::SeqCst) {
                break;
            }

            warn!("[BLE] Link to {} dropped", address);
            if let Some(callback) = callback
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
            {
                callback();
            }
            break;
        }
    }
}

fn map_bluer_error(err: bluer::Error) -> TransportError {
    match err.kind {
        ErrorKind::NotPermitted | ErrorKind::NotAuthorized => TransportError::NotPermitted,
        ErrorKind::NotConnected => TransportError::NotConnected,
        ErrorKind::InProgress | ErrorKind::AlreadyConnected => TransportError::Busy,
        _ => TransportError::Backend(err.to_string()),
    }
}

#[async_trait]
impl LinkTransport for BleTransport {
    async fn discover(&self, name_prefix: &str) -> Result<Vec<DeviceAddress>, TransportError> {
        let scanner = DeviceScanner::new(ScanConfig {
            name_prefix: name_prefix.into(),
            ..self.config.scan.clone()
        });

        let devices = scanner.scan(&self.adapter).await.map_err(map_bluer_error)?;

        Ok(devices
            .into_iter()
            .map(|d| DeviceAddress::new(d.address.to_string()))
            .collect())
    }

    async fn connect(&self, address: &DeviceAddress) -> Result<LinkHandle, TransportError> {
        let addr: Address = address.as_str().parse().map_err(|_| {
            TransportError::Backend(format!("Invalid Bluetooth address: {}", address))
        })?;
        let device = self.adapter.device(addr).map_err(map_bluer_error)?;

        debug!("[BLE] Connecting to {}", address);
        device.connect().await.map_err(|e| match e.kind {
            ErrorKind::DoesNotExist | ErrorKind::NotFound => {
                TransportError::DeviceNotFound(address.clone())
            }
            _ => map_bluer_error(e),
        })?;

        let setup = async {
            self.wait_for_services(&device).await?;
            let (write_char, read_char) = find_characteristics(&device).await?;
            let events = device.events().await.map_err(map_bluer_error)?;
            let max_write = query_write_limit(&write_char).await;
            Ok::<_, TransportError>((write_char, read_char, events, max_write))
        }
        .await;

        // Do not leave a half-set-up link behind
        let (write_char, read_char, events, max_write) = undo_on_error(setup, async {
            let _ = device.disconnect().await;
        })
        .await?;

        let closing = Arc::new(AtomicBool::new(false));
        let callback: CallbackSlot = Arc::new(Mutex::new(None));
        let watcher = tokio::spawn(watch_link(
            address.clone(),
            events,
            closing.clone(),
            callback.clone(),
        ));

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.lock_links().insert(
            id,
            ActiveLink {
                device,
                write_char,
                read_char,
                max_write,
                closing,
                callback,
                watcher,
            },
        );

        info!("[BLE] Connected to {} ({} byte writes)", address, max_write);
        Ok(LinkHandle::new(id, address.clone()))
    }

    async fn disconnect(&self, handle: &LinkHandle) -> Result<(), TransportError> {
        let Some(link) = self.lock_links().remove(&handle.id()) else {
            return Ok(());
        };

        link.closing.store(true, Ordering::SeqCst);
        link.watcher.abort();

        match link.device.disconnect().await {
            Ok(()) => {
                info!("[BLE] Disconnected from {}", handle.address());
                Ok(())
            }
            Err(e) if e.kind == ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(map_bluer_error(e)),
        }
    }

    async fn write(
        &self,
        handle: &LinkHandle,
        data: &[u8],
        confirm: bool,
    ) -> Result<(), TransportError> {
        let (characteristic, max) = self.writable(handle)?;
        if data.len() > max {
            return Err(TransportError::PayloadTooLarge {
                len: data.len(),
                max,
            });
        }

        let request = CharacteristicWriteRequest {
            op_type: if confirm {
                WriteOp::Request
            } else {
                WriteOp::Command
            },
            ..Default::default()
        };

        characteristic
            .write_ext(data, &request)
            .await
            .map_err(map_bluer_error)
    }

    async fn read(&self, handle: &LinkHandle) -> Result<Vec<u8>, TransportError> {
        self.read_characteristic(handle)?
            .read()
            .await
            .map_err(map_bluer_error)
    }

    /// Re-query the MTU; `write` checks against the value cached here
    async fn max_write_size(&self, handle: &LinkHandle) -> Result<usize, TransportError> {
        let (characteristic, _) = self.writable(handle)?;
        let max_write = query_write_limit(&characteristic).await;

        match self.lock_links().get_mut(&handle.id()) {
            Some(link) => {
                link.max_write = max_write;
                Ok(max_write)
            }
            None => Err(TransportError::NotConnected),
        }
    }

    fn on_unsolicited_disconnect(&self, handle: &LinkHandle, callback: DisconnectCallback) {
        match self.lock_links().get(&handle.id()) {
            Some(link) => {
                *link
                    .callback
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(callback);
            }
            None => warn!(
                "[BLE] Cannot watch {}: link is already closed",
                handle.address()
            ),
        }
    }

    fn name(&self) -> &'static str {
        "BlueZ"
    }
}
