use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::{BoxStream, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use crate::codec::{bytes_to_text, text_to_bytes};
use crate::transport::{
    Device, DeviceId, DisconnectListener, DisconnectRegistry, Subscription, Transport,
};
use crate::{Error, Result};

/// Gets the default Bluetooth adapter
#[instrument(skip(manager))]
async fn get_central(manager: &Manager) -> Result<Adapter> {
    debug!("Getting default Bluetooth adapter");
    let adapters = manager.adapters().await.map_err(|e| classify(e, Error::Connection))?;
    let Some(adapter) = adapters.into_iter().next() else {
        error!("No Bluetooth adapters found");
        return Err(Error::NoBluetoothAdapters);
    };

    debug!("Using Bluetooth adapter");
    Ok(adapter)
}

/// Keeps permission problems distinct, wraps everything else with `wrap`
fn classify(error: btleplug::Error, wrap: fn(String) -> Error) -> Error {
    match error {
        btleplug::Error::PermissionDenied => {
            Error::PermissionDenied("platform Bluetooth permission not granted".into())
        }
        other => wrap(other.to_string()),
    }
}

fn device_from(peripheral: &Peripheral, properties: Option<PeripheralProperties>) -> Device {
    let mut device = Device::new(peripheral.id().to_string());
    if let Some(properties) = properties {
        device.name = properties.local_name;
        device.rssi = properties.rssi;
        device.services = properties.services.into_iter().collect();
    }
    device
}

/// [`Transport`] backed by the platform BLE stack through btleplug
pub struct BtleTransport {
    adapter: Adapter,
    registry: DisconnectRegistry,
    disconnect_watcher: JoinHandle<()>,
}

impl BtleTransport {
    /// Opens the first adapter and starts watching for disconnects
    #[instrument]
    pub async fn new() -> Result<Self> {
        info!("Initializing BLE transport");
        let manager = Manager::new()
            .await
            .map_err(|e| classify(e, Error::Connection))?;
        let adapter = get_central(&manager).await?;

        let registry = DisconnectRegistry::new();
        let mut events = adapter
            .events()
            .await
            .map_err(|e| classify(e, Error::Connection))?;
        let watcher_registry = registry.clone();
        // The stack reports local and remote disconnects on the same stream.
        let disconnect_watcher = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    let id = DeviceId::new(id.to_string());
                    let notified = watcher_registry.notify(&id);
                    info!("Device {} disconnected ({} listener(s))", id, notified);
                }
            }
            debug!("Adapter event stream ended");
        });

        Ok(Self {
            adapter,
            registry,
            disconnect_watcher,
        })
    }

    /// Fails unless the adapter reports it is powered on
    async fn ensure_powered(&self) -> Result<()> {
        match self.adapter.adapter_state().await {
            Ok(CentralState::PoweredOn) => Ok(()),
            Ok(state) => {
                warn!("Bluetooth adapter is {:?}", state);
                Err(Error::AdapterUnavailable(format!("{state:?}")))
            }
            Err(e) => {
                // Some backends cannot report the state, let the operation try.
                debug!("Adapter state unavailable: {}", e);
                Ok(())
            }
        }
    }

    async fn find_peripheral(&self, id: &DeviceId) -> Result<Option<Peripheral>> {
        let wanted = id.as_str().to_lowercase();
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| classify(e, Error::Connection))?;
        Ok(peripherals.into_iter().find(|p| {
            p.id().to_string().to_lowercase() == wanted
                || p.address().to_string().to_lowercase() == wanted
        }))
    }

    fn characteristic(
        peripheral: &Peripheral,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == service && c.uuid == characteristic)
            .ok_or(Error::CharacteristicNotFound(characteristic))
    }
}

impl Drop for BtleTransport {
    fn drop(&mut self) {
        self.disconnect_watcher.abort();
    }
}

#[async_trait]
impl Transport for BtleTransport {
    type Handle = Peripheral;

    async fn scan(&self) -> Result<BoxStream<'static, Result<Device>>> {
        self.ensure_powered().await.map_err(|e| match e {
            Error::AdapterUnavailable(state) => Error::Scan(format!("adapter is {state}")),
            other => other,
        })?;

        let events = self
            .adapter
            .events()
            .await
            .map_err(|e| classify(e, Error::Scan))?;
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| classify(e, Error::Scan))?;
        debug!("Adapter scan started");

        let adapter = self.adapter.clone();
        let devices = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => return None,
                };
                let peripheral = match adapter.peripheral(&id).await {
                    Ok(peripheral) => peripheral,
                    Err(e) => {
                        debug!("Discovered peripheral vanished: {}", e);
                        return None;
                    }
                };
                match peripheral.properties().await {
                    Ok(properties) => Some(Ok(device_from(&peripheral, properties))),
                    Err(btleplug::Error::PermissionDenied) => Some(Err(Error::PermissionDenied(
                        "platform Bluetooth permission not granted".into(),
                    ))),
                    Err(e) => {
                        trace!("No properties for {}: {}", id, e);
                        None
                    }
                }
            }
        });

        Ok(devices.boxed())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| classify(e, Error::Scan))
    }

    #[instrument(skip(self))]
    async fn connect(&self, id: &DeviceId) -> Result<Peripheral> {
        self.ensure_powered().await?;
        let peripheral = self
            .find_peripheral(id)
            .await?
            .ok_or_else(|| Error::Connection(format!("device {id} not found")))?;

        let connected = peripheral
            .is_connected()
            .await
            .map_err(|e| classify(e, Error::Connection))?;
        if !connected {
            peripheral
                .connect()
                .await
                .map_err(|e| classify(e, Error::Connection))?;
        }
        Ok(peripheral)
    }

    async fn discover_all(&self, handle: &Peripheral) -> Result<()> {
        handle
            .discover_services()
            .await
            .map_err(|e| classify(e, Error::Connection))?;
        debug!("Discovered {} characteristics", handle.characteristics().len());
        Ok(())
    }

    async fn disconnect(&self, handle: &Peripheral) -> Result<()> {
        handle
            .disconnect()
            .await
            .map_err(|e| classify(e, Error::Connection))
    }

    async fn is_connected(&self, id: &DeviceId) -> Result<bool> {
        match self.find_peripheral(id).await? {
            Some(peripheral) => peripheral
                .is_connected()
                .await
                .map_err(|e| classify(e, Error::Connection)),
            None => Ok(false),
        }
    }

    fn on_disconnect(&self, id: &DeviceId, listener: DisconnectListener) -> Subscription {
        self.registry.subscribe(id, listener)
    }

    async fn read_characteristic(
        &self,
        handle: &Peripheral,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<String> {
        let target = Self::characteristic(handle, service, characteristic)?;
        let bytes = handle
            .read(&target)
            .await
            .map_err(|e| classify(e, Error::Read))?;
        Ok(bytes_to_text(&bytes))
    }

    async fn write_characteristic_without_response(
        &self,
        handle: &Peripheral,
        service: Uuid,
        characteristic: Uuid,
        payload: &str,
    ) -> Result<()> {
        let target = Self::characteristic(handle, service, characteristic)
            .map_err(|e| Error::Write(e.to_string()))?;
        let bytes = text_to_bytes(payload)?;
        handle
            .write(&target, &bytes, WriteType::WithoutResponse)
            .await
            .map_err(|e| classify(e, Error::Write))
    }
}
