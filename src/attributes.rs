/*!
 # Characteristic access

 Typed reads and the color write on top of the session held by a
 [`ConnectionManager`]. Reads degrade to `None` on any failure; callers treat
 that as "unknown". The color write reports its outcome through callbacks.
*/

use std::sync::Arc;

use tracing::{debug, error, info, instrument, trace, warn};

use crate::codec::{bytes_to_text, text_to_bytes, RgbwCommand};
use crate::connection::ConnectionManager;
use crate::services::SERVICES;
use crate::transport::{DeviceId, Transport};
use crate::{Error, Result};

/// Reads and writes the light's characteristics
pub struct AttributeAccessor<T: Transport> {
    manager: Arc<ConnectionManager<T>>,
    // When set, only a session with this device is used.
    device: Option<DeviceId>,
}

impl<T: Transport> Clone for AttributeAccessor<T> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            device: self.device.clone(),
        }
    }
}

impl<T: Transport> AttributeAccessor<T> {
    /// Accessor over whatever session the manager holds
    pub fn new(manager: Arc<ConnectionManager<T>>) -> Self {
        Self {
            manager,
            device: None,
        }
    }

    /// Accessor that treats a session with any other device as no session
    pub fn bound_to(manager: Arc<ConnectionManager<T>>, device: DeviceId) -> Self {
        Self {
            manager,
            device: Some(device),
        }
    }

    fn session(&self) -> Result<(DeviceId, T::Handle)> {
        let (id, handle) = self.manager.session_handle().ok_or(Error::NotConnected)?;
        match &self.device {
            Some(bound) if *bound != id => {
                debug!("Session belongs to {}, not {}", id, bound);
                Err(Error::NotConnected)
            }
            _ => Ok((id, handle)),
        }
    }

    async fn read_bytes(&self, service: uuid::Uuid, characteristic: uuid::Uuid) -> Result<Vec<u8>> {
        let (id, handle) = self.session()?;
        trace!("Reading {} from {}", characteristic, id);
        let text = self
            .manager
            .transport()
            .read_characteristic(&handle, service, characteristic)
            .await?;
        text_to_bytes(&text)
    }

    /// Firmware revision string, `None` when unknown
    #[instrument(skip(self))]
    pub async fn read_firmware_version(&self) -> Option<String> {
        let descriptor = SERVICES.device_info;
        match self.read_bytes(descriptor.service, descriptor.primary()).await {
            Ok(bytes) => {
                let version = String::from_utf8_lossy(&bytes)
                    .trim_end_matches('\0')
                    .to_string();
                info!("Firmware Version: {}", version);
                Some(version)
            }
            Err(Error::NotConnected) => {
                debug!("Skipping firmware read, no session");
                None
            }
            Err(e) => {
                error!("Firmware Read Error: {}", e);
                None
            }
        }
    }

    /// Battery level in percent, `None` when unknown
    #[instrument(skip(self))]
    pub async fn read_battery_level(&self) -> Option<u8> {
        let descriptor = SERVICES.battery;
        match self.read_bytes(descriptor.service, descriptor.primary()).await {
            Ok(bytes) => {
                let Some(&level) = bytes.first() else {
                    warn!("Battery characteristic returned an empty payload");
                    return None;
                };
                if level > 100 {
                    warn!("Battery level {} out of range (0-100)", level);
                }
                info!("Battery Level: {}%", level);
                Some(level)
            }
            Err(Error::NotConnected) => {
                debug!("Skipping battery read, no session");
                None
            }
            Err(e) => {
                error!("Battery Read Error: {}", e);
                None
            }
        }
    }

    /// Encodes `command` and writes it to the light characteristic without
    /// waiting for acknowledgment.
    #[instrument(skip(self))]
    pub async fn send_color(&self, command: RgbwCommand) -> Result<()> {
        let (id, handle) = self.session()?;
        let payload = bytes_to_text(&command.encode());
        let descriptor = SERVICES.light;

        trace!("Sending color frame {} to {}", payload, id);
        self.manager
            .transport()
            .write_characteristic_without_response(
                &handle,
                descriptor.service,
                descriptor.primary(),
                &payload,
            )
            .await
            .map_err(|e| match e {
                Error::Write(_) | Error::PermissionDenied(_) => e,
                other => Error::Write(other.to_string()),
            })
    }

    /// Writes `command` and reports the outcome through the callbacks.
    /// Without a session `on_error` receives [`Error::NotConnected`].
    pub async fn write_color<S, E>(&self, command: RgbwCommand, on_success: S, on_error: E)
    where
        S: FnOnce(),
        E: FnOnce(&Error),
    {
        match self.send_color(command).await {
            Ok(()) => {
                debug!("Color written: {:?}", command);
                on_success();
            }
            Err(e) => {
                error!("Light Color Write Error: {}", e);
                on_error(&e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::codec::decode_color_command;
    use crate::fake::FakeTransport;
    use crate::services::{
        BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID, DEVICE_INFO_SERVICE_UUID,
        FIRMWARE_VERSION_UUID, LIGHT_COLOR_UUID,
    };
    use crate::transport::Device;

    async fn connected(
        transport: FakeTransport,
    ) -> (Arc<FakeTransport>, AttributeAccessor<FakeTransport>) {
        let transport = Arc::new(transport.with_peripheral("lamp"));
        let manager = Arc::new(ConnectionManager::new(transport.clone()));
        manager
            .connect(&Device::new("lamp").with_service(BATTERY_SERVICE_UUID))
            .await
            .unwrap();
        (transport, AttributeAccessor::new(manager))
    }

    #[tokio::test]
    async fn battery_level_decodes_first_payload_byte() {
        let (_, accessor) = connected(
            FakeTransport::new().with_payload(BATTERY_SERVICE_UUID, BATTERY_LEVEL_UUID, &[0x4B]),
        )
        .await;

        assert_eq!(Some(75), accessor.read_battery_level().await);
    }

    #[tokio::test]
    async fn firmware_version_decodes_utf8() {
        let (_, accessor) = connected(FakeTransport::new().with_payload(
            DEVICE_INFO_SERVICE_UUID,
            FIRMWARE_VERSION_UUID,
            b"1.4.2\0",
        ))
        .await;

        assert_eq!(Some("1.4.2".to_string()), accessor.read_firmware_version().await);
    }

    #[tokio::test]
    async fn reads_degrade_to_none() {
        let (transport, accessor) = connected(
            FakeTransport::new().with_payload(BATTERY_SERVICE_UUID, BATTERY_LEVEL_UUID, &[]),
        )
        .await;
        assert_eq!(None, accessor.read_battery_level().await);
        assert_eq!(None, accessor.read_firmware_version().await);

        transport.fail_reads(Some("att error"));
        assert_eq!(None, accessor.read_battery_level().await);

        transport.drop_link("lamp");
        assert_eq!(None, accessor.read_battery_level().await);
    }

    #[tokio::test]
    async fn write_color_sends_encoded_frame() {
        let (transport, accessor) = connected(FakeTransport::new()).await;
        let succeeded = Cell::new(false);

        accessor
            .write_color(
                RgbwCommand::new(255, 128, 0, 7),
                || succeeded.set(true),
                |e| panic!("unexpected write error: {e}"),
            )
            .await;

        assert!(succeeded.get());
        let writes = transport.writes();
        assert_eq!(1, writes.len());
        assert_eq!(LIGHT_COLOR_UUID, writes[0].characteristic);
        let frame = text_to_bytes(&writes[0].payload).unwrap();
        assert_eq!(vec![0x01, 255, 128, 0, 7], frame);
        assert_eq!(RgbwCommand::new(255, 128, 0, 7), decode_color_command(&frame).unwrap());
    }

    #[tokio::test]
    async fn write_color_reports_failures() {
        let (transport, accessor) = connected(FakeTransport::new()).await;
        transport.fail_writes(Some("link busy"));

        let mut seen = None;
        accessor
            .write_color(RgbwCommand::default(), || panic!("write should fail"), |e| {
                seen = Some(e.to_string())
            })
            .await;
        assert_eq!(Some("Write failed: link busy".to_string()), seen);

        transport.drop_link("lamp");
        assert_matches!(
            accessor.send_color(RgbwCommand::default()).await,
            Err(Error::NotConnected)
        );
    }

    #[tokio::test]
    async fn bound_accessor_ignores_sessions_with_other_devices() {
        let transport = Arc::new(
            FakeTransport::new()
                .with_peripheral("lamp")
                .with_payload(BATTERY_SERVICE_UUID, BATTERY_LEVEL_UUID, &[0x4B]),
        );
        let manager = Arc::new(ConnectionManager::new(transport.clone()));
        manager.connect(&Device::new("lamp")).await.unwrap();

        let strip = AttributeAccessor::bound_to(manager.clone(), "strip".into());
        assert_eq!(None, strip.read_battery_level().await);
        assert_matches!(
            strip.send_color(RgbwCommand::new(9, 9, 9, 9)).await,
            Err(Error::NotConnected)
        );
        assert!(transport.writes().is_empty());

        let lamp = AttributeAccessor::bound_to(manager, "lamp".into());
        assert_eq!(Some(75), lamp.read_battery_level().await);
    }
}
