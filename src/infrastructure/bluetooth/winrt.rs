//! WinRT GATT transport
//!
//! Talks to a single BLE peripheral through `Windows.Devices.Bluetooth`.
//! Characteristic handles are resolved once per connection from the
//! services and characteristics declared in the [`Descriptor`].

use super::transport::{LinkStatus, NotifyCallback, Transport};
use crate::domain::descriptor::Descriptor;
use crate::error::TransportError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};
use windows::core::GUID;
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattDeviceService, GattValueChangedEventArgs,
};
use windows::Devices::Bluetooth::{
    BluetoothCacheMode, BluetoothConnectionStatus, BluetoothLEDevice,
};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

/// Suffix of the Bluetooth base UUID, used to expand 16/32-bit short forms.
const BASE_UUID_SUFFIX: &str = "00001000800000805f9b34fb";

/// Handles owned for the lifetime of one connection.
struct Link {
    device: BluetoothLEDevice,
    services: Vec<GattDeviceService>,
    characteristics: HashMap<String, GattCharacteristic>,
    notify_tokens: Vec<(GattCharacteristic, i64)>,
    status_token: i64,
}

impl Link {
    fn is_connected(&self) -> bool {
        self.device
            .ConnectionStatus()
            .map(|s| s == BluetoothConnectionStatus::Connected)
            .unwrap_or(false)
    }

    fn close(self) {
        for (characteristic, token) in &self.notify_tokens {
            let _ = characteristic.RemoveValueChanged(*token);
        }
        let _ = self.device.RemoveConnectionStatusChanged(self.status_token);
        for service in &self.services {
            let _ = service.Close();
        }
        let _ = self.device.Close();
    }
}

/// [`Transport`] backed by the Windows Bluetooth LE stack.
pub struct WinRtTransport {
    address: u64,
    descriptor: Arc<Descriptor>,
    link: Mutex<Option<Link>>,
    status: Arc<watch::Sender<LinkStatus>>,
}

impl WinRtTransport {
    pub fn new(address: u64, descriptor: Arc<Descriptor>) -> Self {
        let (status, _) = watch::channel(LinkStatus::Down);
        Self {
            address,
            descriptor,
            link: Mutex::new(None),
            status: Arc::new(status),
        }
    }

    fn characteristic(&self, characteristic_id: &str) -> Result<GattCharacteristic, TransportError> {
        let link = self.link.lock();
        let link = link.as_ref().ok_or(TransportError::NotConnected)?;
        link.characteristics
            .get(characteristic_id)
            .cloned()
            .ok_or_else(|| TransportError::Unsupported(characteristic_id.to_string()))
    }

    async fn open(&self) -> Result<Link, TransportError> {
        info!("Connecting to Bluetooth device: {:#X}", self.address);
        let device = BluetoothLEDevice::FromBluetoothAddressAsync(self.address)
            .map_err(link_error)?
            .await
            .map_err(link_error)?;

        let mut services = Vec::new();
        let mut characteristics = HashMap::new();

        for declared in self.descriptor.services() {
            let service_uuid = parse_uuid(&declared.id)?;
            let result = device
                .GetGattServicesForUuidWithCacheModeAsync(service_uuid, BluetoothCacheMode::Uncached)
                .map_err(link_error)?
                .await
                .map_err(link_error)?;
            check_status(result.Status().map_err(link_error)?)?;

            let found = result.Services().map_err(link_error)?;
            if found.Size().map_err(link_error)? == 0 {
                warn!("Service {} ({}) not found on device", declared.id, declared.name);
                continue;
            }
            let service = found.GetAt(0).map_err(link_error)?;
            debug!("Found service {} ({})", declared.id, declared.name);

            for ch in &declared.characteristics {
                let uuid = parse_uuid(&ch.id)?;
                let result = service
                    .GetCharacteristicsForUuidAsync(uuid)
                    .map_err(link_error)?
                    .await
                    .map_err(link_error)?;
                if result.Status().map_err(link_error)? != GattCommunicationStatus::Success {
                    warn!("Characteristic {} ({}) unavailable", ch.id, ch.key);
                    continue;
                }
                let list = result.Characteristics().map_err(link_error)?;
                if list.Size().map_err(link_error)? == 0 {
                    warn!("Characteristic {} ({}) not found", ch.id, ch.key);
                    continue;
                }
                characteristics.insert(ch.id.clone(), list.GetAt(0).map_err(link_error)?);
            }
            services.push(service);
        }

        let status = self.status.clone();
        let status_handler =
            TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
                if let Some(dev) = dev.as_ref() {
                    if let Ok(BluetoothConnectionStatus::Disconnected) = dev.ConnectionStatus() {
                        status.send_replace(LinkStatus::Down);
                    }
                }
                Ok(())
            });
        let status_token = device
            .ConnectionStatusChanged(&status_handler)
            .map_err(link_error)?;

        let link = Link {
            device,
            services,
            characteristics,
            notify_tokens: Vec::new(),
            status_token,
        };
        if !link.is_connected() {
            link.close();
            return Err(TransportError::LinkError("device unreachable".to_string()));
        }
        info!(
            "Connected, {} characteristics resolved",
            link.characteristics.len()
        );
        Ok(link)
    }
}

#[async_trait]
impl Transport for WinRtTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.link.lock().as_ref().is_some_and(Link::is_connected) {
            return Ok(());
        }

        let link = self.open().await?;
        if let Some(stale) = self.link.lock().replace(link) {
            stale.close();
        }
        self.status.send_replace(LinkStatus::Up);
        Ok(())
    }

    async fn disconnect(&self) {
        let link = self.link.lock().take();
        if let Some(link) = link {
            link.close();
            info!("Disconnected from device");
            self.status.send_replace(LinkStatus::Down);
        }
    }

    async fn read(&self, characteristic_id: &str) -> Result<Vec<u8>, TransportError> {
        let characteristic = self.characteristic(characteristic_id)?;
        let result = characteristic
            .ReadValueWithCacheModeAsync(BluetoothCacheMode::Uncached)
            .map_err(link_error)?
            .await
            .map_err(link_error)?;
        check_status(result.Status().map_err(link_error)?)?;

        let bytes = buffer_bytes(&result.Value().map_err(link_error)?)?;
        trace!("Read {}: {:02X?}", characteristic_id, bytes);
        Ok(bytes)
    }

    async fn write(&self, characteristic_id: &str, bytes: &[u8]) -> Result<(), TransportError> {
        let characteristic = self.characteristic(characteristic_id)?;

        let writer = DataWriter::new().map_err(link_error)?;
        writer.WriteBytes(bytes).map_err(link_error)?;
        let buffer = writer.DetachBuffer().map_err(link_error)?;

        let status = characteristic
            .WriteValueAsync(&buffer)
            .map_err(link_error)?
            .await
            .map_err(link_error)?;
        check_status(status)
    }

    async fn subscribe(
        &self,
        characteristic_id: &str,
        on_notify: NotifyCallback,
    ) -> Result<(), TransportError> {
        let characteristic = self.characteristic(characteristic_id)?;

        let status = characteristic
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::Notify,
            )
            .map_err(link_error)?
            .await
            .map_err(link_error)?;
        check_status(status)?;

        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    if let Ok(bytes) = args
                        .CharacteristicValue()
                        .map_err(link_error)
                        .and_then(|buffer| buffer_bytes(&buffer))
                    {
                        on_notify(bytes);
                    }
                }
                Ok(())
            },
        );
        let token = characteristic.ValueChanged(&handler).map_err(link_error)?;

        match self.link.lock().as_mut() {
            Some(link) => {
                link.notify_tokens.push((characteristic, token));
                Ok(())
            }
            None => {
                let _ = characteristic.RemoveValueChanged(token);
                Err(TransportError::NotConnected)
            }
        }
    }

    fn link_status(&self) -> watch::Receiver<LinkStatus> {
        self.status.subscribe()
    }
}

fn link_error(e: windows::core::Error) -> TransportError {
    TransportError::LinkError(e.to_string())
}

fn check_status(status: GattCommunicationStatus) -> Result<(), TransportError> {
    match status {
        GattCommunicationStatus::Success => Ok(()),
        GattCommunicationStatus::AccessDenied => {
            Err(TransportError::Rejected("access denied".to_string()))
        }
        GattCommunicationStatus::ProtocolError => {
            Err(TransportError::Rejected("protocol error".to_string()))
        }
        GattCommunicationStatus::Unreachable => {
            Err(TransportError::LinkError("device unreachable".to_string()))
        }
        other => Err(TransportError::LinkError(format!("status {:?}", other))),
    }
}

fn buffer_bytes(buffer: &IBuffer) -> Result<Vec<u8>, TransportError> {
    let reader = DataReader::FromBuffer(buffer).map_err(link_error)?;
    let length = reader.UnconsumedBufferLength().map_err(link_error)? as usize;
    let mut bytes = vec![0u8; length];
    reader.ReadBytes(&mut bytes).map_err(link_error)?;
    Ok(bytes)
}

/// Parse a UUID string into a Windows GUID. 16- and 32-bit short forms
/// ("2a19", "0000180f") are expanded against the Bluetooth base UUID.
pub fn parse_uuid(uuid_str: &str) -> Result<GUID, TransportError> {
    let compact = uuid_str.replace('-', "").to_lowercase();
    let full = match compact.len() {
        4 => format!("0000{}{}", compact, BASE_UUID_SUFFIX),
        8 => format!("{}{}", compact, BASE_UUID_SUFFIX),
        32 => compact,
        _ => return Err(invalid_uuid(uuid_str)),
    };

    let field = |range: std::ops::Range<usize>| {
        full.get(range)
            .and_then(|s| u32::from_str_radix(s, 16).ok())
            .ok_or_else(|| invalid_uuid(uuid_str))
    };

    let data1 = field(0..8)?;
    let data2 = field(8..12)? as u16;
    let data3 = field(12..16)? as u16;
    let mut data4 = [0u8; 8];
    for (i, byte) in data4.iter_mut().enumerate() {
        *byte = field(16 + i * 2..18 + i * 2)? as u8;
    }

    Ok(GUID {
        data1,
        data2,
        data3,
        data4,
    })
}

fn invalid_uuid(uuid_str: &str) -> TransportError {
    TransportError::Unsupported(format!("invalid UUID {:?}", uuid_str))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uuid() {
        let guid = parse_uuid("4f63756c-7573-2054-6872-65656d6f7465").unwrap();
        assert_eq!(guid.data1, 0x4f63756c);
        assert_eq!(guid.data2, 0x7573);
        assert_eq!(guid.data4[7], 0x65);
    }

    #[test]
    fn test_parse_short_uuid() {
        let guid = parse_uuid("2A19").unwrap();
        assert_eq!(guid.data1, 0x0000_2a19);
        assert_eq!(guid.data2, 0x0000);
        assert_eq!(guid.data3, 0x1000);
        assert_eq!(guid.data4, [0x80, 0x00, 0x00, 0x80, 0x5f, 0x9b, 0x34, 0xfb]);
    }

    #[test]
    fn test_parse_uuid_rejects_garbage() {
        assert!(parse_uuid("12345").is_err());
        assert!(parse_uuid("zzzz").is_err());
    }
}
