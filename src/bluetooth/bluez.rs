// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! BlueZ central backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, ErrorKind};
use futures::{pin_mut, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::platform::{BleLink, BlePlatform, DeviceHandle, ScanFilter};
use super::protocol::DeviceProfile;
use crate::error::{ConnectFailureKind, LedError, MissingEndpoint, Result};

/// BLE central on the default BlueZ adapter.
pub struct BluezPlatform {
    adapter: Adapter,
    scan_timeout: Duration,
}

impl BluezPlatform {
    /// Open a BlueZ session and power on the default adapter.
    pub async fn new(scan_timeout: Duration) -> Result<Self> {
        info!("Initializing BlueZ central...");

        let session = bluer::Session::new()
            .await
            .map_err(|e| LedError::PlatformUnavailable(e.to_string()))?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|e| LedError::PlatformUnavailable(e.to_string()))?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        let powered = adapter
            .is_powered()
            .await
            .map_err(|e| LedError::PlatformUnavailable(e.to_string()))?;
        if !powered {
            info!("Powering on Bluetooth adapter...");
            adapter
                .set_powered(true)
                .await
                .map_err(|e| LedError::PlatformUnavailable(e.to_string()))?;
        }

        Ok(Self {
            adapter,
            scan_timeout,
        })
    }

    async fn matching_device(&self, address: Address, filter: &ScanFilter) -> Option<DeviceHandle> {
        let device = self.adapter.device(address).ok()?;
        let name = device.name().await.ok().flatten();
        let services: Vec<Uuid> = device
            .uuids()
            .await
            .ok()
            .flatten()
            .map(|uuids| uuids.into_iter().collect())
            .unwrap_or_default();

        if filter.matches(name.as_deref(), &services) {
            Some(DeviceHandle::new(address.to_string(), name))
        } else {
            None
        }
    }

    fn device(&self, handle: &DeviceHandle) -> Result<Device> {
        let address: Address = handle.id.parse().map_err(|_| LedError::ConnectFailed {
            kind: ConnectFailureKind::NotFound,
            reason: format!("invalid device address {}", handle.id),
        })?;
        self.adapter.device(address).map_err(connect_error)
    }
}

#[async_trait]
impl BlePlatform for BluezPlatform {
    async fn scan(&self, filter: &ScanFilter) -> Result<DeviceHandle> {
        let events = self
            .adapter
            .discover_devices()
            .await
            .map_err(|e| LedError::PlatformUnavailable(e.to_string()))?;
        pin_mut!(events);

        let search = async {
            while let Some(event) = events.next().await {
                if let AdapterEvent::DeviceAdded(address) = event {
                    debug!("Discovered {}", address);
                    if let Some(handle) = self.matching_device(address, filter).await {
                        return Some(handle);
                    }
                }
            }
            None
        };

        match timeout(self.scan_timeout, search).await {
            Ok(Some(handle)) => Ok(handle),
            Ok(None) | Err(_) => Err(LedError::NoDeviceSelected),
        }
    }

    async fn connect(
        &self,
        handle: &DeviceHandle,
        profile: DeviceProfile,
    ) -> Result<Box<dyn BleLink>> {
        let device = self.device(handle)?;

        if !device.is_connected().await.map_err(connect_error)? {
            device.connect().await.map_err(connect_error)?;
        }

        let characteristic = match resolve_write_characteristic(&device, profile).await {
            Ok(characteristic) => characteristic,
            Err(e) => {
                let _ = device.disconnect().await;
                return Err(e);
            }
        };

        let link = BluezLink::open(device, characteristic).await?;
        Ok(Box::new(link))
    }
}

/// Find the profile's service, then its write characteristic.
async fn resolve_write_characteristic(
    device: &Device,
    profile: DeviceProfile,
) -> Result<Characteristic> {
    let mut service = None;
    for candidate in device.services().await.map_err(connect_error)? {
        if candidate.uuid().await.map_err(connect_error)? == profile.service_uuid() {
            service = Some(candidate);
            break;
        }
    }
    let service = service.ok_or(LedError::ProtocolMismatch {
        missing: MissingEndpoint::Service(profile.service_uuid()),
    })?;

    for characteristic in service.characteristics().await.map_err(connect_error)? {
        if characteristic.uuid().await.map_err(connect_error)? == profile.write_uuid() {
            return Ok(characteristic);
        }
    }

    Err(LedError::ProtocolMismatch {
        missing: MissingEndpoint::Characteristic(profile.write_uuid()),
    })
}

fn connect_error(e: bluer::Error) -> LedError {
    let kind = match e.kind {
        ErrorKind::NotFound | ErrorKind::DoesNotExist => ConnectFailureKind::NotFound,
        ErrorKind::ConnectionAttemptFailed | ErrorKind::NotReady | ErrorKind::NotAvailable => {
            ConnectFailureKind::Network
        }
        ErrorKind::Failed => ConnectFailureKind::Gatt,
        _ => ConnectFailureKind::Other,
    };
    LedError::ConnectFailed {
        kind,
        reason: e.message,
    }
}

/// Open GATT connection with a resolved write characteristic.
struct BluezLink {
    device: Device,
    characteristic: Characteristic,
    open: Arc<watch::Sender<bool>>,
    watcher: JoinHandle<()>,
}

impl BluezLink {
    async fn open(device: Device, characteristic: Characteristic) -> Result<Self> {
        let events = device.events().await.map_err(connect_error)?;
        let (tx, _) = watch::channel(true);
        let open = Arc::new(tx);

        let address = device.address();
        let flag = open.clone();
        let watcher = tokio::spawn(async move {
            pin_mut!(events);
            while let Some(event) = events.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                    warn!("Device {} reported disconnect", address);
                    break;
                }
            }
            flag.send_replace(false);
        });

        Ok(Self {
            device,
            characteristic,
            open,
            watcher,
        })
    }
}

#[async_trait]
impl BleLink for BluezLink {
    async fn write(&self, data: &[u8]) -> Result<()> {
        self.characteristic
            .write(data)
            .await
            .map_err(|e| LedError::WriteFailed(e.to_string()))
    }

    fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    fn link_state(&self) -> watch::Receiver<bool> {
        self.open.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.open.send_replace(false);
        self.watcher.abort();
        self.device
            .disconnect()
            .await
            .map_err(|e| LedError::WriteFailed(e.to_string()))
    }
}

impl Drop for BluezLink {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}
