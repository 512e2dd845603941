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

//! In-memory BLE platform for tests.
//!
//! Records every write with its (virtual) timestamp and lets tests inject
//! connect failures, write failures, hung writes and link drops.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::platform::{BleLink, BlePlatform, DeviceHandle, ScanFilter};
use super::protocol::DeviceProfile;
use crate::error::{ConnectFailureKind, LedError, MissingEndpoint, Result};

/// How the mock answers characteristic writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    #[default]
    Accept,
    /// Every write is rejected.
    Reject,
    /// Writes never complete.
    Hang,
}

/// One recorded write.
#[derive(Debug, Clone)]
pub struct WriteRecord {
    pub device_id: String,
    pub bytes: Vec<u8>,
    pub at: Instant,
}

#[derive(Debug, Clone)]
struct MockDevice {
    handle: DeviceHandle,
    services: Vec<Uuid>,
    characteristics: Vec<Uuid>,
}

#[derive(Default)]
struct MockState {
    devices: Vec<MockDevice>,
    unavailable: bool,
    picker_cancelled: bool,
    failing_connects: u32,
    connect_delay: Duration,
    write_mode: WriteMode,
    failing_writes: u32,
    writes: Vec<WriteRecord>,
    connects: u32,
    link: Option<Arc<watch::Sender<bool>>>,
    /// Link that reports closed without signalling a drop.
    stale_link: Option<u32>,
}

/// Scriptable platform shared between the code under test and the test.
#[derive(Clone, Default)]
pub struct MockPlatform {
    state: Arc<Mutex<MockState>>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device exposing the full GATT layout of `profile`.
    pub fn add_device(&self, id: &str, name: &str, profile: DeviceProfile) -> DeviceHandle {
        self.add_device_with_layout(
            id,
            name,
            vec![profile.service_uuid()],
            vec![profile.write_uuid()],
        )
    }

    /// Add a device with an explicit GATT layout.
    pub fn add_device_with_layout(
        &self,
        id: &str,
        name: &str,
        services: Vec<Uuid>,
        characteristics: Vec<Uuid>,
    ) -> DeviceHandle {
        let handle = DeviceHandle::new(id, Some(name.to_string()));
        self.state.lock().devices.push(MockDevice {
            handle: handle.clone(),
            services,
            characteristics,
        });
        handle
    }

    /// Report the platform as lacking Bluetooth support.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Simulate the user dismissing the device picker.
    pub fn cancel_picker(&self, cancelled: bool) {
        self.state.lock().picker_cancelled = cancelled;
    }

    /// Fail the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().failing_connects = count;
    }

    /// Make every connection attempt take `delay` before it resolves.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = delay;
    }

    pub fn set_write_mode(&self, mode: WriteMode) {
        self.state.lock().write_mode = mode;
    }

    /// Reject the next `count` writes, then accept again.
    pub fn fail_next_writes(&self, count: u32) {
        self.state.lock().failing_writes = count;
    }

    /// Simulate the physical link dropping (power loss, out of range).
    pub fn drop_link(&self) {
        if let Some(link) = self.state.lock().link.take() {
            debug!("Mock link dropped");
            link.send_replace(false);
        }
    }

    /// Make the current link report closed without notifying watchers,
    /// as when the platform's view goes stale before the drop event.
    pub fn mark_link_stale(&self) {
        let mut state = self.state.lock();
        state.stale_link = Some(state.connects);
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state.lock().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.state.lock().writes.len()
    }

    pub fn connect_count(&self) -> u32 {
        self.state.lock().connects
    }

    pub fn is_link_open(&self) -> bool {
        self.state
            .lock()
            .link
            .as_ref()
            .map(|link| *link.borrow())
            .unwrap_or(false)
    }
}

#[async_trait]
impl BlePlatform for MockPlatform {
    async fn scan(&self, filter: &ScanFilter) -> Result<DeviceHandle> {
        let state = self.state.lock();
        if state.unavailable {
            return Err(LedError::PlatformUnavailable("mock adapter disabled".into()));
        }
        if state.picker_cancelled {
            return Err(LedError::NoDeviceSelected);
        }

        state
            .devices
            .iter()
            .find(|device| filter.matches(device.handle.name.as_deref(), &device.services))
            .map(|device| device.handle.clone())
            .ok_or(LedError::NoDeviceSelected)
    }

    async fn connect(
        &self,
        device: &DeviceHandle,
        profile: DeviceProfile,
    ) -> Result<Box<dyn BleLink>> {
        let delay = self.state.lock().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.connects += 1;

        if state.unavailable {
            return Err(LedError::PlatformUnavailable("mock adapter disabled".into()));
        }
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(LedError::ConnectFailed {
                kind: ConnectFailureKind::Network,
                reason: "mock connection refused".into(),
            });
        }

        let known = state
            .devices
            .iter()
            .find(|known| known.handle.id == device.id)
            .cloned()
            .ok_or_else(|| LedError::ConnectFailed {
                kind: ConnectFailureKind::NotFound,
                reason: format!("unknown device {}", device.id),
            })?;

        if !known.services.contains(&profile.service_uuid()) {
            return Err(LedError::ProtocolMismatch {
                missing: MissingEndpoint::Service(profile.service_uuid()),
            });
        }
        if !known.characteristics.contains(&profile.write_uuid()) {
            return Err(LedError::ProtocolMismatch {
                missing: MissingEndpoint::Characteristic(profile.write_uuid()),
            });
        }

        let (tx, _) = watch::channel(true);
        let tx = Arc::new(tx);
        state.link = Some(tx.clone());
        state.stale_link = None;

        Ok(Box::new(MockLink {
            link_id: state.connects,
            device_id: device.id.clone(),
            state: self.state.clone(),
            open: tx,
        }))
    }
}

struct MockLink {
    link_id: u32,
    device_id: String,
    state: Arc<Mutex<MockState>>,
    open: Arc<watch::Sender<bool>>,
}

#[async_trait]
impl BleLink for MockLink {
    async fn write(&self, data: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(LedError::WriteFailed("link closed".into()));
        }

        let mode = {
            let mut state = self.state.lock();
            if state.failing_writes > 0 {
                state.failing_writes -= 1;
                WriteMode::Reject
            } else {
                state.write_mode
            }
        };

        match mode {
            WriteMode::Accept => {}
            WriteMode::Reject => {
                self.state.lock().writes.push(WriteRecord {
                    device_id: self.device_id.clone(),
                    bytes: data.to_vec(),
                    at: Instant::now(),
                });
                return Err(LedError::WriteFailed("mock write rejected".into()));
            }
            WriteMode::Hang => {
                self.state.lock().writes.push(WriteRecord {
                    device_id: self.device_id.clone(),
                    bytes: data.to_vec(),
                    at: Instant::now(),
                });
                futures::future::pending::<()>().await;
            }
        }

        self.state.lock().writes.push(WriteRecord {
            device_id: self.device_id.clone(),
            bytes: data.to_vec(),
            at: Instant::now(),
        });
        Ok(())
    }

    fn is_open(&self) -> bool {
        *self.open.borrow() && self.state.lock().stale_link != Some(self.link_id)
    }

    fn link_state(&self) -> watch::Receiver<bool> {
        self.open.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.open.send_replace(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scan_and_connect() {
        let platform = MockPlatform::new();
        platform.add_device("AA:01", "ELK-BLEDOM-42", DeviceProfile::ElkBledom);

        let handle = platform.scan(&ScanFilter::for_profile(None)).await.unwrap();
        assert_eq!(handle.id, "AA:01");

        let link = platform.connect(&handle, DeviceProfile::ElkBledom).await.unwrap();
        link.write(&[0x7E, 0xEF]).await.unwrap();
        assert_eq!(platform.write_count(), 1);
        assert!(platform.is_link_open());

        platform.drop_link();
        assert!(!link.is_open());
        assert!(link.write(&[0x7E, 0xEF]).await.is_err());
    }

    #[tokio::test]
    async fn test_scan_errors() {
        let platform = MockPlatform::new();
        let filter = ScanFilter::for_profile(None);
        assert!(matches!(platform.scan(&filter).await, Err(LedError::NoDeviceSelected)));

        platform.set_unavailable(true);
        assert!(matches!(
            platform.scan(&filter).await,
            Err(LedError::PlatformUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_distinct_endpoint_failures() {
        let platform = MockPlatform::new();
        let profile = DeviceProfile::ElkBledom;
        let no_service = platform.add_device_with_layout("AA:02", "ELK-BLE-1", vec![], vec![]);
        let no_char = platform.add_device_with_layout(
            "AA:03",
            "ELK-BLE-2",
            vec![profile.service_uuid()],
            vec![],
        );

        match platform.connect(&no_service, profile).await {
            Err(LedError::ProtocolMismatch { missing }) => {
                assert_eq!(missing, MissingEndpoint::Service(profile.service_uuid()))
            }
            _ => panic!("expected missing service"),
        }
        match platform.connect(&no_char, profile).await {
            Err(LedError::ProtocolMismatch { missing }) => {
                assert_eq!(missing, MissingEndpoint::Characteristic(profile.write_uuid()))
            }
            _ => panic!("expected missing characteristic"),
        }
    }
}
