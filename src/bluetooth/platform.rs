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

//! Platform transport abstraction.
//!
//! [`BlePlatform`] discovers and connects devices, [`BleLink`] is one open
//! GATT connection with its write characteristic already resolved. The
//! BlueZ backend and the test mock both implement these traits.

use async_trait::async_trait;
use tokio::sync::watch;
use uuid::Uuid;

use super::protocol::DeviceProfile;
use crate::error::Result;

/// A device found by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    /// Platform-assigned identifier, stable across sessions.
    pub id: String,
    /// Advertised name, if any.
    pub name: Option<String>,
}

impl DeviceHandle {
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
        }
    }

    /// Name to show when the device did not advertise one.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Protocol suggested by the advertised name.
    pub fn detected_profile(&self) -> Option<DeviceProfile> {
        self.name.as_deref().and_then(DeviceProfile::detect)
    }
}

/// Discovery filter: a device matches on any name prefix or any service.
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    pub name_prefixes: Vec<&'static str>,
    pub services: Vec<Uuid>,
}

impl ScanFilter {
    /// Filter for one protocol, or for every known protocol when `hint` is `None`.
    pub fn for_profile(hint: Option<DeviceProfile>) -> Self {
        let profiles: Vec<DeviceProfile> = match hint {
            Some(profile) => vec![profile],
            None => DeviceProfile::ALL.to_vec(),
        };

        Self {
            name_prefixes: profiles
                .iter()
                .flat_map(|profile| profile.name_prefixes().iter().copied())
                .collect(),
            services: profiles.iter().map(|profile| profile.service_uuid()).collect(),
        }
    }

    pub fn matches(&self, name: Option<&str>, services: &[Uuid]) -> bool {
        let name_match = name
            .map(|name| self.name_prefixes.iter().any(|prefix| name.starts_with(prefix)))
            .unwrap_or(false);
        name_match || services.iter().any(|uuid| self.services.contains(uuid))
    }
}

/// Device discovery and connection.
#[async_trait]
pub trait BlePlatform: Send + Sync {
    /// Pick a device matching the filter.
    ///
    /// Fails with `NoDeviceSelected` when nothing is picked and with
    /// `PlatformUnavailable` when the host has no usable adapter.
    async fn scan(&self, filter: &ScanFilter) -> Result<DeviceHandle>;

    /// Open a link and resolve the profile's service, then its write
    /// characteristic. A missing endpoint yields `ProtocolMismatch`.
    async fn connect(&self, device: &DeviceHandle, profile: DeviceProfile)
        -> Result<Box<dyn BleLink>>;
}

/// One open connection to a device.
#[async_trait]
pub trait BleLink: Send + Sync {
    /// Write a frame to the command characteristic.
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// Whether the platform still reports the link as open.
    fn is_open(&self) -> bool;

    /// Link-open flag; flips to `false` when the physical link drops.
    fn link_state(&self) -> watch::Receiver<bool>;

    /// Release the connection.
    async fn close(&self) -> Result<()>;
}

/// Resolve once the link reports closed or its state sender goes away.
pub async fn wait_for_drop(mut state: watch::Receiver<bool>) {
    loop {
        if !*state.borrow_and_update() {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_for_all_profiles() {
        let filter = ScanFilter::for_profile(None);
        assert!(filter.matches(Some("ELK-BLEDOM-42"), &[]));
        assert!(filter.matches(Some("LEDBLE-7"), &[]));
        assert!(!filter.matches(Some("Keyboard"), &[]));
        assert!(filter.matches(None, &[DeviceProfile::Generic.service_uuid()]));
    }

    #[test]
    fn test_filter_with_hint() {
        let filter = ScanFilter::for_profile(Some(DeviceProfile::Generic));
        assert!(!filter.matches(Some("ELK-BLEDOM-42"), &[]));
        assert!(filter.matches(Some("QHM-1F00"), &[]));
    }

    #[test]
    fn test_handle_detection() {
        let handle = DeviceHandle::new("AA:BB:CC:DD:EE:FF", Some("ELK-BLEDOM-42".into()));
        assert_eq!(handle.detected_profile(), Some(DeviceProfile::ElkBledom));
        assert_eq!(handle.display_name(), "ELK-BLEDOM-42");

        let unnamed = DeviceHandle::new("AA:BB:CC:DD:EE:FF", None);
        assert_eq!(unnamed.detected_profile(), None);
        assert_eq!(unnamed.display_name(), "AA:BB:CC:DD:EE:FF");
    }

    #[tokio::test]
    async fn test_wait_for_drop() {
        let (tx, rx) = watch::channel(true);
        let waiter = tokio::spawn(wait_for_drop(rx));
        tx.send_replace(false);
        waiter.await.unwrap();

        let (tx, rx) = watch::channel(true);
        drop(tx);
        wait_for_drop(rx).await;
    }
}
