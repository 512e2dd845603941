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

//! Application state management.

use parking_lot::RwLock;
use std::sync::Arc;

/// Connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "Disconnected",
            ConnectionStatus::Connecting => "Connecting...",
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::Reconnecting => "Reconnecting...",
            ConnectionStatus::Error => "Error",
        }
    }
}

/// Shared application state.
#[derive(Debug)]
pub struct AppState {
    /// Current connection status.
    pub connection_status: RwLock<ConnectionStatus>,

    /// Connected device name.
    pub connected_device: RwLock<Option<String>>,

    /// Last user-visible error, cleared on the next successful connect.
    pub last_error: RwLock<Option<String>>,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            connection_status: RwLock::new(ConnectionStatus::Disconnected),
            connected_device: RwLock::new(None),
            last_error: RwLock::new(None),
        }
    }
}

impl AppState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_connecting(&self) {
        *self.connection_status.write() = ConnectionStatus::Connecting;
    }

    pub fn set_connected(&self, device_name: String) {
        *self.connection_status.write() = ConnectionStatus::Connected;
        *self.connected_device.write() = Some(device_name);
        *self.last_error.write() = None;
    }

    pub fn set_reconnecting(&self) {
        *self.connection_status.write() = ConnectionStatus::Reconnecting;
    }

    pub fn set_disconnected(&self) {
        *self.connection_status.write() = ConnectionStatus::Disconnected;
        *self.connected_device.write() = None;
    }

    pub fn set_error(&self, message: String) {
        *self.connection_status.write() = ConnectionStatus::Error;
        *self.last_error.write() = Some(message);
    }

    /// Report an error without changing the connection status.
    pub fn report_error(&self, message: String) {
        *self.last_error.write() = Some(message);
    }

    pub fn get_status(&self) -> ConnectionStatus {
        *self.connection_status.read()
    }

    pub fn get_device_name(&self) -> Option<String> {
        self.connected_device.read().clone()
    }

    pub fn get_last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        let state = AppState::new();
        assert_eq!(state.get_status(), ConnectionStatus::Disconnected);

        state.set_error("Adapter missing".into());
        assert_eq!(state.get_status(), ConnectionStatus::Error);
        assert_eq!(state.get_last_error().as_deref(), Some("Adapter missing"));

        state.set_connected("Desk".into());
        assert_eq!(state.get_status().as_str(), "Connected");
        assert_eq!(state.get_device_name().as_deref(), Some("Desk"));
        assert_eq!(state.get_last_error(), None);

        state.set_disconnected();
        assert_eq!(state.get_device_name(), None);
    }
}
