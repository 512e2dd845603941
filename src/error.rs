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

//! Error types for connection, transport and registry operations.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// GATT endpoint that could not be resolved on a connected device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingEndpoint {
    Service(Uuid),
    Characteristic(Uuid),
}

impl fmt::Display for MissingEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Service(uuid) => write!(f, "service {}", uuid),
            Self::Characteristic(uuid) => write!(f, "characteristic {}", uuid),
        }
    }
}

/// Coarse classification of a failed connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailureKind {
    /// Radio or link-layer failure (out of range, powered off).
    Network,
    /// The platform no longer knows the device.
    NotFound,
    /// GATT-level failure after the link came up.
    Gatt,
    Other,
}

impl ConnectFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::NotFound => "not found",
            Self::Gatt => "GATT",
            Self::Other => "other",
        }
    }
}

/// Errors raised by the BLE session and command transport.
#[derive(Error, Debug)]
pub enum LedError {
    #[error("Bluetooth is not available on this host: {0}")]
    PlatformUnavailable(String),

    #[error("No device selected")]
    NoDeviceSelected,

    #[error("Device does not expose the expected protocol ({missing} not found)")]
    ProtocolMismatch { missing: MissingEndpoint },

    #[error("No device connected")]
    NotConnected,

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Write rejected by device: {0}")]
    WriteFailed(String),

    #[error("Command failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<LedError> },

    #[error("Reconnection gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Connection failed ({}): {reason}", .kind.as_str())]
    ConnectFailed {
        kind: ConnectFailureKind,
        reason: String,
    },
}

impl LedError {
    /// Whether a single-attempt failure may succeed when repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::WriteFailed(_))
    }

    /// Whether the failure should be shown to the user.
    ///
    /// `NotConnected` is logged only.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Self::NotConnected)
    }

    /// Hint for the user on how to recover.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::PlatformUnavailable(_) => Some("Check that BlueZ is running and the adapter is present"),
            Self::NoDeviceSelected => Some("Power on the LED strip and scan again"),
            Self::ProtocolMismatch { .. } => Some("Select a different protocol or pair the device again"),
            Self::RetriesExhausted { .. } | Self::ReconnectExhausted { .. } => {
                Some("Reconnect to the device manually")
            }
            Self::ConnectFailed { kind: ConnectFailureKind::Network, .. } => {
                Some("Move closer to the device and make sure it is powered")
            }
            _ => None,
        }
    }
}

/// Errors raised by the device registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Name cannot be empty")]
    EmptyName,

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Unknown group: {0}")]
    UnknownGroup(String),

    #[error("Group {0} cannot be moved under its own subtree")]
    GroupCycle(String),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Convenience alias for session and transport results.
pub type Result<T> = std::result::Result<T, LedError>;
