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

//! Bluetooth LE control of LED strips.
//!
//! Frames are built by [`protocol`], delivered by [`CommandTransport`] over
//! a [`ConnectionSession`], which talks to a [`BlePlatform`] backend.

pub mod ble_constants;
#[cfg(feature = "bluez")]
mod bluez;
pub mod mock;
mod platform;
pub mod protocol;
mod session;
mod transport;

#[cfg(feature = "bluez")]
pub use bluez::BluezPlatform;
pub use platform::{wait_for_drop, BleLink, BlePlatform, DeviceHandle, ScanFilter};
pub use protocol::{
    effect_by_name, encode_brightness, encode_color, encode_effect, encode_effect_speed,
    encode_power, DeviceProfile, Frame, LedCommand, EFFECTS,
};
pub use session::{ConnectionSession, SessionConfig, SessionEvent, SessionState};
pub use transport::{CommandTransport, TransportConfig};
