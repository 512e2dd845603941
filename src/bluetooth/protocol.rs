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

//! LED protocol profiles and command frame encoding.
//!
//! Every frame is a fixed-length byte array delimited by [`frame::START`]
//! and [`frame::END`]. Encoding never fails: out-of-range input is clamped
//! and NaN coerces to zero.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ble_constants::{elk, frame, generic, opcode};

/// Supported LED protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceProfile {
    #[serde(rename = "elk-bledom")]
    ElkBledom,
    #[serde(rename = "generic")]
    Generic,
}

impl DeviceProfile {
    /// All profiles, in detection order.
    pub const ALL: [DeviceProfile; 2] = [DeviceProfile::ElkBledom, DeviceProfile::Generic];

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ElkBledom => "elk-bledom",
            Self::Generic => "generic",
        }
    }

    pub fn service_uuid(&self) -> Uuid {
        match self {
            Self::ElkBledom => elk::SERVICE_UUID,
            Self::Generic => generic::SERVICE_UUID,
        }
    }

    pub fn write_uuid(&self) -> Uuid {
        match self {
            Self::ElkBledom => elk::WRITE_UUID,
            Self::Generic => generic::WRITE_UUID,
        }
    }

    pub fn name_prefixes(&self) -> &'static [&'static str] {
        match self {
            Self::ElkBledom => elk::NAME_PREFIXES,
            Self::Generic => generic::NAME_PREFIXES,
        }
    }

    /// Fixed length of every frame in this protocol.
    pub fn frame_len(&self) -> usize {
        match self {
            Self::ElkBledom => elk::FRAME_LEN,
            Self::Generic => generic::FRAME_LEN,
        }
    }

    /// Guess the protocol from an advertised device name.
    pub fn detect(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|profile| profile.matches_name(name))
    }

    /// Check whether a device name carries one of this profile's prefixes.
    pub fn matches_name(&self, name: &str) -> bool {
        self.name_prefixes()
            .iter()
            .any(|prefix| name.starts_with(prefix))
    }

    /// Second frame byte.
    fn mode_byte(&self) -> u8 {
        match self {
            Self::ElkBledom => 0x00,
            Self::Generic => 0x07,
        }
    }

    /// Build a frame from an opcode and its body bytes.
    ///
    /// The body is zero-padded to the profile's frame length.
    fn build(&self, op: u8, body: &[u8]) -> Frame {
        let len = self.frame_len();
        let mut bytes = vec![0u8; len];
        bytes[0] = frame::START;
        bytes[1] = self.mode_byte();
        bytes[2] = op;
        let body_room = len - 4;
        for (slot, byte) in bytes[3..3 + body_room].iter_mut().zip(body) {
            *slot = *byte;
        }
        bytes[len - 1] = frame::END;
        Frame(bytes)
    }
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceProfile {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "elk-bledom" | "elk" | "bledom" => Ok(Self::ElkBledom),
            "generic" | "ledble" => Ok(Self::Generic),
            other => Err(anyhow!("Unknown protocol: {}", other)),
        }
    }
}

/// One encoded command, ready to be written to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Vec<u8>);

impl Frame {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

/// Clamp a numeric input into `[0, max]`.
fn clamp_input(value: f64, max: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, max)
}

fn to_byte(value: f64, max: f64) -> u8 {
    clamp_input(value, max).round() as u8
}

/// Power on or off.
pub fn encode_power(profile: DeviceProfile, on: bool) -> Frame {
    match (profile, on) {
        (DeviceProfile::ElkBledom, true) => profile.build(opcode::POWER, &[0xF0, 0x00, 0x01, 0xFF]),
        (DeviceProfile::ElkBledom, false) => profile.build(opcode::POWER, &[0x00, 0x00, 0x00, 0xFF]),
        (DeviceProfile::Generic, true) => profile.build(opcode::POWER, &[0x01]),
        (DeviceProfile::Generic, false) => profile.build(opcode::POWER, &[0x00]),
    }
}

/// Static RGB color.
///
/// The generic protocol carries a trailing checksum of `(r + g + b) mod 256`.
pub fn encode_color(
    profile: DeviceProfile,
    r: impl Into<f64>,
    g: impl Into<f64>,
    b: impl Into<f64>,
) -> Frame {
    let r = to_byte(r.into(), 255.0);
    let g = to_byte(g.into(), 255.0);
    let b = to_byte(b.into(), 255.0);

    match profile {
        DeviceProfile::ElkBledom => profile.build(opcode::COLOR, &[0x03, r, g, b]),
        DeviceProfile::Generic => {
            let checksum = r.wrapping_add(g).wrapping_add(b);
            profile.build(opcode::COLOR, &[0x03, r, g, b, 0x10, checksum])
        }
    }
}

/// Brightness as a percentage, scaled to a full byte.
pub fn encode_brightness(profile: DeviceProfile, level: impl Into<f64>) -> Frame {
    let level = clamp_input(level.into(), 100.0);
    let scaled = (level / 100.0 * 255.0).round() as u8;
    profile.build(opcode::BRIGHTNESS, &[scaled])
}

/// Built-in animation by id.
pub fn encode_effect(profile: DeviceProfile, id: impl Into<f64>) -> Frame {
    let id = to_byte(id.into(), 255.0);
    profile.build(opcode::EFFECT, &[id, 0x03])
}

/// Animation speed as a percentage.
pub fn encode_effect_speed(profile: DeviceProfile, speed: impl Into<f64>) -> Frame {
    let speed = to_byte(speed.into(), 100.0);
    profile.build(opcode::SPEED, &[speed])
}

/// Semantic LED command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedCommand {
    Power(bool),
    Color { r: u8, g: u8, b: u8 },
    Brightness(u8),
    Effect(u8),
    EffectSpeed(u8),
}

impl LedCommand {
    /// Encode for the given protocol.
    pub fn encode(&self, profile: DeviceProfile) -> Frame {
        match *self {
            Self::Power(on) => encode_power(profile, on),
            Self::Color { r, g, b } => encode_color(profile, r, g, b),
            Self::Brightness(level) => encode_brightness(profile, level),
            Self::Effect(id) => encode_effect(profile, id),
            Self::EffectSpeed(speed) => encode_effect_speed(profile, speed),
        }
    }
}

/// Built-in effects understood by both protocols.
pub const EFFECTS: &[(&str, u8)] = &[
    ("jump_rgb", 0x87),
    ("jump_all", 0x88),
    ("crossfade_rgb", 0x89),
    ("crossfade_all", 0x8A),
    ("crossfade_red", 0x8B),
    ("crossfade_green", 0x8C),
    ("crossfade_blue", 0x8D),
    ("crossfade_yellow", 0x8E),
    ("crossfade_cyan", 0x8F),
    ("crossfade_magenta", 0x90),
    ("crossfade_white", 0x91),
    ("crossfade_red_green", 0x92),
    ("crossfade_red_blue", 0x93),
    ("crossfade_green_blue", 0x94),
    ("blink_all", 0x95),
    ("blink_red", 0x96),
    ("blink_green", 0x97),
    ("blink_blue", 0x98),
    ("blink_yellow", 0x99),
    ("blink_cyan", 0x9A),
    ("blink_magenta", 0x9B),
    ("blink_white", 0x9C),
];

/// Look up an effect id by name (case-insensitive).
pub fn effect_by_name(name: &str) -> Option<u8> {
    let name = name.trim().to_lowercase();
    EFFECTS
        .iter()
        .find(|(effect, _)| *effect == name)
        .map(|(_, id)| *id)
}
