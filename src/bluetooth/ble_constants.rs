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

//! BLE service and characteristic UUIDs for the supported LED protocols.

use uuid::Uuid;

/// ELK-BLEDOM protocol.
pub mod elk {
    use super::Uuid;

    /// GATT service exposed by ELK-BLEDOM modules.
    pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fff0_0000_1000_8000_00805f9b34fb);

    /// Command characteristic.
    /// Properties: Write, Write Without Response
    pub const WRITE_UUID: Uuid = Uuid::from_u128(0x0000fff3_0000_1000_8000_00805f9b34fb);

    /// Advertised name prefixes.
    pub const NAME_PREFIXES: &[&str] = &["ELK-BLEDOM", "ELK-BLE", "ELK-BULB", "ELK-LAMPL", "MELK"];

    /// Length of every frame.
    pub const FRAME_LEN: usize = 9;
}

/// Generic "LEDBLE" protocol.
pub mod generic {
    use super::Uuid;

    /// GATT service exposed by generic LED controllers.
    pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);

    /// Command characteristic.
    /// Properties: Write, Write Without Response
    pub const WRITE_UUID: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

    /// Advertised name prefixes.
    pub const NAME_PREFIXES: &[&str] = &["LEDBLE", "LED-", "QHM-"];

    /// Length of every frame.
    pub const FRAME_LEN: usize = 10;
}

/// Frame sentinels shared by both protocols.
pub mod frame {
    pub const START: u8 = 0x7E;
    pub const END: u8 = 0xEF;
}

/// Command opcodes (third byte of a frame).
pub mod opcode {
    pub const BRIGHTNESS: u8 = 0x01;
    pub const SPEED: u8 = 0x02;
    pub const EFFECT: u8 = 0x03;
    pub const POWER: u8 = 0x04;
    pub const COLOR: u8 = 0x05;
}

/// Timing defaults for the command transport and session recovery.
pub mod timing {
    /// Minimum spacing between two writes, in milliseconds.
    pub const MIN_SPACING_MS: u64 = 50;

    /// Wait after a successful write, in milliseconds.
    pub const SETTLE_MS: u64 = 50;

    /// Bound on a single characteristic write, in milliseconds.
    pub const WRITE_TIMEOUT_MS: u64 = 5000;

    /// Write attempts per command.
    pub const MAX_RETRIES: u32 = 3;

    /// Linear backoff step between attempts, in milliseconds.
    pub const BACKOFF_STEP_MS: u64 = 100;

    /// Reconnection attempts after an unexpected drop.
    pub const RECONNECT_ATTEMPTS: u32 = 3;

    /// Wait before each reconnection attempt, in seconds.
    pub const RECONNECT_DELAY_SECS: u64 = 3;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            elk::SERVICE_UUID.to_string().to_lowercase(),
            "0000fff0-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            elk::WRITE_UUID.to_string().to_lowercase(),
            "0000fff3-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            generic::WRITE_UUID.to_string().to_lowercase(),
            "0000ffe1-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_prefixes_do_not_overlap() {
        for elk_prefix in elk::NAME_PREFIXES {
            for generic_prefix in generic::NAME_PREFIXES {
                assert!(!elk_prefix.starts_with(generic_prefix));
                assert!(!generic_prefix.starts_with(elk_prefix));
            }
        }
    }
}
