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

//! LED controller.
//!
//! Owns one session, its transport and the event processor, and keeps the
//! device registry in step with what the session does.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::bluetooth::{
    effect_by_name, BlePlatform, CommandTransport, ConnectionSession, DeviceHandle,
    DeviceProfile, LedCommand,
};
use crate::config::Config;
use crate::error::{LedError, RegistryError};
use crate::events::EventProcessor;
use crate::state::AppState;
use crate::storage::{DeviceRecord, DeviceRegistry};

pub struct LedController {
    session: Arc<ConnectionSession>,
    transport: CommandTransport,
    registry: Arc<DeviceRegistry>,
    state: Arc<AppState>,
    preferred_protocol: Option<DeviceProfile>,
}

impl LedController {
    /// Build the controller and start its background tasks.
    pub fn new(platform: Arc<dyn BlePlatform>, registry: Arc<DeviceRegistry>, config: &Config) -> Self {
        let (session, events) = ConnectionSession::new(platform, config.session_config());
        let transport = CommandTransport::spawn(session.clone(), config.transport_config());
        let state = AppState::new();

        let processor = EventProcessor::new(registry.clone(), state.clone());
        tokio::spawn(processor.run(events));

        Self {
            session,
            transport,
            registry,
            state,
            preferred_protocol: config.bluetooth.preferred_protocol,
        }
    }

    pub fn session(&self) -> &Arc<ConnectionSession> {
        &self.session
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Discover a device and connect to it.
    ///
    /// A device seen for the first time is added to the registry.
    pub async fn scan_and_connect(&self) -> Result<DeviceRecord> {
        self.state.set_connecting();
        let found = match self.session.scan(self.preferred_protocol).await {
            Ok(found) => found,
            Err(e) => {
                self.report(&e);
                self.state.set_disconnected();
                return Err(e.into());
            }
        };

        let record = match self.registry.device(&found.id) {
            Some(record) => record,
            None => {
                let profile = self
                    .preferred_protocol
                    .or_else(|| found.detected_profile())
                    .unwrap_or(DeviceProfile::ElkBledom);
                let record = DeviceRecord::new(found.id.clone(), found.display_name(), profile);
                self.registry.add_device(record.clone())?;
                record
            }
        };

        self.connect_record(&record).await?;
        Ok(record)
    }

    /// Connect to a registered device.
    pub async fn connect_known(&self, device_id: &str) -> Result<DeviceRecord> {
        let record = self
            .registry
            .device(device_id)
            .ok_or_else(|| RegistryError::UnknownDevice(device_id.to_string()))?;
        self.state.set_connecting();
        self.connect_record(&record).await?;
        Ok(record)
    }

    /// Connect to the best auto-connect candidate, if there is one.
    pub async fn auto_connect(&self) -> Result<Option<DeviceRecord>> {
        let Some(candidate) = self.registry.auto_connect_candidate() else {
            debug!("No auto-connect candidate");
            return Ok(None);
        };
        info!("Auto-connecting to {}", candidate.name);
        self.connect_known(&candidate.id).await.map(Some)
    }

    async fn connect_record(&self, record: &DeviceRecord) -> Result<()> {
        let handle = DeviceHandle::new(record.id.clone(), Some(record.name.clone()));
        self.session
            .connect(handle, record.profile)
            .await
            .map_err(Into::into)
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.session.disconnect().await?;
        Ok(())
    }

    /// Encode and deliver one command. Returns `false` if it was not delivered.
    pub async fn send(&self, command: LedCommand) -> bool {
        let Some(profile) = self.session.profile() else {
            debug!("No device selected, dropping {:?}", command);
            return false;
        };

        match self.transport.try_send(command.encode(profile)).await {
            Ok(()) => true,
            Err(e) => {
                self.report(&e);
                false
            }
        }
    }

    pub async fn power(&self, on: bool) -> bool {
        self.send(LedCommand::Power(on)).await
    }

    pub async fn set_color(&self, r: u8, g: u8, b: u8) -> bool {
        self.send(LedCommand::Color { r, g, b }).await
    }

    /// Brightness in percent.
    pub async fn set_brightness(&self, level: u8) -> bool {
        self.send(LedCommand::Brightness(level)).await
    }

    pub async fn set_effect(&self, id: u8) -> bool {
        self.send(LedCommand::Effect(id)).await
    }

    /// Start a built-in effect by name.
    pub async fn set_effect_by_name(&self, name: &str) -> bool {
        match effect_by_name(name) {
            Some(id) => self.set_effect(id).await,
            None => {
                warn!("Unknown effect: {}", name);
                false
            }
        }
    }

    /// Effect speed in percent.
    pub async fn set_effect_speed(&self, speed: u8) -> bool {
        self.send(LedCommand::EffectSpeed(speed)).await
    }

    fn report(&self, error: &LedError) {
        if error.is_user_visible() {
            match error.suggestion() {
                Some(hint) => warn!("{} ({})", error, hint),
                None => warn!("{}", error),
            }
            self.state.report_error(error.to_string());
        } else {
            debug!("{}", error);
        }
    }
}
