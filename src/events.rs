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

//! Session event processing.
//!
//! Applies [`SessionEvent`]s to the device registry (history, usage
//! counters) and to the shared [`AppState`].

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bluetooth::SessionEvent;
use crate::state::AppState;
use crate::storage::{DeviceRegistry, HistoryOutcome};

/// Process events from a connection session.
pub struct EventProcessor {
    registry: Arc<DeviceRegistry>,
    state: Arc<AppState>,
}

impl EventProcessor {
    pub fn new(registry: Arc<DeviceRegistry>, state: Arc<AppState>) -> Self {
        Self { registry, state }
    }

    /// Consume events until the session goes away.
    pub async fn run(self, mut events: mpsc::Receiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.process_event(event) {
                error!("Failed to process session event: {}", e);
            }
        }
        debug!("Session event stream closed");
    }

    /// Process a single event.
    pub fn process_event(&self, event: SessionEvent) -> Result<()> {
        match event {
            SessionEvent::Connected {
                device_id,
                device_name,
                profile,
            } => {
                info!("Device connected: {} ({})", device_name, profile);
                self.state.set_connected(device_name.clone());
                if self.registry.device(&device_id).is_some() {
                    self.registry.record_connection(&device_id)?;
                } else {
                    warn!("Connected to unregistered device {}", device_id);
                }
                self.registry
                    .add_to_history(&device_id, &device_name, HistoryOutcome::Connected)?;
            }
            SessionEvent::ConnectFailed {
                device_id,
                device_name,
                error,
            } => {
                self.state.set_error(error);
                self.registry
                    .add_to_history(&device_id, &device_name, HistoryOutcome::Failed)?;
            }
            SessionEvent::Disconnected {
                device_id,
                device_name,
                requested,
            } => {
                if requested {
                    info!("Device disconnected: {}", device_name);
                } else {
                    warn!("Device dropped: {}", device_name);
                }
                self.state.set_disconnected();
                self.registry
                    .add_to_history(&device_id, &device_name, HistoryOutcome::Disconnected)?;
            }
            SessionEvent::ReconnectAttempt { attempt, of, .. } => {
                debug!("Reconnect attempt {}/{}", attempt, of);
                self.state.set_reconnecting();
            }
            SessionEvent::ReconnectFailed {
                device_id,
                attempt,
                error,
            } => {
                debug!("Reconnect attempt {} failed: {}", attempt, error);
                let name = self.device_name(&device_id);
                self.registry
                    .add_to_history(&device_id, &name, HistoryOutcome::Failed)?;
            }
            SessionEvent::ReconnectExhausted {
                device_name,
                attempts,
                ..
            } => {
                self.state.set_error(format!(
                    "Lost connection to {} after {} reconnection attempts",
                    device_name, attempts
                ));
            }
        }
        Ok(())
    }

    fn device_name(&self, device_id: &str) -> String {
        self.registry
            .device(device_id)
            .map(|device| device.name)
            .unwrap_or_else(|| device_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::DeviceProfile;
    use crate::state::ConnectionStatus;
    use crate::storage::{DeviceRecord, MemoryStore};

    fn processor() -> (EventProcessor, Arc<DeviceRegistry>, Arc<AppState>) {
        let registry = Arc::new(DeviceRegistry::load(Arc::new(MemoryStore::new())).unwrap());
        registry
            .add_device(DeviceRecord::new("AA:01", "Desk", DeviceProfile::ElkBledom))
            .unwrap();
        let state = AppState::new();
        (EventProcessor::new(registry.clone(), state.clone()), registry, state)
    }

    #[test]
    fn test_connected_updates_registry() {
        let (processor, registry, state) = processor();
        processor
            .process_event(SessionEvent::Connected {
                device_id: "AA:01".into(),
                device_name: "Desk".into(),
                profile: DeviceProfile::ElkBledom,
            })
            .unwrap();

        assert_eq!(state.get_status(), ConnectionStatus::Connected);
        assert_eq!(registry.device("AA:01").unwrap().connection_count, 1);
        assert_eq!(registry.history()[0].outcome, HistoryOutcome::Connected);
    }

    #[test]
    fn test_failures_are_recorded() {
        let (processor, registry, state) = processor();
        processor
            .process_event(SessionEvent::ReconnectFailed {
                device_id: "AA:01".into(),
                attempt: 1,
                error: "timeout".into(),
            })
            .unwrap();
        processor
            .process_event(SessionEvent::ReconnectExhausted {
                device_id: "AA:01".into(),
                device_name: "Desk".into(),
                attempts: 3,
            })
            .unwrap();

        let history = registry.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].device_name, "Desk");
        assert_eq!(history[0].outcome, HistoryOutcome::Failed);
        assert_eq!(state.get_status(), ConnectionStatus::Error);
        assert!(state.get_last_error().unwrap().contains("3 reconnection attempts"));
    }
}
