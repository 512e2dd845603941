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

//! Connection lifecycle for a single LED device.
//!
//! A session owns at most one [`BleLink`]. Unexpected link drops are
//! detected by a monitor task and repaired by [`ConnectionSession::recover`],
//! which is also the entry point used by the command transport when it
//! finds the link closed. Both paths share one recovery lock, so one drop
//! yields one recovery run.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use super::ble_constants::timing;
use super::platform::{wait_for_drop, BleLink, BlePlatform, DeviceHandle, ScanFilter};
use super::protocol::DeviceProfile;
use crate::error::{LedError, Result};

/// Capacity of the session event queue.
const EVENT_QUEUE: usize = 64;

/// State of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting,
    Connected,
    /// Automatic recovery after an unexpected drop.
    Reconnecting { attempt: u32 },
    Disconnected,
}

/// Events emitted by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Link established (initial connect or successful reconnect).
    Connected {
        device_id: String,
        device_name: String,
        profile: DeviceProfile,
    },
    /// An explicit connect attempt failed.
    ConnectFailed {
        device_id: String,
        device_name: String,
        error: String,
    },
    /// Link closed. `requested` is false for unexpected drops.
    Disconnected {
        device_id: String,
        device_name: String,
        requested: bool,
    },
    /// A reconnection attempt is about to start.
    ReconnectAttempt {
        device_id: String,
        attempt: u32,
        of: u32,
    },
    /// A reconnection attempt failed; more may follow.
    ReconnectFailed {
        device_id: String,
        attempt: u32,
        error: String,
    },
    /// Automatic recovery gave up.
    ReconnectExhausted {
        device_id: String,
        device_name: String,
        attempts: u32,
    },
}

/// Session timing.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            reconnect_attempts: timing::RECONNECT_ATTEMPTS,
            reconnect_delay: Duration::from_secs(timing::RECONNECT_DELAY_SECS),
        }
    }
}

struct SessionInner {
    state: SessionState,
    device: Option<DeviceHandle>,
    profile: Option<DeviceProfile>,
    link: Option<Arc<dyn BleLink>>,
    /// Bumped on every connect, disconnect and established link. Monitors
    /// and recovery runs compare against the value they started with.
    generation: u64,
    /// Set by `disconnect`, cleared by `connect`. Suppresses recovery.
    manual_disconnect: bool,
    /// Set when recovery gave up; only an explicit `connect` clears it.
    recovery_exhausted: bool,
    last_command_at: Option<Instant>,
}

/// One logical connection to one LED device.
pub struct ConnectionSession {
    platform: Arc<dyn BlePlatform>,
    config: SessionConfig,
    inner: Mutex<SessionInner>,
    recovery: tokio::sync::Mutex<()>,
    event_tx: mpsc::Sender<SessionEvent>,
}

impl ConnectionSession {
    /// Create a session and the receiver for its events.
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        config: SessionConfig,
    ) -> (Arc<Self>, mpsc::Receiver<SessionEvent>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let session = Arc::new(Self {
            platform,
            config,
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                device: None,
                profile: None,
                link: None,
                generation: 0,
                manual_disconnect: false,
                recovery_exhausted: false,
                last_command_at: None,
            }),
            recovery: tokio::sync::Mutex::new(()),
            event_tx,
        });
        (session, event_rx)
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().state == SessionState::Connected
    }

    /// Protocol used for the current or last connection.
    pub fn profile(&self) -> Option<DeviceProfile> {
        self.inner.lock().profile
    }

    /// Time of the last successfully written command.
    pub fn last_command_at(&self) -> Option<Instant> {
        self.inner.lock().last_command_at
    }

    pub(crate) fn mark_command_sent(&self, at: Instant) {
        self.inner.lock().last_command_at = Some(at);
    }

    /// Live link, when connected.
    pub(crate) fn link(&self) -> Option<Arc<dyn BleLink>> {
        let inner = self.inner.lock();
        match inner.state {
            SessionState::Connected => inner.link.clone(),
            _ => None,
        }
    }

    /// Run device discovery, optionally restricted to one protocol.
    pub async fn scan(&self, hint: Option<DeviceProfile>) -> Result<DeviceHandle> {
        let previous = {
            let mut inner = self.inner.lock();
            let previous = inner.state;
            inner.state = SessionState::Scanning;
            previous
        };

        info!("Scanning for LED devices...");
        let result = self.platform.scan(&ScanFilter::for_profile(hint)).await;

        {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Scanning {
                inner.state = previous;
            }
        }

        match &result {
            Ok(device) => info!("Found device: {} ({})", device.display_name(), device.id),
            Err(e) => warn!("Scan failed: {}", e),
        }
        result
    }

    /// Connect to a device, replacing any existing link.
    pub async fn connect(self: &Arc<Self>, device: DeviceHandle, profile: DeviceProfile) -> Result<()> {
        let has_link = self.inner.lock().link.is_some();
        if has_link {
            self.disconnect().await?;
        }

        {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            inner.state = SessionState::Connecting;
            inner.manual_disconnect = false;
            inner.recovery_exhausted = false;
        }

        match self.establish(&device, profile).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("Failed to connect to {}: {}", device.display_name(), e);
                self.emit(SessionEvent::ConnectFailed {
                    device_id: device.id.clone(),
                    device_name: device.display_name().to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Close the link on request. Suppresses automatic recovery.
    ///
    /// Calling this on a disconnected session does nothing.
    pub async fn disconnect(&self) -> Result<()> {
        let closing = {
            let mut inner = self.inner.lock();
            inner.manual_disconnect = true;
            inner.generation += 1;
            if !matches!(inner.state, SessionState::Scanning) {
                inner.state = SessionState::Disconnected;
            }
            inner.link.take().map(|link| (link, inner.device.clone()))
        };

        let Some((link, device)) = closing else {
            debug!("Disconnect requested, no active link");
            return Ok(());
        };

        if let Err(e) = link.close().await {
            warn!("Error while closing link: {}", e);
        }

        if let Some(device) = device {
            info!("Disconnected from {}", device.display_name());
            self.emit(SessionEvent::Disconnected {
                device_id: device.id.clone(),
                device_name: device.display_name().to_string(),
                requested: true,
            });
        }
        Ok(())
    }

    /// Repair a dropped link.
    ///
    /// Returns immediately if the link is open (someone else already
    /// recovered). Otherwise waits and reconnects up to the configured
    /// number of attempts.
    pub async fn recover(self: &Arc<Self>) -> Result<()> {
        let _guard = self.recovery.lock().await;

        let (device, profile, had_link, epoch) = {
            let mut inner = self.inner.lock();
            if inner.manual_disconnect {
                return Err(LedError::NotConnected);
            }
            if let Some(link) = &inner.link {
                if link.is_open() {
                    return Ok(());
                }
            }
            if inner.recovery_exhausted {
                return Err(LedError::ReconnectExhausted {
                    attempts: self.config.reconnect_attempts,
                });
            }
            let had_link = inner.link.take().is_some();
            inner.state = SessionState::Disconnected;
            match (inner.device.clone(), inner.profile) {
                (Some(device), Some(profile)) => (device, profile, had_link, inner.generation),
                _ => return Err(LedError::NotConnected),
            }
        };

        if had_link {
            warn!("Link to {} lost", device.display_name());
            self.emit(SessionEvent::Disconnected {
                device_id: device.id.clone(),
                device_name: device.display_name().to_string(),
                requested: false,
            });
        }

        self.reconnect(&device, profile, epoch).await
    }

    /// Whether a connect or disconnect happened since recovery started.
    fn recovery_cancelled(&self, epoch: u64) -> bool {
        let inner = self.inner.lock();
        inner.manual_disconnect || inner.generation != epoch
    }

    async fn reconnect(
        self: &Arc<Self>,
        device: &DeviceHandle,
        profile: DeviceProfile,
        epoch: u64,
    ) -> Result<()> {
        let attempts = self.config.reconnect_attempts;

        for attempt in 1..=attempts {
            {
                let mut inner = self.inner.lock();
                if inner.manual_disconnect || inner.generation != epoch {
                    return Err(LedError::NotConnected);
                }
                inner.state = SessionState::Reconnecting { attempt };
            }
            info!(
                "Reconnecting to {} (attempt {}/{})",
                device.display_name(),
                attempt,
                attempts
            );
            self.emit(SessionEvent::ReconnectAttempt {
                device_id: device.id.clone(),
                attempt,
                of: attempts,
            });

            sleep(self.config.reconnect_delay).await;

            if self.recovery_cancelled(epoch) {
                info!("Reconnection cancelled");
                return Err(LedError::NotConnected);
            }

            match self.establish(device, profile).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("Reconnect attempt {} failed: {}", attempt, e);
                    self.emit(SessionEvent::ReconnectFailed {
                        device_id: device.id.clone(),
                        attempt,
                        error: e.to_string(),
                    });
                }
            }
        }

        {
            let mut inner = self.inner.lock();
            if inner.manual_disconnect || inner.generation != epoch {
                return Err(LedError::NotConnected);
            }
            inner.state = SessionState::Disconnected;
            inner.recovery_exhausted = true;
        }
        error!(
            "Giving up on {} after {} reconnection attempts",
            device.display_name(),
            attempts
        );
        self.emit(SessionEvent::ReconnectExhausted {
            device_id: device.id.clone(),
            device_name: device.display_name().to_string(),
            attempts,
        });
        Err(LedError::ReconnectExhausted { attempts })
    }

    /// Open the link and install it.
    async fn establish(self: &Arc<Self>, device: &DeviceHandle, profile: DeviceProfile) -> Result<()> {
        let started = {
            let mut inner = self.inner.lock();
            inner.device = Some(device.clone());
            inner.profile = Some(profile);
            if !matches!(inner.state, SessionState::Reconnecting { .. }) {
                inner.state = SessionState::Connecting;
            }
            inner.generation
        };

        info!("Connecting to {} as {}", device.display_name(), profile);
        let connect_timeout = self.config.connect_timeout;
        let result = match timeout(connect_timeout, self.platform.connect(device, profile)).await {
            Ok(result) => result,
            Err(_) => Err(LedError::Timeout(connect_timeout)),
        };

        let link: Arc<dyn BleLink> = match result {
            Ok(link) => Arc::from(link),
            Err(e) => {
                let mut inner = self.inner.lock();
                let superseded = inner.generation != started;
                if !superseded && !matches!(inner.state, SessionState::Reconnecting { .. }) {
                    inner.state = SessionState::Disconnected;
                }
                return Err(e);
            }
        };

        let installed = {
            let mut inner = self.inner.lock();
            if inner.generation != started {
                None
            } else {
                inner.generation += 1;
                inner.link = Some(link.clone());
                inner.state = SessionState::Connected;
                Some(inner.generation)
            }
        };

        let Some(generation) = installed else {
            debug!("Session changed while connecting, closing new link");
            if let Err(e) = link.close().await {
                warn!("Error while closing link: {}", e);
            }
            return Err(LedError::NotConnected);
        };

        self.spawn_monitor(link.as_ref(), generation);

        info!("Connected to {}", device.display_name());
        self.emit(SessionEvent::Connected {
            device_id: device.id.clone(),
            device_name: device.display_name().to_string(),
            profile,
        });
        Ok(())
    }

    /// Watch the link and start recovery when it drops.
    fn spawn_monitor(self: &Arc<Self>, link: &dyn BleLink, generation: u64) {
        let state = link.link_state();
        let session: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            wait_for_drop(state).await;

            let Some(session) = session.upgrade() else {
                return;
            };
            let current = {
                let inner = session.inner.lock();
                inner.generation == generation && !inner.manual_disconnect
            };
            if !current {
                debug!("Ignoring close of superseded link (generation {})", generation);
                return;
            }
            if let Err(e) = session.recover().await {
                debug!("Recovery ended: {}", e);
            }
        });
    }

    fn emit(&self, event: SessionEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(event) => {
                    warn!("Session event queue full, dropping {:?}", event)
                }
                mpsc::error::TrySendError::Closed(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::mock::MockPlatform;
    use crate::error::MissingEndpoint;

    fn session_with_device() -> (
        Arc<ConnectionSession>,
        mpsc::Receiver<SessionEvent>,
        MockPlatform,
        DeviceHandle,
    ) {
        let platform = MockPlatform::new();
        let device = platform.add_device("AA:01", "ELK-BLEDOM-42", DeviceProfile::ElkBledom);
        let (session, events) =
            ConnectionSession::new(Arc::new(platform.clone()), SessionConfig::default());
        (session, events, platform, device)
    }

    async fn next_event(events: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
        events.recv().await.expect("event channel closed")
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_and_disconnect() {
        let (session, mut events, _platform, device) = session_with_device();
        assert_eq!(session.state(), SessionState::Idle);

        session.connect(device, DeviceProfile::ElkBledom).await.unwrap();
        assert!(session.is_connected());
        assert!(matches!(next_event(&mut events).await, SessionEvent::Connected { .. }));

        session.disconnect().await.unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Disconnected { requested: true, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_idempotent() {
        let (session, mut events, platform, device) = session_with_device();
        session.connect(device, DeviceProfile::ElkBledom).await.unwrap();
        let _ = next_event(&mut events).await;

        session.disconnect().await.unwrap();
        session.disconnect().await.unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
        let _ = next_event(&mut events).await;

        // No recovery after an explicit disconnect.
        sleep(Duration::from_secs(30)).await;
        assert_eq!(platform.connect_count(), 1);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_drop() {
        let (session, mut events, platform, device) = session_with_device();
        session.connect(device, DeviceProfile::ElkBledom).await.unwrap();
        let _ = next_event(&mut events).await;

        let dropped_at = Instant::now();
        platform.drop_link();

        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Disconnected { requested: false, .. }
        ));
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::ReconnectAttempt { attempt: 1, of: 3, .. }
        ));
        assert!(matches!(next_event(&mut events).await, SessionEvent::Connected { .. }));

        assert!(dropped_at.elapsed() >= Duration::from_secs(3));
        assert!(session.is_connected());
        assert_eq!(platform.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_exhausted() {
        let (session, mut events, platform, device) = session_with_device();
        session.connect(device, DeviceProfile::ElkBledom).await.unwrap();
        let _ = next_event(&mut events).await;

        platform.fail_next_connects(3);
        platform.drop_link();

        let mut failures = 0;
        loop {
            match next_event(&mut events).await {
                SessionEvent::ReconnectFailed { .. } => failures += 1,
                SessionEvent::ReconnectExhausted { attempts, .. } => {
                    assert_eq!(attempts, 3);
                    break;
                }
                SessionEvent::Connected { .. } => panic!("unexpected reconnect"),
                _ => {}
            }
        }

        assert_eq!(failures, 3);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(platform.connect_count(), 4);
        assert!(matches!(
            session.recover().await,
            Err(LedError::ReconnectExhausted { attempts: 3 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_reconnect() {
        let (session, mut events, platform, device) = session_with_device();
        session.connect(device, DeviceProfile::ElkBledom).await.unwrap();
        let _ = next_event(&mut events).await;

        platform.drop_link();
        let _ = next_event(&mut events).await;
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::ReconnectAttempt { .. }
        ));

        session.disconnect().await.unwrap();
        sleep(Duration::from_secs(10)).await;

        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(platform.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_protocol_mismatch() {
        let platform = MockPlatform::new();
        let device = platform.add_device_with_layout(
            "AA:09",
            "ELK-BLE-9",
            vec![DeviceProfile::ElkBledom.service_uuid()],
            vec![],
        );
        let (session, mut events) =
            ConnectionSession::new(Arc::new(platform.clone()), SessionConfig::default());

        let err = session
            .connect(device, DeviceProfile::ElkBledom)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedError::ProtocolMismatch {
                missing: MissingEndpoint::Characteristic(_)
            }
        ));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::ConnectFailed { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_restores_state() {
        let (session, _events, platform, _device) = session_with_device();
        let found = session.scan(None).await.unwrap();
        assert_eq!(found.name.as_deref(), Some("ELK-BLEDOM-42"));
        assert_eq!(session.state(), SessionState::Idle);

        platform.set_unavailable(true);
        assert!(matches!(
            session.scan(None).await,
            Err(LedError::PlatformUnavailable(_))
        ));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_picker() {
        let (session, _events, platform, _device) = session_with_device();
        platform.cancel_picker(true);

        assert!(matches!(
            session.scan(None).await,
            Err(LedError::NoDeviceSelected)
        ));
        assert_eq!(session.state(), SessionState::Idle);

        platform.cancel_picker(false);
        assert!(session.scan(None).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_without_adapter() {
        let (session, mut events, platform, device) = session_with_device();
        platform.set_unavailable(true);

        let err = session
            .connect(device, DeviceProfile::ElkBledom)
            .await
            .unwrap_err();
        assert!(matches!(err, LedError::PlatformUnavailable(_)));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::ConnectFailed { .. }
        ));

        // A failed explicit connect is not retried.
        sleep(Duration::from_secs(30)).await;
        assert_eq!(platform.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_connect_during_reconnect() {
        let (session, _events, platform, device) = session_with_device();
        session
            .connect(device.clone(), DeviceProfile::ElkBledom)
            .await
            .unwrap();

        platform.set_connect_delay(Duration::from_secs(1));
        platform.fail_next_connects(1);
        platform.drop_link();

        // The first reconnect attempt is in flight from 3s to 4s.
        sleep(Duration::from_millis(3500)).await;
        let manual = {
            let session = session.clone();
            tokio::spawn(async move { session.connect(device, DeviceProfile::ElkBledom).await })
        };

        // The reconnect attempt failed at 4s; the manual connect is still running.
        sleep(Duration::from_millis(700)).await;
        assert_eq!(session.state(), SessionState::Connecting);

        manual.await.unwrap().unwrap();
        assert!(session.is_connected());

        sleep(Duration::from_secs(10)).await;
        assert!(session.is_connected());
        assert_eq!(platform.connect_count(), 3);
    }
}
