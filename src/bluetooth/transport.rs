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

//! Reliable command delivery over a [`ConnectionSession`].
//!
//! All frames for a session go through one queue drained by a single
//! worker task, so minimum spacing holds even when several callers send
//! at once. Each frame gets a bounded number of write attempts with a
//! per-write timeout and linear backoff between attempts.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, warn};

use super::ble_constants::timing;
use super::protocol::Frame;
use super::session::ConnectionSession;
use crate::error::{LedError, Result};

/// Pending frames per session.
const SEND_QUEUE: usize = 32;

/// Transport timing.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Minimum gap between two successful writes.
    pub min_spacing: Duration,
    /// Wait after a successful write before the next frame.
    pub settle: Duration,
    /// Bound on one write.
    pub write_timeout: Duration,
    /// Write attempts per frame.
    pub max_retries: u32,
    /// Backoff after attempt `n` is `n * backoff_step`.
    pub backoff_step: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            min_spacing: Duration::from_millis(timing::MIN_SPACING_MS),
            settle: Duration::from_millis(timing::SETTLE_MS),
            write_timeout: Duration::from_millis(timing::WRITE_TIMEOUT_MS),
            max_retries: timing::MAX_RETRIES,
            backoff_step: Duration::from_millis(timing::BACKOFF_STEP_MS),
        }
    }
}

/// Frame waiting in the send queue.
struct SendRequest {
    frame: Frame,
    max_retries: u32,
    reply: oneshot::Sender<Result<()>>,
}

/// Handle for queueing frames to a session.
#[derive(Clone)]
pub struct CommandTransport {
    request_tx: mpsc::Sender<SendRequest>,
    max_retries: u32,
}

impl CommandTransport {
    /// Start the delivery worker for `session`.
    ///
    /// The worker stops once every handle is dropped.
    pub fn spawn(session: Arc<ConnectionSession>, config: TransportConfig) -> Self {
        let (request_tx, request_rx) = mpsc::channel(SEND_QUEUE);
        let max_retries = config.max_retries;
        let worker = TransportWorker { session, config };
        tokio::spawn(worker.run(request_rx));

        Self {
            request_tx,
            max_retries,
        }
    }

    /// Send a frame with the default retry budget.
    ///
    /// Returns `false` on any failure; the reason is logged.
    pub async fn send(&self, frame: Frame) -> bool {
        self.send_with_retries(frame, self.max_retries).await
    }

    /// Send a frame with the default retry budget and report why it failed.
    pub async fn try_send(&self, frame: Frame) -> Result<()> {
        self.deliver(frame, self.max_retries).await
    }

    pub async fn send_with_retries(&self, frame: Frame, max_retries: u32) -> bool {
        self.deliver(frame, max_retries).await.is_ok()
    }

    /// Send a frame and report why it failed.
    ///
    /// Errors are `NotConnected` or `RetriesExhausted`.
    pub async fn deliver(&self, frame: Frame, max_retries: u32) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.request_tx
            .send(SendRequest {
                frame,
                max_retries,
                reply,
            })
            .await
            .map_err(|_| LedError::NotConnected)?;

        reply_rx.await.map_err(|_| LedError::NotConnected)?
    }
}

struct TransportWorker {
    session: Arc<ConnectionSession>,
    config: TransportConfig,
}

impl TransportWorker {
    async fn run(self, mut request_rx: mpsc::Receiver<SendRequest>) {
        while let Some(request) = request_rx.recv().await {
            let result = self.deliver(&request.frame, request.max_retries).await;
            let _ = request.reply.send(result);
        }
        debug!("Command transport stopped");
    }

    async fn deliver(&self, frame: &Frame, max_retries: u32) -> Result<()> {
        if !self.session.is_connected() {
            debug!("Dropping frame {}: not connected", frame);
            return Err(LedError::NotConnected);
        }

        let attempts = max_retries.max(1);
        let mut last_error = LedError::NotConnected;

        for attempt in 1..=attempts {
            self.wait_for_spacing().await;

            match self.write_once(frame).await {
                Ok(()) => {
                    self.session.mark_command_sent(Instant::now());
                    debug!("Sent frame {} (attempt {})", frame, attempt);
                    sleep(self.config.settle).await;
                    return Ok(());
                }
                Err(LedError::NotConnected) => {
                    debug!("Dropping frame {}: session closed", frame);
                    return Err(LedError::NotConnected);
                }
                Err(e) if e.is_retryable() => {
                    warn!("Write attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = e;
                }
                Err(e) => {
                    error!("Giving up on frame {} after attempt {}: {}", frame, attempt, e);
                    return Err(LedError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
            }

            if attempt < attempts {
                sleep(self.config.backoff_step * attempt).await;
            }
        }

        error!("Giving up on frame {} after {} attempts", frame, attempts);
        Err(LedError::RetriesExhausted {
            attempts,
            last: Box::new(last_error),
        })
    }

    /// Hold the frame until the minimum spacing since the last write passed.
    async fn wait_for_spacing(&self) {
        if let Some(last) = self.session.last_command_at() {
            let elapsed = last.elapsed();
            if elapsed < self.config.min_spacing {
                sleep(self.config.min_spacing - elapsed).await;
            }
        }
    }

    async fn write_once(&self, frame: &Frame) -> Result<()> {
        let link = match self.session.link() {
            Some(link) if link.is_open() => link,
            _ => {
                warn!("Link not open, recovering before write");
                self.session.recover().await?;
                self.session.link().ok_or(LedError::NotConnected)?
            }
        };

        match timeout(self.config.write_timeout, link.write(frame.as_bytes())).await {
            Ok(result) => result,
            Err(_) => Err(LedError::Timeout(self.config.write_timeout)),
        }
    }
}
