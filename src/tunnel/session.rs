//! Relay session management
//!
//! Connect with retry, and the keepalive monitor that watches a running
//! tunnel's session and reconnects or gives up according to
//! `KeepalivePolicy`.

use std::sync::Arc;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::TunnelError;
use super::events::{TunnelEvent, TunnelEventEmitter};
use crate::config::{KeepalivePolicy, TunnelConfig, TunnelSettings};
use crate::forwarding::SessionSlot;
use crate::ssh::{RelayConnector, RelaySession};

/// Dial the relay, retrying up to `settings.connect_attempts` times with
/// `settings.retry_delay` between attempts.
///
/// Gives up early if `cancel` fires.
pub(crate) async fn connect_with_retry(
    connector: &dyn RelayConnector,
    identifier: &str,
    config: &TunnelConfig,
    settings: &TunnelSettings,
    cancel: &CancellationToken,
) -> Result<Arc<dyn RelaySession>, TunnelError> {
    let max_attempts = settings.connect_attempts.max(1);
    let mut attempts = 0;
    let mut last_error = String::from("cancelled");

    while attempts < max_attempts {
        if attempts > 0 {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(settings.retry_delay()) => {}
            }
        }
        attempts += 1;

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = connector.connect(identifier, config, settings.handshake_timeout()) => result,
        };

        match result {
            Ok(session) => {
                info!(
                    "[{}] SSH session established (attempt {}/{})",
                    identifier, attempts, max_attempts
                );
                return Ok(session);
            }
            Err(e) => {
                warn!(
                    "[{}] SSH connect attempt {}/{} failed: {}",
                    identifier, attempts, max_attempts, e
                );
                last_error = e.to_string();
            }
        }
    }

    Err(TunnelError::SshConnectFailed {
        identifier: identifier.to_string(),
        attempts,
        reason: last_error,
    })
}

/// Why a reconnect sequence ended
enum ReconnectOutcome {
    Swapped,
    Cancelled,
    Exhausted(String),
}

/// Watches the session of one tunnel run
pub(crate) struct KeepaliveMonitor {
    pub identifier: String,
    pub config: Arc<TunnelConfig>,
    pub settings: TunnelSettings,
    pub connector: Arc<dyn RelayConnector>,
    pub session: SessionSlot,
    pub events: TunnelEventEmitter,
    pub cancel: CancellationToken,
}

impl KeepaliveMonitor {
    /// Probe until the run is cancelled or the session is lost for good.
    ///
    /// Returns `None` when cancelled and the failure reason otherwise; the
    /// caller is responsible for stopping the tunnel.
    pub(crate) async fn run(self) -> Option<String> {
        let period = self.settings.keepalive_interval();
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(
            "[{}] Keepalive monitor started (interval={}ms, policy={:?})",
            self.identifier,
            period.as_millis(),
            self.settings.keepalive_policy
        );

        loop {
            let session = self.session.read().clone();
            let closed = session.closed();

            let probe = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return None,

                // Transport dropped underneath us, no need to wait for the tick
                _ = closed.cancelled() => Err(crate::ssh::SshError::Disconnected),

                _ = interval.tick() => tokio::select! {
                    _ = self.cancel.cancelled() => return None,
                    result = session.keepalive() => result,
                },
            };

            let failure = match probe {
                Ok(()) => {
                    debug!("[{}] Keepalive OK", self.identifier);
                    continue;
                }
                Err(e) => e.to_string(),
            };

            warn!("[{}] Keepalive failed: {}", self.identifier, failure);

            let max_cycles = match self.settings.keepalive_policy {
                KeepalivePolicy::StopOnFailure => return Some(failure),
                KeepalivePolicy::Reconnect { max_attempts } => max_attempts,
            };

            match self.reconnect(&session, max_cycles).await {
                ReconnectOutcome::Swapped => {
                    interval.reset();
                }
                ReconnectOutcome::Cancelled => return None,
                ReconnectOutcome::Exhausted(reason) => {
                    error!(
                        "[{}] Reconnect gave up after {} cycle(s): {}",
                        self.identifier, max_cycles, reason
                    );
                    return Some(reason);
                }
            }
        }
    }

    /// Re-run the connect sequence and swap the new session in
    async fn reconnect(&self, lost: &Arc<dyn RelaySession>, max_cycles: u32) -> ReconnectOutcome {
        let mut last_error = String::from("reconnect disabled");

        for cycle in 1..=max_cycles {
            if cycle > 1 {
                tokio::select! {
                    _ = self.cancel.cancelled() => return ReconnectOutcome::Cancelled,
                    _ = tokio::time::sleep(self.settings.retry_delay()) => {}
                }
            }

            info!(
                "[{}] Reconnecting relay session (cycle {}/{})",
                self.identifier, cycle, max_cycles
            );

            match connect_with_retry(
                self.connector.as_ref(),
                &self.identifier,
                &self.config,
                &self.settings,
                &self.cancel,
            )
            .await
            {
                Ok(fresh) => {
                    if self.cancel.is_cancelled() {
                        fresh.close().await;
                        return ReconnectOutcome::Cancelled;
                    }
                    *self.session.write() = fresh;
                    lost.close().await;
                    info!("[{}] Relay session replaced", self.identifier);
                    self.events.emit(TunnelEvent::Reconnected {
                        identifier: self.identifier.clone(),
                        attempt: cycle,
                    });
                    return ReconnectOutcome::Swapped;
                }
                Err(_) if self.cancel.is_cancelled() => return ReconnectOutcome::Cancelled,
                Err(e) => last_error = e.to_string(),
            }
        }

        ReconnectOutcome::Exhausted(last_error)
    }
}
