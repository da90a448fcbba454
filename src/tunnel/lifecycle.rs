//! Tunnel state machine
//!
//! A `Tunnel` owns one relay session, one listener and the forwarding units
//! of its current run. `start` and `stop` are serialized by the tunnel's own
//! async lock; the status is published through an atomic so readers never
//! wait behind a slow connect.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::error::TunnelError;
use super::events::{TunnelEvent, TunnelEventEmitter};
use super::session::{connect_with_retry, KeepaliveMonitor};
use super::state::TunnelStatus;
use crate::config::{TunnelConfig, TunnelSettings};
use crate::forwarding::{
    bind_listener, run_accept_loop, ForwardContext, ForwardStats, ForwardStatsSnapshot, SessionSlot,
};
use crate::ssh::RelayConnector;

/// Snapshot of a tunnel for presentation
#[derive(Debug, Clone, Serialize)]
pub struct TunnelInfo {
    pub identifier: String,
    pub status: TunnelStatus,
    /// Configured local address
    pub local_addr: String,
    /// Address the listener actually bound, while running
    pub bound_addr: Option<SocketAddr>,
    pub server_addr: String,
    pub remote_addr: String,
    pub started_at: Option<DateTime<Utc>>,
    pub stats: ForwardStatsSnapshot,
    pub last_error: Option<String>,
}

/// Published facts about the current run, readable without the run lock
#[derive(Debug, Clone, Copy)]
struct RunInfo {
    started_at: DateTime<Utc>,
    bound_addr: SocketAddr,
}

/// Resources of one `Running` period
struct ActiveRun {
    generation: u64,
    session: SessionSlot,
    cancel: CancellationToken,
    tracker: TaskTracker,
    accept_task: JoinHandle<()>,
    monitor_task: JoinHandle<()>,
}

pub struct Tunnel {
    identifier: String,
    config: Arc<TunnelConfig>,
    settings: TunnelSettings,
    connector: Arc<dyn RelayConnector>,
    events: TunnelEventEmitter,
    status: AtomicU8,
    /// Set once the registry has swapped this tunnel out
    retired: AtomicBool,
    generation: AtomicU64,
    stats: Arc<ForwardStats>,
    last_error: Arc<RwLock<Option<String>>>,
    run_info: RwLock<Option<RunInfo>>,
    run: Mutex<Option<ActiveRun>>,
}

impl Tunnel {
    pub fn new(
        identifier: impl Into<String>,
        config: TunnelConfig,
        settings: TunnelSettings,
        connector: Arc<dyn RelayConnector>,
        events: TunnelEventEmitter,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            config: Arc::new(config),
            settings,
            connector,
            events,
            status: AtomicU8::new(TunnelStatus::Stopped as u8),
            retired: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            stats: Arc::new(ForwardStats::default()),
            last_error: Arc::new(RwLock::new(None)),
            run_info: RwLock::new(None),
            run: Mutex::new(None),
        }
    }

    /// A fresh `Stopped` tunnel with the same configuration.
    ///
    /// Counters and the last error carry over so observers keep their history.
    pub(crate) fn successor(&self) -> Self {
        Self {
            identifier: self.identifier.clone(),
            config: self.config.clone(),
            settings: self.settings.clone(),
            connector: self.connector.clone(),
            events: self.events.clone(),
            status: AtomicU8::new(TunnelStatus::Stopped as u8),
            retired: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            stats: self.stats.clone(),
            last_error: self.last_error.clone(),
            run_info: RwLock::new(None),
            run: Mutex::new(None),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn status(&self) -> TunnelStatus {
        TunnelStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: TunnelStatus) {
        debug!("[{}] Status -> {}", self.identifier, status);
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn info(&self) -> TunnelInfo {
        let run_info = *self.run_info.read();
        TunnelInfo {
            identifier: self.identifier.clone(),
            status: self.status(),
            local_addr: self.config.local_addr.clone(),
            bound_addr: run_info.map(|r| r.bound_addr),
            server_addr: self.config.server_addr.clone(),
            remote_addr: self.config.remote_addr.clone(),
            started_at: run_info.map(|r| r.started_at),
            stats: self.stats.snapshot(),
            last_error: self.last_error.read().clone(),
        }
    }

    /// Bring the tunnel up: relay session, then listener, then the accept
    /// loop and keepalive monitor.
    ///
    /// Fails with `AlreadyActive` unless the tunnel is `Stopped`.
    pub async fn start(self: &Arc<Self>) -> Result<(), TunnelError> {
        if self.status().is_active() {
            return Err(TunnelError::AlreadyActive(self.identifier.clone()));
        }

        let mut run = self.run.lock().await;
        if self.retired.load(Ordering::Acquire) {
            return Err(TunnelError::NotFound(self.identifier.clone()));
        }
        if self.status().is_active() || run.is_some() {
            return Err(TunnelError::AlreadyActive(self.identifier.clone()));
        }

        self.set_status(TunnelStatus::Starting);
        self.events.emit(TunnelEvent::Starting {
            identifier: self.identifier.clone(),
        });
        info!(
            "[{}] Starting tunnel {} -> {} via {}",
            self.identifier, self.config.local_addr, self.config.remote_addr, self.config.server_addr
        );

        let session = match connect_with_retry(
            self.connector.as_ref(),
            &self.identifier,
            &self.config,
            &self.settings,
            &CancellationToken::new(),
        )
        .await
        {
            Ok(session) => session,
            Err(e) => return Err(self.fail_start(e)),
        };

        let listener = match bind_listener(&self.config.local_addr).await {
            Ok(listener) => listener,
            Err(reason) => {
                session.close().await;
                return Err(self.fail_start(TunnelError::ListenFailed {
                    identifier: self.identifier.clone(),
                    local_addr: self.config.local_addr.clone(),
                    reason,
                }));
            }
        };

        let bound_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                drop(listener);
                session.close().await;
                return Err(self.fail_start(TunnelError::ListenFailed {
                    identifier: self.identifier.clone(),
                    local_addr: self.config.local_addr.clone(),
                    reason: format!("Failed to get bound address: {}", e),
                }));
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let slot: SessionSlot = Arc::new(RwLock::new(session));

        let ctx = ForwardContext {
            tunnel_id: Arc::from(self.identifier.as_str()),
            remote_addr: Arc::from(self.config.remote_addr.as_str()),
            session: slot.clone(),
            stats: self.stats.clone(),
            buffer_size: self.settings.buffer_size,
            idle_timeout: self.settings.idle_timeout(),
        };
        let limit = Arc::new(Semaphore::new(self.settings.connection_limit()));
        let accept_task = tokio::spawn(run_accept_loop(
            listener,
            ctx,
            limit,
            tracker.clone(),
            cancel.clone(),
        ));

        let monitor = KeepaliveMonitor {
            identifier: self.identifier.clone(),
            config: self.config.clone(),
            settings: self.settings.clone(),
            connector: self.connector.clone(),
            session: slot.clone(),
            events: self.events.clone(),
            cancel: cancel.clone(),
        };
        let weak = Arc::downgrade(self);
        let monitor_task = tokio::spawn(async move {
            if let Some(reason) = monitor.run().await {
                if let Some(tunnel) = weak.upgrade() {
                    tunnel.keepalive_lost(generation, reason);
                }
            }
        });

        *self.last_error.write() = None;
        *self.run_info.write() = Some(RunInfo {
            started_at: Utc::now(),
            bound_addr,
        });
        *run = Some(ActiveRun {
            generation,
            session: slot,
            cancel,
            tracker,
            accept_task,
            monitor_task,
        });
        self.set_status(TunnelStatus::Running);

        info!(
            "[{}] Tunnel running on {} -> {}",
            self.identifier, bound_addr, self.config.remote_addr
        );
        self.events.emit(TunnelEvent::Running {
            identifier: self.identifier.clone(),
            local_addr: bound_addr.to_string(),
        });
        Ok(())
    }

    /// Roll a failed start back to `Stopped`
    fn fail_start(&self, err: TunnelError) -> TunnelError {
        error!("[{}] Start failed: {}", self.identifier, err);
        *self.last_error.write() = Some(err.to_string());
        self.set_status(TunnelStatus::Stopped);
        self.events.emit(TunnelEvent::StartFailed {
            identifier: self.identifier.clone(),
            error: err.to_string(),
        });
        err
    }

    /// Drain and stop the tunnel. No-op unless `Running`.
    ///
    /// Returns once the listener is closed, the session is closed and every
    /// forwarding unit has finished.
    pub async fn stop(&self) {
        self.stop_run(None).await;
    }

    async fn stop_run(&self, only_generation: Option<u64>) {
        if self.status() != TunnelStatus::Running {
            return;
        }

        let mut guard = self.run.lock().await;
        if self.status() != TunnelStatus::Running {
            return;
        }
        if let Some(expected) = only_generation {
            if guard.as_ref().map(|r| r.generation) != Some(expected) {
                return;
            }
        }
        let Some(run) = guard.take() else {
            return;
        };

        self.set_status(TunnelStatus::Stopping);
        info!(
            "[{}] Stopping tunnel ({} active connection(s))",
            self.identifier,
            self.stats.active_connections()
        );

        run.cancel.cancel();
        if let Err(e) = run.accept_task.await {
            warn!("[{}] Accept loop ended abnormally: {}", self.identifier, e);
        }
        if let Err(e) = run.monitor_task.await {
            warn!("[{}] Keepalive monitor ended abnormally: {}", self.identifier, e);
        }

        let session = run.session.read().clone();
        session.close().await;

        run.tracker.close();
        run.tracker.wait().await;

        *self.run_info.write() = None;
        self.set_status(TunnelStatus::Stopped);
        drop(guard);

        info!("[{}] Tunnel stopped", self.identifier);
        self.events.emit(TunnelEvent::Stopped {
            identifier: self.identifier.clone(),
        });
    }

    /// Called from the keepalive monitor once the session is gone for good
    fn keepalive_lost(self: Arc<Self>, generation: u64, reason: String) {
        let err = TunnelError::KeepaliveLost {
            identifier: self.identifier.clone(),
            reason: reason.clone(),
        };
        error!("[{}] {}", self.identifier, err);
        *self.last_error.write() = Some(err.to_string());
        self.events.emit(TunnelEvent::KeepaliveLost {
            identifier: self.identifier.clone(),
            error: reason,
        });

        // stop() awaits the monitor task, so it must run elsewhere
        tokio::spawn(async move {
            self.stop_run(Some(generation)).await;
        });
    }

    /// Mark this tunnel as replaced so it can never start again.
    ///
    /// Only succeeds when the tunnel is `Stopped` and no start or stop is in
    /// progress.
    pub(crate) fn try_retire(&self) -> bool {
        let Ok(run) = self.run.try_lock() else {
            return false;
        };
        if run.is_some() || self.status().is_active() {
            return false;
        }
        self.retired.store(true, Ordering::Release);
        true
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        // Dropped while running: the accept loop and monitor must not outlive us
        if let Some(run) = self.run.get_mut().take() {
            run.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("identifier", &self.identifier)
            .field("status", &self.status())
            .field("config", &self.config)
            .finish()
    }
}
