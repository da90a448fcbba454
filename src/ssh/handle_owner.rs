//! Handle Owner Task
//!
//! This module implements the "single owner" pattern for SSH Handle.
//!
//! # Architecture
//!
//! Only one task owns the `Handle<ClientHandler>`. Forwarding units and the
//! keepalive monitor talk to it through a cloneable `HandleController` that
//! sends commands over an mpsc channel, so the handle is never shared behind
//! a lock held across `.await`.
//!
//! # Usage
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, "db".into());
//!
//! // Open a direct-tcpip channel to the remote destination
//! let channel = controller.open_direct_tcpip("10.0.0.5", 5432, "127.0.0.1", 0).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// How long a keepalive request may stay unanswered
const KEEPALIVE_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a caller waits for the owner task to answer a ping
const PING_REPLY_DEADLINE: Duration = Duration::from_secs(15);

/// Outcome of a keepalive probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    /// Connection is alive
    Ok,
    /// No answer in time
    Timeout,
    /// Transport is gone
    IoError,
}

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a direct-tcpip channel to the remote destination
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Send a keepalive request
    Ping {
        reply_tx: oneshot::Sender<PingResult>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task.
///
/// Cloning only copies the sender; every clone has full control over the
/// session, including disconnecting it.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    /// Subscribe to SSH disconnect notifications.
    ///
    /// The receiver yields once the owner task has torn the session down.
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    /// Open a direct-tcpip channel
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Disconnect the SSH connection
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Ping the connection (for keepalive check)
    pub async fn ping(&self) -> PingResult {
        self.ping_within(PING_REPLY_DEADLINE).await
    }

    async fn ping_within(&self, deadline: Duration) -> PingResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        let exchange = async {
            if self.cmd_tx.send(HandleCommand::Ping { reply_tx }).await.is_err() {
                return PingResult::IoError;
            }
            reply_rx.await.unwrap_or(PingResult::IoError)
        };
        // A full command queue or a stalled owner counts as unanswered
        tokio::time::timeout(deadline, exchange)
            .await
            .unwrap_or(PingResult::Timeout)
    }
}

/// Spawn the Handle Owner Task.
///
/// Consumes the Handle and returns a controller for sending commands.
/// `tunnel_id` is only used for logging.
pub fn spawn_handle_owner_task(handle: Handle<ClientHandler>, tunnel_id: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let disconnect_tx_clone = disconnect_tx.clone();

    tokio::spawn(async move {
        let handle = Arc::new(handle);

        debug!("[{}] Handle owner task started", tunnel_id);

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                HandleCommand::ChannelOpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                } => {
                    // Opens run on their own task so a slow remote dial does
                    // not hold up pings or other opens
                    let handle = handle.clone();
                    let tunnel_id = tunnel_id.clone();
                    tokio::spawn(async move {
                        let result = handle
                            .channel_open_direct_tcpip(host, port, originator_host, originator_port)
                            .await;
                        if reply_tx.send(result).is_err() {
                            // Channel is dropped here, the server closes it
                            warn!("[{}] Caller dropped before receiving direct_tcpip result", tunnel_id);
                        }
                    });
                }

                HandleCommand::Ping { reply_tx } => {
                    // keepalive@openssh.com global request with want_reply=true
                    let result = match tokio::time::timeout(
                        KEEPALIVE_REPLY_TIMEOUT,
                        handle.send_keepalive(true),
                    )
                    .await
                    {
                        Ok(Ok(())) => PingResult::Ok,
                        Ok(Err(e)) => {
                            warn!("[{}] Keepalive SSH error: {}", tunnel_id, e);
                            PingResult::IoError
                        }
                        Err(_) => {
                            warn!(
                                "[{}] Keepalive timeout ({}s)",
                                tunnel_id,
                                KEEPALIVE_REPLY_TIMEOUT.as_secs()
                            );
                            PingResult::Timeout
                        }
                    };
                    let _ = reply_tx.send(result);
                }

                HandleCommand::Disconnect => {
                    debug!("[{}] Disconnect requested", tunnel_id);
                    break;
                }
            }
        }

        // Subscribers learn about the teardown first, then queued callers
        let _ = disconnect_tx_clone.send(());
        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Tunnel closed", "en")
            .await;
        info!("[{}] SSH session closed", tunnel_id);
    });

    HandleController {
        cmd_tx,
        disconnect_tx,
    }
}

/// Drain all pending commands, returning Disconnected error to each
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(PingResult::IoError);
            }
            HandleCommand::Disconnect => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drain_replies_disconnected() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(4);
        let (ping_tx, ping_rx) = oneshot::channel();
        let (open_tx, open_rx) = oneshot::channel();

        cmd_tx
            .send(HandleCommand::Ping { reply_tx: ping_tx })
            .await
            .unwrap();
        cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: "localhost".into(),
                port: 80,
                originator_host: "127.0.0.1".into(),
                originator_port: 0,
                reply_tx: open_tx,
            })
            .await
            .unwrap();
        cmd_tx.send(HandleCommand::Disconnect).await.unwrap();

        drain_pending_commands(&mut cmd_rx);

        assert_eq!(ping_rx.await.unwrap(), PingResult::IoError);
        assert!(matches!(open_rx.await.unwrap(), Err(russh::Error::Disconnect)));
        assert!(cmd_tx.is_closed());
    }

    #[tokio::test]
    async fn test_controller_without_owner_reports_disconnected() {
        let (cmd_tx, cmd_rx) = mpsc::channel::<HandleCommand>(1);
        let (disconnect_tx, _) = broadcast::channel(1);
        let controller = HandleController {
            cmd_tx,
            disconnect_tx,
        };
        drop(cmd_rx);

        assert_eq!(controller.ping().await, PingResult::IoError);
        assert!(matches!(
            controller.open_direct_tcpip("localhost", 80, "127.0.0.1", 0).await,
            Err(SshError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_ping_times_out_when_owner_is_busy() {
        // Owner alive but never answering, as when it is stuck on a command
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(1);
        let (disconnect_tx, _) = broadcast::channel(1);
        let controller = HandleController {
            cmd_tx,
            disconnect_tx,
        };
        let stalled = tokio::spawn(async move {
            let held = cmd_rx.recv().await;
            std::future::pending::<()>().await;
            drop(held);
        });

        let started = std::time::Instant::now();
        assert_eq!(
            controller.ping_within(Duration::from_millis(50)).await,
            PingResult::Timeout
        );
        assert!(started.elapsed() < Duration::from_secs(5));

        // Queue full: the next ping cannot even be sent in time
        let (reply_tx, _reply_rx) = oneshot::channel();
        controller
            .cmd_tx
            .send(HandleCommand::Ping { reply_tx })
            .await
            .unwrap();
        assert_eq!(
            controller.ping_within(Duration::from_millis(50)).await,
            PingResult::Timeout
        );

        stalled.abort();
    }
}
