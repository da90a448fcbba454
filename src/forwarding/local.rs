//! Local Port Forwarding
//!
//! Accepts connections on the tunnel's local address and relays each one to
//! the remote destination through the current relay session.
//! Example: 127.0.0.1:5432 -> bastion -> 10.0.0.5:5432

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::stats::ForwardStats;
use crate::ssh::RelaySession;
use crate::tunnel::TunnelError;

/// Pause after a failed accept before trying again
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// The relay session forwarding units dial through.
///
/// The keepalive monitor swaps a fresh session in after a reconnect; units
/// already running keep the session they dialed with.
pub type SessionSlot = Arc<RwLock<Arc<dyn RelaySession>>>;

/// Everything a forwarding unit needs, shared by the whole run
#[derive(Clone)]
pub struct ForwardContext {
    pub tunnel_id: Arc<str>,
    pub remote_addr: Arc<str>,
    pub session: SessionSlot,
    pub stats: Arc<ForwardStats>,
    pub buffer_size: usize,
    pub idle_timeout: Option<Duration>,
}

/// Bind the local listener, turning common failures into readable reasons
pub async fn bind_listener(local_addr: &str) -> Result<TcpListener, String> {
    TcpListener::bind(local_addr).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::AddrInUse => format!(
            "Port already in use: {}. Another application may be using this port.",
            local_addr
        ),
        std::io::ErrorKind::PermissionDenied => format!(
            "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
            local_addr
        ),
        std::io::ErrorKind::AddrNotAvailable => format!(
            "Address not available: {}. The specified address is not valid on this system.",
            local_addr
        ),
        _ => format!("Failed to bind to {}: {}", local_addr, e),
    })
}

/// Accept loop of one tunnel run.
///
/// Every accepted connection waits for a slot in `limit` before it is
/// forwarded. Units are spawned on `tracker` so the caller can wait for them
/// to drain. Returns once `cancel` fires; the listener is dropped on return.
pub async fn run_accept_loop(
    listener: TcpListener,
    ctx: ForwardContext,
    limit: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
) {
    loop {
        let (stream, peer_addr) = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            accept_result = listener.accept() => match accept_result {
                Ok(accepted) => accepted,
                Err(e) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    warn!("[{}] {}", ctx.tunnel_id, TunnelError::AcceptError(e.to_string()));
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => continue,
                    }
                }
            },
        };

        debug!("[{}] Accepted connection from {}", ctx.tunnel_id, peer_addr);

        // Backpressure: hold the accepted stream until a slot frees
        let permit = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("[{}] Dropping {} accepted during shutdown", ctx.tunnel_id, peer_addr);
                drop(stream);
                break;
            }

            permit = limit.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        ctx.stats.connection_opened();
        let unit_ctx = ctx.clone();
        tracker.spawn(async move {
            let _permit = permit;
            handle_forward_connection(unit_ctx, stream, peer_addr).await;
        });
    }

    drop(listener);
    info!("[{}] Accept loop exited", ctx.tunnel_id);
}

/// Forward a single accepted connection until both directions are done
async fn handle_forward_connection(ctx: ForwardContext, local_stream: TcpStream, peer_addr: SocketAddr) {
    // Disable Nagle's algorithm for low-latency forwarding
    if let Err(e) = local_stream.set_nodelay(true) {
        warn!("[{}] Failed to set TCP_NODELAY: {}", ctx.tunnel_id, e);
    }

    let session = ctx.session.read().clone();
    let closed = session.closed();

    let dial_result = tokio::select! {
        _ = closed.cancelled() => Err(crate::ssh::SshError::Disconnected),
        result = session.open_stream(&ctx.remote_addr, peer_addr) => result,
    };
    drop(session);

    let remote_stream = match dial_result {
        Ok(stream) => stream,
        Err(e) => {
            let err = TunnelError::DialError {
                remote_addr: ctx.remote_addr.to_string(),
                reason: e.to_string(),
            };
            warn!("[{}] {}", ctx.tunnel_id, err);
            ctx.stats.dial_failed();
            return;
        }
    };

    let (local_read, local_write) = local_stream.into_split();
    let (remote_read, remote_write) = tokio::io::split(remote_stream);

    let (sent, received) = tokio::join!(
        copy_half(local_read, remote_write, &ctx, &closed, Direction::LocalToRemote),
        copy_half(remote_read, local_write, &ctx, &closed, Direction::RemoteToLocal),
    );

    ctx.stats.connection_completed();
    debug!(
        "[{}] Forward connection from {} closed ({} bytes sent, {} bytes received)",
        ctx.tunnel_id, peer_addr, sent, received
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    LocalToRemote,
    RemoteToLocal,
}

/// Copy one direction until EOF, an I/O error, the idle timeout or the
/// session closing. Shuts down the writer on a clean finish.
async fn copy_half<R, W>(
    mut reader: R,
    mut writer: W,
    ctx: &ForwardContext,
    closed: &CancellationToken,
    direction: Direction,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; ctx.buffer_size.max(1)];
    let mut total = 0u64;

    loop {
        let read = async {
            match ctx.idle_timeout {
                Some(idle) => match tokio::time::timeout(idle, reader.read(&mut buf)).await {
                    Ok(result) => result,
                    Err(_) => Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("idle for {}s", idle.as_secs()),
                    )),
                },
                None => reader.read(&mut buf).await,
            }
        };

        let n = tokio::select! {
            _ = closed.cancelled() => return total,
            result = read => match result {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("[{}] {:?} read ended: {}", ctx.tunnel_id, direction, e);
                    break;
                }
            },
        };

        let write_result = tokio::select! {
            _ = closed.cancelled() => return total,
            result = writer.write_all(&buf[..n]) => result,
        };
        if let Err(e) = write_result {
            debug!("[{}] {:?} write failed: {}", ctx.tunnel_id, direction, e);
            break;
        }

        total += n as u64;
        match direction {
            Direction::LocalToRemote => ctx.stats.add_sent(n as u64),
            Direction::RemoteToLocal => ctx.stats.add_received(n as u64),
        }
    }

    // Propagate EOF to the peer
    tokio::select! {
        _ = closed.cancelled() => {}
        _ = writer.shutdown() => {}
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::io::duplex;

    use crate::ssh::{RelayStream, SshError};

    struct NoRelay {
        closed: CancellationToken,
    }

    #[async_trait]
    impl RelaySession for NoRelay {
        async fn open_stream(&self, remote_addr: &str, _: SocketAddr) -> Result<RelayStream, SshError> {
            Err(SshError::ChannelError(format!("refused {}", remote_addr)))
        }

        async fn keepalive(&self) -> Result<(), SshError> {
            Ok(())
        }

        async fn close(&self) {
            self.closed.cancel();
        }

        fn closed(&self) -> CancellationToken {
            self.closed.clone()
        }
    }

    fn context(closed: CancellationToken, idle_timeout: Option<Duration>) -> ForwardContext {
        let session: Arc<dyn RelaySession> = Arc::new(NoRelay { closed });
        ForwardContext {
            tunnel_id: Arc::from("test"),
            remote_addr: Arc::from("10.0.0.5:5432"),
            session: Arc::new(RwLock::new(session)),
            stats: Arc::new(ForwardStats::default()),
            buffer_size: 4,
            idle_timeout,
        }
    }

    #[tokio::test]
    async fn test_copy_half_counts_and_shuts_down_writer() {
        let closed = CancellationToken::new();
        let ctx = context(closed.clone(), None);

        let (mut client, reader) = duplex(64);
        let (writer, mut sink) = duplex(64);

        client.write_all(b"hello world").await.unwrap();
        drop(client);

        let copied = copy_half(reader, writer, &ctx, &closed, Direction::LocalToRemote).await;
        assert_eq!(copied, 11);
        assert_eq!(ctx.stats.snapshot().bytes_sent, 11);

        let mut out = Vec::new();
        sink.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn test_copy_half_unwinds_when_session_closes() {
        let closed = CancellationToken::new();
        let ctx = context(closed.clone(), None);

        let (_client, reader) = duplex(64);
        let (writer, _sink) = duplex(64);

        let copy = tokio::spawn({
            let ctx = ctx.clone();
            let closed = closed.clone();
            async move { copy_half(reader, writer, &ctx, &closed, Direction::RemoteToLocal).await }
        });

        closed.cancel();
        let copied = tokio::time::timeout(Duration::from_secs(5), copy)
            .await
            .expect("copy should unwind")
            .unwrap();
        assert_eq!(copied, 0);
    }

    #[tokio::test]
    async fn test_copy_half_idle_timeout() {
        let closed = CancellationToken::new();
        let ctx = context(closed.clone(), Some(Duration::from_millis(50)));

        let (_client, reader) = duplex(64);
        let (writer, _sink) = duplex(64);

        let copied = tokio::time::timeout(
            Duration::from_secs(5),
            copy_half(reader, writer, &ctx, &closed, Direction::LocalToRemote),
        )
        .await
        .expect("idle timeout should end the copy");
        assert_eq!(copied, 0);
    }

    #[tokio::test]
    async fn test_dial_failure_closes_local_connection() {
        let closed = CancellationToken::new();
        let ctx = context(closed, None);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (server_side, peer) = listener.accept().await.unwrap();

        ctx.stats.connection_opened();
        handle_forward_connection(ctx.clone(), server_side, peer).await;

        let mut buf = [0u8; 8];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);

        let snapshot = ctx.stats.snapshot();
        assert_eq!(snapshot.failed_dials, 1);
        assert_eq!(snapshot.active_connections, 0);
    }

    #[tokio::test]
    async fn test_bind_listener_reports_addr_in_use() {
        let first = bind_listener("127.0.0.1:0").await.unwrap();
        let addr = first.local_addr().unwrap().to_string();
        let err = bind_listener(&addr).await.unwrap_err();
        assert!(err.contains("already in use"), "{}", err);
    }
}
