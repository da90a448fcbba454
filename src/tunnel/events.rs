//! Tunnel Event System
//!
//! Lifecycle notifications for observers of the tunnel manager. Tunnels never
//! hold a reference to the manager; they report through the emitter the
//! manager hands them.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Capacity of the event channel; slow subscribers see `Lagged`
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Tunnel event types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TunnelEvent {
    /// Connect sequence started
    Starting { identifier: String },
    /// Listener bound, accepting connections
    Running {
        identifier: String,
        local_addr: String,
    },
    /// Fully drained and stopped
    Stopped { identifier: String },
    /// Start failed; the tunnel is back to stopped
    StartFailed { identifier: String, error: String },
    /// Liveness probe failed and the tunnel is being stopped
    KeepaliveLost { identifier: String, error: String },
    /// A replacement relay session was swapped in
    Reconnected { identifier: String, attempt: u32 },
}

impl TunnelEvent {
    pub fn identifier(&self) -> &str {
        match self {
            Self::Starting { identifier }
            | Self::Running { identifier, .. }
            | Self::Stopped { identifier }
            | Self::StartFailed { identifier, .. }
            | Self::KeepaliveLost { identifier, .. }
            | Self::Reconnected { identifier, .. } => identifier,
        }
    }
}

/// Event emitter handed to every tunnel.
///
/// Sending never blocks and never fails the caller; events are dropped when
/// nobody is subscribed.
#[derive(Clone)]
pub struct TunnelEventEmitter {
    tx: broadcast::Sender<TunnelEvent>,
}

impl TunnelEventEmitter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: TunnelEvent) {
        if let Err(e) = self.tx.send(event) {
            trace!("No subscriber for tunnel event: {:?}", e.0);
        }
    }
}

impl Default for TunnelEventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TunnelEventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelEventEmitter")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers() {
        let emitter = TunnelEventEmitter::new();
        // Should not panic
        emitter.emit(TunnelEvent::Stopped {
            identifier: "db".into(),
        });
        let mut rx = emitter.subscribe();
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let emitter = TunnelEventEmitter::new();
        let mut rx = emitter.subscribe();
        emitter.emit(TunnelEvent::Starting {
            identifier: "db".into(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.identifier(), "db");
    }

    #[test]
    fn test_event_serialization() {
        let event = TunnelEvent::KeepaliveLost {
            identifier: "db".into(),
            error: "Disconnected".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"keepaliveLost\""));
        assert!(json.contains("db"));
    }
}
