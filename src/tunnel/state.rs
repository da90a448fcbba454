//! Tunnel lifecycle states

use serde::{Deserialize, Serialize};

/// Lifecycle state of a tunnel.
///
/// `Stopped -> Starting -> Running -> Stopping -> Stopped`; a failed start
/// goes straight back from `Starting` to `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum TunnelStatus {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl TunnelStatus {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }

    /// True while the tunnel holds a session or a listener
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Stopped)
    }
}

impl std::fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u8_round_trip() {
        for status in [
            TunnelStatus::Stopped,
            TunnelStatus::Starting,
            TunnelStatus::Running,
            TunnelStatus::Stopping,
        ] {
            assert_eq!(TunnelStatus::from_u8(status as u8), status);
        }
        assert_eq!(TunnelStatus::from_u8(42), TunnelStatus::Stopped);
    }

    #[test]
    fn test_is_active() {
        assert!(!TunnelStatus::Stopped.is_active());
        assert!(TunnelStatus::Starting.is_active());
        assert!(TunnelStatus::Running.is_active());
        assert!(TunnelStatus::Stopping.is_active());
    }

    #[test]
    fn test_serialization() {
        assert_eq!(
            serde_json::to_string(&TunnelStatus::Running).unwrap(),
            "\"running\""
        );
        assert_eq!(TunnelStatus::Stopping.to_string(), "stopping");
    }
}
