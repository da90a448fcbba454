//! Tunnel error types

use thiserror::Error;

use crate::config::DefinitionError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
    #[error("Tunnel already exists: {0}")]
    AlreadyExists(String),

    #[error("Tunnel not found: {0}")]
    NotFound(String),

    #[error("Tunnel is already active: {0}")]
    AlreadyActive(String),

    #[error("SSH connection for {identifier} failed after {attempts} attempt(s): {reason}")]
    SshConnectFailed {
        identifier: String,
        attempts: u32,
        reason: String,
    },

    #[error("Listening on {local_addr} failed for {identifier}: {reason}")]
    ListenFailed {
        identifier: String,
        local_addr: String,
        reason: String,
    },

    /// Per-connection, logged by the accept loop
    #[error("Accept error: {0}")]
    AcceptError(String),

    /// Per-connection, logged by the forwarding unit
    #[error("Dial to {remote_addr} failed: {reason}")]
    DialError { remote_addr: String, reason: String },

    #[error("Keepalive lost for {identifier}: {reason}")]
    KeepaliveLost { identifier: String, reason: String },

    #[error("Tunnel task failed: {0}")]
    TaskFailed(String),

    #[error("Invalid tunnel definition {identifier}: {source}")]
    InvalidDefinition {
        identifier: String,
        #[source]
        source: DefinitionError,
    },
}

impl serde::Serialize for TunnelError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_as_message() {
        let err = TunnelError::SshConnectFailed {
            identifier: "db".into(),
            attempts: 3,
            reason: "Connection failed: refused".into(),
        };
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(
            json,
            "\"SSH connection for db failed after 3 attempt(s): Connection failed: refused\""
        );
    }
}
