use crate::types::PeerId;

/// Errors surfaced by the rendezvous overlay.
///
/// Lease rejection and capacity exhaustion are normal protocol outcomes
/// and only appear here when a caller explicitly waits on a lease.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RdvError {
    #[error("transport error to {peer}: {reason}")]
    Transport { peer: PeerId, reason: String },

    #[error("no route: not connected to any rendezvous")]
    NoRoute,

    #[error("no walk forwarder available")]
    NoForwarder,

    #[error("walk forwarder failed: {0}")]
    Forwarder(String),

    #[error("not connected to {peer}")]
    NotConnected { peer: PeerId },

    #[error("only an edge peer can lease from a rendezvous")]
    NotEdge,

    #[error("lease denied by {peer}")]
    LeaseDenied { peer: PeerId },

    #[error("timed out waiting for lease from {peer}")]
    Timeout { peer: PeerId },

    #[error("malformed message: {reason}")]
    MalformedMessage { reason: String },

    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("overlay service is shut down")]
    Shutdown,
}

impl From<rmp_serde::encode::Error> for RdvError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        RdvError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for RdvError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        RdvError::Deserialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_transport() {
        let peer = PeerId::from_bytes([0; 32]);
        let err = RdvError::Transport {
            peer,
            reason: "connection refused".into(),
        };
        assert!(err.to_string().ends_with(": connection refused"));
    }

    #[test]
    fn test_display_no_forwarder() {
        assert_eq!(
            RdvError::NoForwarder.to_string(),
            "no walk forwarder available"
        );
    }

    #[test]
    fn test_display_malformed() {
        let err = RdvError::MalformedMessage {
            reason: "missing lease".into(),
        };
        assert_eq!(err.to_string(), "malformed message: missing lease");
    }

    #[test]
    fn test_decode_error_maps_to_deserialization() {
        let err: RdvError = rmp_serde::from_slice::<u32>(&[0xc1])
            .expect_err("0xc1 is never valid msgpack")
            .into();
        assert!(matches!(err, RdvError::Deserialization(_)));
    }
}
