/// Wire messages of the rendezvous protocol.
///
/// One tagged enum covers every message the overlay exchanges; a `Frame`
/// wraps it with the sender and the peer group it belongs to.
/// Serialized as MessagePack.
use serde::{Deserialize, Serialize};

use crate::dissemination::PropagationHeader;
use crate::error::RdvError;
use crate::types::{PeerAdvertisement, PeerId, ServiceAddress};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OverlayMessage {
    /// Edge → rendezvous: request or renew a lease.
    ConnectRequest {
        advertisement: PeerAdvertisement,
        /// Advisory only; the rendezvous grants its own fixed duration.
        requested_lease_ms: Option<u64>,
    },
    /// Rendezvous → edge: lease outcome. `lease_ms <= 0` is a rejection.
    ///
    /// Fields are optional on the wire so that a truncated reply can be
    /// told apart from a rejection.
    ConnectedReply {
        advertisement: Option<PeerAdvertisement>,
        peer_id: Option<PeerId>,
        lease_ms: Option<i64>,
    },
    /// Either side: end the lease now.
    DisconnectRequest { advertisement: PeerAdvertisement },
    /// Flooded application message.
    Propagate {
        header: PropagationHeader,
        service: ServiceAddress,
        payload: Vec<u8>,
    },
    /// Multi-hop application message; `destination` is the real target
    /// service, recovered after the forwarder delivered to the walk service.
    /// Empty `targets` walks to every rendezvous.
    Walk {
        header: PropagationHeader,
        destination: ServiceAddress,
        targets: Vec<PeerId>,
        payload: Vec<u8>,
    },
}

impl OverlayMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            OverlayMessage::ConnectRequest { .. } => "connect",
            OverlayMessage::ConnectedReply { .. } => "connected",
            OverlayMessage::DisconnectRequest { .. } => "disconnect",
            OverlayMessage::Propagate { .. } => "propagate",
            OverlayMessage::Walk { .. } => "walk",
        }
    }
}

/// A validated lease reply.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseReply {
    pub granter: PeerAdvertisement,
    pub lease_ms: i64,
}

impl LeaseReply {
    /// Extract the three mandatory reply fields.
    ///
    /// Fails when a field is missing or the granter id disagrees with the
    /// granter advertisement.
    pub fn parse(
        advertisement: Option<PeerAdvertisement>,
        peer_id: Option<PeerId>,
        lease_ms: Option<i64>,
    ) -> Result<Self, RdvError> {
        let granter = advertisement.ok_or_else(|| RdvError::MalformedMessage {
            reason: "connected reply without granter advertisement".into(),
        })?;
        let peer_id = peer_id.ok_or_else(|| RdvError::MalformedMessage {
            reason: "connected reply without granter peer id".into(),
        })?;
        let lease_ms = lease_ms.ok_or_else(|| RdvError::MalformedMessage {
            reason: "connected reply without lease".into(),
        })?;
        if granter.peer_id != peer_id {
            return Err(RdvError::MalformedMessage {
                reason: format!(
                    "granter id {peer_id} does not match advertisement {}",
                    granter.peer_id
                ),
            });
        }
        Ok(Self { granter, lease_ms })
    }

    pub fn is_granted(&self) -> bool {
        self.lease_ms > 0
    }
}

/// Unit of exchange on the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Peer group this frame belongs to.
    pub group: String,
    pub from: PeerId,
    pub body: OverlayMessage,
}

impl Frame {
    pub fn new(group: impl Into<String>, from: PeerId, body: OverlayMessage) -> Self {
        Self {
            group: group.into(),
            from,
            body,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, RdvError> {
        rmp_serde::to_vec(self).map_err(Into::into)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, RdvError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adv(seed: u8) -> PeerAdvertisement {
        PeerAdvertisement::new(PeerId::from_bytes([seed; 32]), format!("peer-{seed}"))
    }

    #[test]
    fn frame_roundtrip_msgpack() {
        let frame = Frame::new(
            "group-1",
            PeerId::from_bytes([3; 32]),
            OverlayMessage::ConnectRequest {
                advertisement: adv(3),
                requested_lease_ms: Some(1_200_000),
            },
        );
        let bytes = frame.to_bytes().expect("serialize");
        let decoded = Frame::from_bytes(&bytes).expect("deserialize");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            Frame::from_bytes(&[0xde, 0xad, 0xbe, 0xef]),
            Err(RdvError::Deserialization(_))
        ));
    }

    #[test]
    fn reply_parse_complete() {
        let a = adv(5);
        let reply = LeaseReply::parse(Some(a.clone()), Some(a.peer_id), Some(60_000)).unwrap();
        assert_eq!(reply.granter, a);
        assert!(reply.is_granted());
    }

    #[test]
    fn reply_zero_lease_is_rejection_not_error() {
        let a = adv(5);
        let reply = LeaseReply::parse(Some(a.clone()), Some(a.peer_id), Some(0)).unwrap();
        assert!(!reply.is_granted());
    }

    #[test]
    fn reply_missing_fields_is_malformed() {
        let a = adv(5);
        assert!(LeaseReply::parse(None, Some(a.peer_id), Some(1)).is_err());
        assert!(LeaseReply::parse(Some(a.clone()), None, Some(1)).is_err());
        assert!(LeaseReply::parse(Some(a.clone()), Some(a.peer_id), None).is_err());
    }

    #[test]
    fn reply_mismatched_granter_is_malformed() {
        let err = LeaseReply::parse(Some(adv(5)), Some(adv(6).peer_id), Some(1)).unwrap_err();
        assert!(matches!(err, RdvError::MalformedMessage { .. }));
    }
}
