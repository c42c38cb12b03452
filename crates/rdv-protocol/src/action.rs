use crate::events::{EventKind, RendezvousEvent};
use crate::message::OverlayMessage;
use crate::types::{PeerAdvertisement, PeerId};

/// Side effect requested by the edge or server state machine.
///
/// The state machines never perform I/O; the runtime executes these.
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseAction {
    /// Send a lease-protocol message to a peer (fire-and-forget).
    Send {
        to: PeerAdvertisement,
        message: OverlayMessage,
    },
    /// Notify lifecycle listeners.
    Emit(RendezvousEvent),
    /// Tell the candidate view this peer failed.
    ReportFailure(PeerId),
    /// Cache an advertisement in the local advertisement store.
    Publish {
        advertisement: PeerAdvertisement,
        lifetime_ms: u64,
        expiration_ms: u64,
    },
    /// A lease request to this peer was given up without an answer.
    Abandon(PeerId),
    /// Nothing is held with this peer any more; drop what is cached for it.
    Release(PeerId),
}

impl LeaseAction {
    pub(crate) fn emit(kind: EventKind, peer: PeerId) -> Self {
        LeaseAction::Emit(RendezvousEvent::new(kind, peer))
    }

    pub(crate) fn disconnect(to: PeerAdvertisement, local: &PeerAdvertisement) -> Self {
        LeaseAction::Send {
            to,
            message: OverlayMessage::DisconnectRequest {
                advertisement: local.clone(),
            },
        }
    }

    /// The event this action emits, if any.
    pub fn event(&self) -> Option<&RendezvousEvent> {
        match self {
            LeaseAction::Emit(event) => Some(event),
            _ => None,
        }
    }
}
