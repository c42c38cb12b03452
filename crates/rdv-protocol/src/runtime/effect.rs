use crate::events::RendezvousEvent;
use crate::message::Frame;
use crate::types::{PeerAdvertisement, PeerId};

use super::DeliveredMessage;

/// Intent produced by [`super::state::RuntimeState`].
///
/// Every `handle_*` / `tick_*` method returns `Vec<RuntimeEffect>`; the
/// loop hands them to the executor, the only code that touches I/O.
#[derive(Debug)]
pub enum RuntimeEffect {
    /// Send a frame to one peer on the group's rendezvous service.
    SendTo {
        to: PeerAdvertisement,
        frame: Frame,
    },

    /// Broadcast a frame on the local subnet.
    Broadcast(Frame),

    /// Hand a frame to the walk forwarder. `dest = None` walks everywhere.
    Walk {
        dest: Option<PeerId>,
        frame: Frame,
        ttl: u32,
    },

    /// Deliver a propagated or walked payload to the application.
    Deliver(DeliveredMessage),

    /// Notify lifecycle listeners.
    Emit(RendezvousEvent),

    /// Report a failed candidate to the peer view.
    ReportFailure(PeerId),

    /// Cache an advertisement in the advertisement store.
    Publish {
        advertisement: PeerAdvertisement,
        lifetime_ms: u64,
        expiration_ms: u64,
    },

    /// Close the cached connection to a peer we no longer hold.
    Forget(PeerId),
}
