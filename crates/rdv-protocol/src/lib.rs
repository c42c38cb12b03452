//! Rendezvous overlay layer.
//!
//! Edge peers lease connections from rendezvous super-peers and keep them
//! alive through renewal; rendezvous peers admit, renew and collect client
//! leases. Messages spread by flood (`propagate`) or by TTL-bounded walks
//! between rendezvous, with a loop guard on every hop.
//!
//! Wire format: MessagePack (compact binary).
//! The transport, candidate view, walk forwarder and advertisement store are
//! injected traits; [`memory`] implements all of them in-process.

pub mod action;
pub mod collab;
pub mod dissemination;
pub mod edge;
pub mod error;
pub mod events;
pub mod lease;
pub mod memory;
pub mod message;
pub mod runtime;
pub mod server;
pub mod types;

pub use action::LeaseAction;
pub use collab::{
    AdvertisementStore, Collaborators, Connection, InboundFrame, InboundPath, PeerView,
    Transport, ViewEvent, WalkForwarder,
};
pub use dissemination::{Admission, Disseminator, Egress, Message, Plan, PropagationHeader};
pub use edge::{EdgeClient, EdgeConfig};
pub use error::RdvError;
pub use events::{EventKind, EventListener, EventNotifier, ListenerId, RendezvousEvent};
pub use lease::{LeaseConnection, LeaseState};
pub use memory::{MemoryNetwork, MemoryPeer, MemoryStore};
pub use message::{Frame, LeaseReply, OverlayMessage};
pub use runtime::{
    DeliveredMessage, OverlayRuntime, RuntimeChannels, RuntimeConfig, RuntimeHandle,
};
pub use server::{RendezvousServer, ServerConfig};
pub use types::{
    now_ms, AdvertisementDigest, PeerAdvertisement, PeerId, PeerRole, ServiceAddress, MAX_TTL,
};
