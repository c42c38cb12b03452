/// Collaborators the overlay consumes but does not implement.
///
/// Production wires these to a real messenger, membership overlay and
/// advertisement cache; tests and the simulator use [`crate::memory`].
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::error::RdvError;
use crate::types::{PeerAdvertisement, PeerId, ServiceAddress};

// ── Transport ──────────────────────────────────────────────────────────

/// An open path to one peer.
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    /// Deliver `data` to `service` on the remote peer.
    async fn send(&self, data: &[u8], service: &ServiceAddress) -> Result<(), RdvError>;

    fn is_closed(&self) -> bool;
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Obtain a connection, or `None` if the peer cannot be reached now.
    async fn connection(
        &self,
        peer: PeerId,
        route_hint: Option<&str>,
    ) -> Option<Arc<dyn Connection>>;

    /// Send to every peer on the local subnet.
    async fn broadcast(&self, data: &[u8], service: &ServiceAddress) -> Result<(), RdvError>;
}

/// How an inbound frame reached us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundPath {
    Direct,
    Broadcast,
}

/// Raw bytes handed over by the transport callback.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub data: Vec<u8>,
    pub path: InboundPath,
}

// ── Candidate view ─────────────────────────────────────────────────────

/// Change notification from the membership overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewEvent {
    Added(PeerAdvertisement),
    Removed(PeerId),
    Failed(PeerId),
}

/// The locally known set of rendezvous candidates.
pub trait PeerView: Send + Sync {
    fn current_view(&self) -> Vec<PeerAdvertisement>;

    /// Register for change notifications; dropping the receiver unregisters.
    fn subscribe(&self) -> broadcast::Receiver<ViewEvent>;

    /// Tell the overlay a candidate misbehaved or vanished.
    fn report_failure(&self, peer: PeerId, notify_others: bool);
}

// ── Walk forwarder ─────────────────────────────────────────────────────

/// Range-limited multi-hop forwarder between rendezvous peers.
///
/// `dest = None` walks to every reachable rendezvous within `ttl` hops.
#[async_trait::async_trait]
pub trait WalkForwarder: Send + Sync {
    async fn send(
        &self,
        dest: Option<PeerId>,
        data: &[u8],
        service: &ServiceAddress,
        ttl: u32,
        hint: Option<&str>,
    ) -> Result<(), RdvError>;
}

// ── Advertisement store ────────────────────────────────────────────────

#[async_trait::async_trait]
pub trait AdvertisementStore: Send + Sync {
    async fn publish(
        &self,
        advertisement: &PeerAdvertisement,
        lifetime_ms: u64,
        expiration_ms: u64,
    ) -> Result<(), RdvError>;

    /// Look up cached advertisements where `attribute == value`.
    async fn query_local(&self, kind: &str, attribute: &str, value: &str)
        -> Vec<PeerAdvertisement>;
}

/// Everything a running overlay instance talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub view: Arc<dyn PeerView>,
    /// Only rendezvous peers walk; edges may leave this empty.
    pub forwarder: Option<Arc<dyn WalkForwarder>>,
    pub store: Arc<dyn AdvertisementStore>,
}
