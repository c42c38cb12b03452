/// RendezvousServer: client-lease bookkeeping on a rendezvous peer.
///
/// Grants fixed-length leases up to a capacity, renews them on request and
/// garbage-collects clients whose lease lapsed. Pure state machine like
/// [`crate::edge::EdgeClient`].
use std::collections::HashMap;
use std::time::Duration;

use crate::action::LeaseAction;
use crate::events::EventKind;
use crate::lease::LeaseConnection;
use crate::message::OverlayMessage;
use crate::types::{PeerAdvertisement, PeerId};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Length of every granted lease, regardless of what the client asked.
    pub lease_duration: Duration,
    pub gc_interval: Duration,
    /// New clients beyond this are declined with a zero lease.
    pub max_clients: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(20 * 60),
            gc_interval: Duration::from_secs(2 * 60),
            max_clients: 200,
        }
    }
}

pub struct RendezvousServer {
    local: PeerAdvertisement,
    config: ServerConfig,
    clients: HashMap<PeerId, LeaseConnection>,
    closed: bool,
}

impl RendezvousServer {
    pub fn new(local: PeerAdvertisement, config: ServerConfig) -> Self {
        Self {
            local,
            config,
            clients: HashMap::new(),
            closed: false,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn local_advertisement(&self) -> &PeerAdvertisement {
        &self.local
    }

    /// Later replies carry the new advertisement.
    pub fn set_local_advertisement(&mut self, advertisement: PeerAdvertisement) {
        self.local = advertisement;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn lease_ms(&self) -> u64 {
        self.config.lease_duration.as_millis() as u64
    }

    /// Announce ourselves as rendezvous: cache our advertisement for two lease lengths.
    pub fn start(&self) -> Vec<LeaseAction> {
        let lease = self.lease_ms();
        tracing::info!("acting as rendezvous (lease {lease}ms, max {} clients)", self.config.max_clients);
        vec![LeaseAction::Publish {
            advertisement: self.local.clone(),
            lifetime_ms: lease,
            expiration_ms: lease.saturating_mul(2),
        }]
    }

    // ── Queries ──────────────────────────────────────────────────────────

    /// Clients whose lease is still live, sorted.
    pub fn clients(&self, now: u64) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .clients
            .values()
            .filter(|c| c.is_live(now))
            .map(|c| c.peer_id())
            .collect();
        peers.sort();
        peers
    }

    /// Advertisements of live clients, for fan-out.
    pub fn client_advertisements(&self, now: u64) -> Vec<PeerAdvertisement> {
        self.clients
            .values()
            .filter(|c| c.is_live(now))
            .map(|c| c.advertisement().clone())
            .collect()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn is_client(&self, peer: &PeerId, now: u64) -> bool {
        self.clients.get(peer).is_some_and(|c| c.is_live(now))
    }

    pub fn client(&self, peer: &PeerId) -> Option<&LeaseConnection> {
        self.clients.get(peer)
    }

    // ── Lease protocol ───────────────────────────────────────────────────

    fn reply(&self, to: PeerAdvertisement, lease_ms: i64) -> LeaseAction {
        LeaseAction::Send {
            to,
            message: OverlayMessage::ConnectedReply {
                advertisement: Some(self.local.clone()),
                peer_id: Some(self.local.peer_id),
                lease_ms: Some(lease_ms),
            },
        }
    }

    /// Admit, renew, or decline a lease request.
    pub fn on_lease_request(
        &mut self,
        client: PeerAdvertisement,
        now: u64,
    ) -> Vec<LeaseAction> {
        if self.closed {
            return vec![];
        }
        let peer = client.peer_id;
        let lease = self.lease_ms();

        if let Some(conn) = self.clients.get_mut(&peer) {
            conn.connect(client.clone(), lease, 0, now);
            tracing::debug!("renewed lease for client {peer}");
            return vec![
                self.reply(client, lease as i64),
                LeaseAction::emit(EventKind::ClientReconnect, peer),
            ];
        }

        if self.clients.len() >= self.config.max_clients {
            tracing::debug!("at capacity ({}), declining {peer}", self.config.max_clients);
            return vec![self.reply(client, 0), LeaseAction::Release(peer)];
        }

        let mut conn = LeaseConnection::new(client.clone());
        conn.connect(client.clone(), lease, 0, now);
        self.clients.insert(peer, conn);
        tracing::info!("admitted client {peer} ({} total)", self.clients.len());
        vec![
            self.reply(client, lease as i64),
            LeaseAction::emit(EventKind::ClientConnect, peer),
        ]
    }

    /// The client is leaving.
    pub fn on_disconnect_request(&mut self, peer: PeerId) -> Vec<LeaseAction> {
        match self.clients.remove(&peer) {
            Some(_) => {
                tracing::info!("client {peer} disconnected");
                vec![
                    LeaseAction::emit(EventKind::ClientDisconnect, peer),
                    LeaseAction::Release(peer),
                ]
            }
            None => vec![],
        }
    }

    /// A send to the client failed; it goes at the next collection.
    pub fn on_send_failed(&mut self, peer: PeerId) {
        if let Some(conn) = self.clients.get_mut(&peer) {
            conn.set_connected(false);
        }
    }

    /// Drop clients that are disconnected or whose lease ran out.
    pub fn gc_tick(&mut self, now: u64) -> Vec<LeaseAction> {
        let dead: Vec<PeerId> = self
            .clients
            .values()
            .filter(|c| !c.is_live(now))
            .map(|c| c.peer_id())
            .collect();
        if !dead.is_empty() {
            tracing::info!("collecting {} stale client lease(s)", dead.len());
        }
        dead.into_iter()
            .flat_map(|peer| {
                self.clients.remove(&peer);
                [
                    LeaseAction::emit(EventKind::ClientFailed, peer),
                    LeaseAction::Release(peer),
                ]
            })
            .collect()
    }

    /// End one client's lease from our side.
    pub fn disconnect_client(&mut self, peer: PeerId) -> Vec<LeaseAction> {
        match self.clients.remove(&peer) {
            Some(conn) => vec![
                LeaseAction::disconnect(conn.advertisement().clone(), &self.local),
                LeaseAction::emit(EventKind::ClientDisconnect, peer),
                LeaseAction::Release(peer),
            ],
            None => vec![],
        }
    }

    /// Tell every client we are going away and stop accepting leases.
    pub fn shutdown(&mut self) -> Vec<LeaseAction> {
        let peers: Vec<PeerId> = self.clients.keys().copied().collect();
        let mut actions = Vec::new();
        for peer in peers {
            actions.extend(self.disconnect_client(peer));
        }
        self.closed = true;
        actions
    }
}
