//! In-memory network: every collaborator trait over shared process state.
//!
//! Peers attach with a subnet label; subnet broadcast only reaches peers
//! with the same label. The candidate view is the network-wide list of
//! rendezvous advertisements. Peers can be made unreachable to simulate
//! crashes and partitions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, mpsc};

use crate::collab::{
    AdvertisementStore, Collaborators, Connection, InboundFrame, InboundPath, PeerView,
    Transport, ViewEvent, WalkForwarder,
};
use crate::error::RdvError;
use crate::types::{now_ms, PeerAdvertisement, PeerId, ServiceAddress};

const INBOX_CAPACITY: usize = 1024;
const VIEW_EVENT_CAPACITY: usize = 256;

struct Node {
    subnet: String,
    inboxes: Vec<mpsc::Sender<InboundFrame>>,
    reachable: bool,
}

#[derive(Default)]
struct Inner {
    nodes: HashMap<PeerId, Node>,
    candidates: Vec<PeerAdvertisement>,
    reported: Vec<PeerId>,
}

impl Inner {
    fn is_reachable(&self, peer: &PeerId) -> bool {
        self.nodes.get(peer).is_some_and(|n| n.reachable)
    }

    /// Push `data` into every inbox of `peer`.
    fn deliver(&self, peer: &PeerId, data: &[u8], path: InboundPath) -> Result<(), RdvError> {
        let node = self
            .nodes
            .get(peer)
            .filter(|n| n.reachable)
            .ok_or_else(|| RdvError::Transport {
                peer: *peer,
                reason: "unreachable".into(),
            })?;
        for inbox in &node.inboxes {
            let frame = InboundFrame {
                data: data.to_vec(),
                path,
            };
            if inbox.try_send(frame).is_err() {
                tracing::debug!("inbox of {peer} full or closed, frame dropped");
            }
        }
        Ok(())
    }
}

/// Shared in-process network. Cheap to clone.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<Inner>>,
    view_tx: broadcast::Sender<ViewEvent>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything one attached peer needs to start a runtime.
pub struct MemoryPeer {
    pub collaborators: Collaborators,
    pub inbound: mpsc::Receiver<InboundFrame>,
    pub store: Arc<MemoryStore>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        let (view_tx, _) = broadcast::channel(VIEW_EVENT_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            view_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach `local` on `subnet`. Attaching the same peer again adds
    /// another inbox (one per overlay instance).
    pub fn attach(&self, local: &PeerAdvertisement, subnet: &str) -> MemoryPeer {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        {
            let mut inner = self.lock();
            let node = inner.nodes.entry(local.peer_id).or_insert_with(|| Node {
                subnet: subnet.to_string(),
                inboxes: Vec::new(),
                reachable: true,
            });
            node.inboxes.push(tx);
        }

        let store = Arc::new(MemoryStore::new());
        let collaborators = Collaborators {
            transport: Arc::new(MemoryTransport {
                net: self.clone(),
                local: local.peer_id,
            }),
            view: Arc::new(MemoryView { net: self.clone() }),
            forwarder: Some(Arc::new(MemoryForwarder {
                net: self.clone(),
                local: local.peer_id,
            })),
            store: store.clone(),
        };
        MemoryPeer {
            collaborators,
            inbound: rx,
            store,
        }
    }

    /// Crash or revive a peer. Unreachable peers neither send nor receive.
    pub fn set_reachable(&self, peer: PeerId, reachable: bool) {
        if let Some(node) = self.lock().nodes.get_mut(&peer) {
            node.reachable = reachable;
        }
    }

    pub fn is_reachable(&self, peer: &PeerId) -> bool {
        self.lock().is_reachable(peer)
    }

    // ── Candidate view ───────────────────────────────────────────────

    /// Make `candidate` visible as a rendezvous to every peer.
    pub fn add_candidate(&self, candidate: PeerAdvertisement) {
        {
            let mut inner = self.lock();
            inner.candidates.retain(|c| c.peer_id != candidate.peer_id);
            inner.candidates.push(candidate.clone());
        }
        let _ = self.view_tx.send(ViewEvent::Added(candidate));
    }

    pub fn remove_candidate(&self, peer: PeerId) {
        if self.drop_candidate(&peer) {
            let _ = self.view_tx.send(ViewEvent::Removed(peer));
        }
    }

    pub fn fail_candidate(&self, peer: PeerId) {
        if self.drop_candidate(&peer) {
            let _ = self.view_tx.send(ViewEvent::Failed(peer));
        }
    }

    fn drop_candidate(&self, peer: &PeerId) -> bool {
        let mut inner = self.lock();
        let before = inner.candidates.len();
        inner.candidates.retain(|c| c.peer_id != *peer);
        inner.candidates.len() != before
    }

    pub fn candidates(&self) -> Vec<PeerAdvertisement> {
        self.lock().candidates.clone()
    }

    /// Peers reported through [`PeerView::report_failure`], in order.
    pub fn reported_failures(&self) -> Vec<PeerId> {
        self.lock().reported.clone()
    }
}

// ── Transport ────────────────────────────────────────────────────────

pub struct MemoryTransport {
    net: MemoryNetwork,
    local: PeerId,
}

struct MemoryConnection {
    net: MemoryNetwork,
    local: PeerId,
    remote: PeerId,
}

#[async_trait::async_trait]
impl Connection for MemoryConnection {
    async fn send(&self, data: &[u8], _service: &ServiceAddress) -> Result<(), RdvError> {
        let inner = self.net.lock();
        if !inner.is_reachable(&self.local) {
            return Err(RdvError::Transport {
                peer: self.remote,
                reason: "local peer offline".into(),
            });
        }
        inner.deliver(&self.remote, data, InboundPath::Direct)
    }

    fn is_closed(&self) -> bool {
        let inner = self.net.lock();
        !inner.is_reachable(&self.local) || !inner.is_reachable(&self.remote)
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn connection(
        &self,
        peer: PeerId,
        _route_hint: Option<&str>,
    ) -> Option<Arc<dyn Connection>> {
        let inner = self.net.lock();
        if !inner.is_reachable(&self.local) || !inner.is_reachable(&peer) {
            return None;
        }
        Some(Arc::new(MemoryConnection {
            net: self.net.clone(),
            local: self.local,
            remote: peer,
        }))
    }

    async fn broadcast(&self, data: &[u8], _service: &ServiceAddress) -> Result<(), RdvError> {
        let inner = self.net.lock();
        let subnet = match inner.nodes.get(&self.local) {
            Some(node) if node.reachable => node.subnet.clone(),
            _ => {
                return Err(RdvError::Transport {
                    peer: self.local,
                    reason: "local peer offline".into(),
                })
            }
        };
        let neighbours: Vec<PeerId> = inner
            .nodes
            .iter()
            .filter(|(id, n)| **id != self.local && n.reachable && n.subnet == subnet)
            .map(|(id, _)| *id)
            .collect();
        for peer in neighbours {
            inner.deliver(&peer, data, InboundPath::Broadcast)?;
        }
        Ok(())
    }
}

// ── Candidate view ───────────────────────────────────────────────────

pub struct MemoryView {
    net: MemoryNetwork,
}

impl PeerView for MemoryView {
    fn current_view(&self) -> Vec<PeerAdvertisement> {
        self.net.candidates()
    }

    fn subscribe(&self) -> broadcast::Receiver<ViewEvent> {
        self.net.view_tx.subscribe()
    }

    /// Records the report; an unreachable candidate also leaves the view.
    fn report_failure(&self, peer: PeerId, notify_others: bool) {
        let gone = {
            let mut inner = self.net.lock();
            inner.reported.push(peer);
            !inner.is_reachable(&peer)
        };
        if gone && notify_others {
            self.net.fail_candidate(peer);
        }
    }
}

// ── Walk forwarder ───────────────────────────────────────────────────

/// Reaches every rendezvous candidate in one hop.
pub struct MemoryForwarder {
    net: MemoryNetwork,
    local: PeerId,
}

#[async_trait::async_trait]
impl WalkForwarder for MemoryForwarder {
    async fn send(
        &self,
        dest: Option<PeerId>,
        data: &[u8],
        _service: &ServiceAddress,
        ttl: u32,
        _hint: Option<&str>,
    ) -> Result<(), RdvError> {
        let inner = self.net.lock();
        if !inner.is_reachable(&self.local) {
            return Err(RdvError::Forwarder("local peer offline".into()));
        }
        if ttl == 0 {
            return Ok(());
        }
        match dest {
            Some(peer) => inner
                .deliver(&peer, data, InboundPath::Direct)
                .map_err(|_| RdvError::Forwarder(format!("no route to {peer}"))),
            None => {
                for candidate in &inner.candidates {
                    if candidate.peer_id == self.local {
                        continue;
                    }
                    if let Err(e) = inner.deliver(&candidate.peer_id, data, InboundPath::Direct) {
                        tracing::debug!("walk skipped {}: {e}", candidate.peer_id);
                    }
                }
                Ok(())
            }
        }
    }
}

// ── Advertisement store ──────────────────────────────────────────────

/// A published advertisement with its cache deadlines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAdvertisement {
    pub advertisement: PeerAdvertisement,
    pub lifetime_ms: u64,
    pub expiration_ms: u64,
    pub published_at: u64,
}

/// Per-peer advertisement cache.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<PeerId, StoredAdvertisement>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PeerId, StoredAdvertisement>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, peer: &PeerId) -> Option<StoredAdvertisement> {
        self.lock().get(peer).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[async_trait::async_trait]
impl AdvertisementStore for MemoryStore {
    async fn publish(
        &self,
        advertisement: &PeerAdvertisement,
        lifetime_ms: u64,
        expiration_ms: u64,
    ) -> Result<(), RdvError> {
        self.lock().insert(
            advertisement.peer_id,
            StoredAdvertisement {
                advertisement: advertisement.clone(),
                lifetime_ms,
                expiration_ms,
                published_at: now_ms(),
            },
        );
        Ok(())
    }

    async fn query_local(&self, kind: &str, attribute: &str, value: &str) -> Vec<PeerAdvertisement> {
        if kind != "Peer" {
            return Vec::new();
        }
        let now = now_ms();
        self.lock()
            .values()
            .filter(|s| now < s.published_at.saturating_add(s.expiration_ms))
            .filter(|s| match attribute {
                "PID" => s.advertisement.peer_id.to_string() == value,
                "Name" => s.advertisement.name == value,
                _ => false,
            })
            .map(|s| s.advertisement.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adv(seed: u8) -> PeerAdvertisement {
        PeerAdvertisement::new(PeerId::from_bytes([seed; 32]), format!("peer-{seed}"))
    }

    fn svc() -> ServiceAddress {
        ServiceAddress::rendezvous("g")
    }

    #[tokio::test]
    async fn direct_send_reaches_every_inbox() {
        let net = MemoryNetwork::new();
        let a = net.attach(&adv(1), "lan");
        let mut b1 = net.attach(&adv(2), "lan");
        let mut b2 = net.attach(&adv(2), "lan");

        let conn = a
            .collaborators
            .transport
            .connection(adv(2).peer_id, None)
            .await
            .expect("reachable");
        conn.send(b"hi", &svc()).await.unwrap();

        assert_eq!(b1.inbound.recv().await.unwrap().data, b"hi");
        assert_eq!(b2.inbound.recv().await.unwrap().path, InboundPath::Direct);
    }

    #[tokio::test]
    async fn unreachable_peer_has_no_connection() {
        let net = MemoryNetwork::new();
        let a = net.attach(&adv(1), "lan");
        let _b = net.attach(&adv(2), "lan");
        let conn = a
            .collaborators
            .transport
            .connection(adv(2).peer_id, None)
            .await
            .unwrap();

        net.set_reachable(adv(2).peer_id, false);
        assert!(conn.is_closed());
        assert!(conn.send(b"x", &svc()).await.is_err());
        assert!(a
            .collaborators
            .transport
            .connection(adv(2).peer_id, None)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn broadcast_stays_on_subnet() {
        let net = MemoryNetwork::new();
        let a = net.attach(&adv(1), "lan-a");
        let mut same = net.attach(&adv(2), "lan-a");
        let mut other = net.attach(&adv(3), "lan-b");

        a.collaborators.transport.broadcast(b"b", &svc()).await.unwrap();
        assert_eq!(same.inbound.recv().await.unwrap().path, InboundPath::Broadcast);
        assert!(other.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn forwarder_floods_rendezvous_only() {
        let net = MemoryNetwork::new();
        let r1 = net.attach(&adv(1), "x");
        let mut r2 = net.attach(&adv(2), "y");
        let mut edge = net.attach(&adv(3), "z");
        net.add_candidate(adv(1));
        net.add_candidate(adv(2));

        let fwd = r1.collaborators.forwarder.clone().unwrap();
        fwd.send(None, b"w", &svc(), 3, None).await.unwrap();
        assert_eq!(r2.inbound.recv().await.unwrap().data, b"w");
        assert!(edge.inbound.try_recv().is_err());

        let err = fwd
            .send(Some(adv(9).peer_id), b"w", &svc(), 3, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RdvError::Forwarder(_)));
    }

    #[tokio::test]
    async fn view_changes_are_broadcast() {
        let net = MemoryNetwork::new();
        let a = net.attach(&adv(1), "lan");
        let mut rx = a.collaborators.view.subscribe();

        net.add_candidate(adv(2));
        net.remove_candidate(adv(2).peer_id);
        net.remove_candidate(adv(2).peer_id);

        assert_eq!(rx.recv().await.unwrap(), ViewEvent::Added(adv(2)));
        assert_eq!(rx.recv().await.unwrap(), ViewEvent::Removed(adv(2).peer_id));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn reported_failure_of_dead_candidate_leaves_view() {
        let net = MemoryNetwork::new();
        let a = net.attach(&adv(1), "lan");
        let _r = net.attach(&adv(2), "lan");
        net.add_candidate(adv(2));

        a.collaborators.view.report_failure(adv(2).peer_id, true);
        assert_eq!(net.candidates().len(), 1, "live candidate stays");

        net.set_reachable(adv(2).peer_id, false);
        a.collaborators.view.report_failure(adv(2).peer_id, true);
        assert!(net.candidates().is_empty());
        assert_eq!(net.reported_failures().len(), 2);
    }

    #[tokio::test]
    async fn store_queries_by_id_and_name() {
        let store = MemoryStore::new();
        store.publish(&adv(4), 1_000, 60_000).await.unwrap();

        let id = adv(4).peer_id.to_string();
        assert_eq!(store.query_local("Peer", "PID", &id).await, vec![adv(4)]);
        assert_eq!(store.query_local("Peer", "Name", "peer-4").await.len(), 1);
        assert!(store.query_local("Group", "PID", &id).await.is_empty());
        assert!(store.query_local("Peer", "PID", "nope").await.is_empty());
        assert_eq!(store.get(&adv(4).peer_id).unwrap().expiration_ms, 60_000);
    }
}
