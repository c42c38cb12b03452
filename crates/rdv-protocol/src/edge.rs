/// EdgeClient: edge-side rendezvous connection monitor.
///
/// Pure state machine: picks candidates from the view, requests and renews
/// leases, challenges leases when the local advertisement changes, and
/// drops leases that expire or fail. Returns `Vec<LeaseAction>` for the
/// runtime to execute.
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use rand::seq::IndexedRandom;
use rand::Rng;

use crate::action::LeaseAction;
use crate::events::EventKind;
use crate::lease::LeaseConnection;
use crate::message::{LeaseReply, OverlayMessage};
use crate::types::{AdvertisementDigest, PeerAdvertisement, PeerId};

#[derive(Debug, Clone)]
pub struct EdgeConfig {
    /// Number of rendezvous leases to hold.
    pub target_connections: usize,
    /// Period of the monitor tick once running.
    pub monitor_interval: Duration,
    /// First tick delay when no candidate is visible yet.
    pub max_choice_delay: Duration,
    /// Floor for the first tick delay when candidates are visible.
    pub min_choice_delay: Duration,
    /// Candidate-added events closer than this to the last attempt wait for the next tick.
    pub add_event_debounce: Duration,
    /// Lease length asked for (advisory; the rendezvous decides).
    pub requested_lease: Duration,
    /// Remaining-lease cap applied when the local advertisement changes.
    pub challenge_window: Duration,
    /// Unanswered lease requests are abandoned after this long.
    pub pending_timeout: Duration,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            target_connections: 1,
            monitor_interval: Duration::from_secs(20),
            max_choice_delay: Duration::from_secs(30),
            min_choice_delay: Duration::from_secs(1),
            add_event_debounce: Duration::from_secs(3),
            requested_lease: Duration::from_secs(20 * 60),
            challenge_window: Duration::from_secs(90),
            pending_timeout: Duration::from_secs(30),
        }
    }
}

/// An outstanding lease request to a candidate.
#[derive(Debug, Clone)]
struct PendingLease {
    requested_at: u64,
    presented: AdvertisementDigest,
}

pub struct EdgeClient {
    local: PeerAdvertisement,
    config: EdgeConfig,
    connections: HashMap<PeerId, LeaseConnection>,
    pending: HashMap<PeerId, PendingLease>,
    /// Candidates that failed or refused since the last full pass.
    tried: HashSet<PeerId>,
    last_attempt_at: Option<u64>,
    closed: bool,
}

impl EdgeClient {
    pub fn new(local: PeerAdvertisement, config: EdgeConfig) -> Self {
        Self {
            local,
            config,
            connections: HashMap::new(),
            pending: HashMap::new(),
            tried: HashSet::new(),
            last_attempt_at: None,
            closed: false,
        }
    }

    pub fn local_advertisement(&self) -> &PeerAdvertisement {
        &self.local
    }

    /// Replace the local advertisement; held leases get challenged on the next tick.
    pub fn set_local_advertisement(&mut self, advertisement: PeerAdvertisement) {
        self.local = advertisement;
    }

    pub fn config(&self) -> &EdgeConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    // ── Queries ──────────────────────────────────────────────────────────

    /// Whether at least one lease is live.
    pub fn is_connected(&self, now: u64) -> bool {
        self.connections.values().any(|c| c.is_live(now))
    }

    pub fn connected_peers(&self, now: u64) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .connections
            .values()
            .filter(|c| c.is_live(now))
            .map(|c| c.peer_id())
            .collect();
        peers.sort();
        peers
    }

    pub fn connection(&self, peer: &PeerId) -> Option<&LeaseConnection> {
        self.connections.get(peer)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_pending(&self, peer: &PeerId) -> bool {
        self.pending.contains_key(peer)
    }

    // ── Start / scheduling ───────────────────────────────────────────────

    /// Delay before the first monitor tick given the visible candidates.
    ///
    /// Shrinks as more candidates are already known; the full
    /// `max_choice_delay` when none are.
    pub fn start(&mut self, view: &[PeerAdvertisement]) -> Duration {
        let visible = view
            .iter()
            .filter(|c| c.peer_id != self.local.peer_id)
            .count();
        if visible == 0 {
            return self.config.max_choice_delay;
        }
        let scaled = self.config.max_choice_delay / (visible as u32 + 1);
        scaled.max(self.config.min_choice_delay)
    }

    /// A candidate appeared. Returns `Some(delay)` if the monitor should run early.
    pub fn on_candidate_added(
        &mut self,
        candidate: &PeerAdvertisement,
        now: u64,
    ) -> Option<Duration> {
        if self.closed || candidate.peer_id == self.local.peer_id {
            return None;
        }
        if self.connections.len() + self.pending.len() >= self.config.target_connections {
            return None;
        }
        let debounce = self.config.add_event_debounce.as_millis() as u64;
        if let Some(last) = self.last_attempt_at {
            if now.saturating_sub(last) < debounce {
                return None;
            }
        }
        Some(Duration::ZERO)
    }

    /// A candidate left or failed in the view.
    pub fn on_candidate_removed(&mut self, peer: PeerId) -> Vec<LeaseAction> {
        let mut actions = self.drop_pending(peer);
        self.tried.remove(&peer);
        if let Some(conn) = self.connections.remove(&peer) {
            tracing::info!("rendezvous {peer} left the view, dropping lease");
            actions.push(LeaseAction::disconnect(conn.advertisement().clone(), &self.local));
            actions.push(LeaseAction::emit(EventKind::RdvFailed, peer));
            actions.push(LeaseAction::Release(peer));
        }
        actions
    }

    /// Forget an unanswered request; `Abandon` if there was one.
    fn drop_pending(&mut self, peer: PeerId) -> Vec<LeaseAction> {
        match self.pending.remove(&peer) {
            Some(_) => vec![LeaseAction::Abandon(peer)],
            None => vec![],
        }
    }

    // ── Monitor ──────────────────────────────────────────────────────────

    /// Periodic maintenance: sweep, challenge, renew, then seek.
    pub fn monitor_tick<R: Rng + ?Sized>(
        &mut self,
        view: &[PeerAdvertisement],
        now: u64,
        rng: &mut R,
    ) -> Vec<LeaseAction> {
        if self.closed {
            return vec![];
        }
        let mut actions = Vec::new();

        let dead: Vec<PeerId> = self
            .connections
            .values()
            .filter(|c| !c.is_live(now))
            .map(|c| c.peer_id())
            .collect();
        for peer in dead {
            self.connections.remove(&peer);
            self.tried.insert(peer);
            tracing::info!("lease with rendezvous {peer} lost");
            actions.push(LeaseAction::emit(EventKind::RdvFailed, peer));
            actions.push(LeaseAction::ReportFailure(peer));
            actions.push(LeaseAction::Release(peer));
        }

        let challenge_ms = self.config.challenge_window.as_millis() as i64;
        let local_digest = self.local.digest();
        let connect_request = self.connect_request();
        for conn in self.connections.values_mut() {
            if conn.advertisement_has_changed(&self.local) {
                tracing::debug!("local advertisement changed, challenging {}", conn.peer_id());
                conn.challenge(challenge_ms, now);
            }
            if conn.needs_renewal(now) {
                conn.mark_renewal_sent();
                conn.record_presented(local_digest);
                actions.push(LeaseAction::Send {
                    to: conn.advertisement().clone(),
                    message: connect_request.clone(),
                });
            }
        }

        let timeout = self.config.pending_timeout.as_millis() as u64;
        let mut abandoned = Vec::new();
        self.pending.retain(|peer, p| {
            let keep = now.saturating_sub(p.requested_at) < timeout;
            if !keep {
                abandoned.push(*peer);
            }
            keep
        });
        for peer in abandoned {
            tracing::debug!("lease request to {peer} went unanswered");
            self.tried.insert(peer);
            actions.push(LeaseAction::Abandon(peer));
        }

        if self.connections.len() + self.pending.len() < self.config.target_connections {
            if let Some(candidate) = self.pick_candidate(view, rng) {
                actions.push(self.request_lease(candidate, now));
            }
        }

        actions
    }

    /// Random candidate that is not held, pending, or already tried.
    fn pick_candidate<R: Rng + ?Sized>(
        &mut self,
        view: &[PeerAdvertisement],
        rng: &mut R,
    ) -> Option<PeerAdvertisement> {
        let usable = |c: &&PeerAdvertisement, tried: &HashSet<PeerId>| {
            c.peer_id != self.local.peer_id
                && !self.connections.contains_key(&c.peer_id)
                && !self.pending.contains_key(&c.peer_id)
                && !tried.contains(&c.peer_id)
        };

        let mut eligible: Vec<&PeerAdvertisement> =
            view.iter().filter(|c| usable(c, &self.tried)).collect();
        if eligible.is_empty() && !self.tried.is_empty() {
            // Every candidate has been tried once; start a new pass.
            let empty = HashSet::new();
            eligible = view.iter().filter(|c| usable(c, &empty)).collect();
            if !eligible.is_empty() {
                self.tried.clear();
            }
        }
        eligible.choose(rng).map(|c| (*c).clone())
    }

    fn connect_request(&self) -> OverlayMessage {
        OverlayMessage::ConnectRequest {
            advertisement: self.local.clone(),
            requested_lease_ms: Some(self.config.requested_lease.as_millis() as u64),
        }
    }

    // ── Lease protocol ───────────────────────────────────────────────────

    /// Ask `candidate` for a lease. The reply arrives asynchronously.
    pub fn request_lease(&mut self, candidate: PeerAdvertisement, now: u64) -> LeaseAction {
        self.last_attempt_at = Some(now);
        self.pending.insert(
            candidate.peer_id,
            PendingLease {
                requested_at: now,
                presented: self.local.digest(),
            },
        );
        tracing::debug!("requesting lease from {}", candidate.peer_id);
        LeaseAction::Send {
            to: candidate,
            message: self.connect_request(),
        }
    }

    /// Raw `ConnectedReply` fields from the wire. Malformed replies are dropped.
    pub fn on_connected_reply(
        &mut self,
        advertisement: Option<PeerAdvertisement>,
        peer_id: Option<PeerId>,
        lease_ms: Option<i64>,
        now: u64,
    ) -> Vec<LeaseAction> {
        match LeaseReply::parse(advertisement, peer_id, lease_ms) {
            Ok(reply) => self.on_lease_reply(reply, now),
            Err(e) => {
                tracing::debug!("dropping connected reply: {e}");
                vec![]
            }
        }
    }

    pub fn on_lease_reply(&mut self, reply: LeaseReply, now: u64) -> Vec<LeaseAction> {
        if self.closed {
            return vec![];
        }
        if reply.is_granted() {
            self.on_lease_granted(reply.granter, reply.lease_ms as u64, now)
        } else {
            self.on_lease_denied(reply.granter.peer_id)
        }
    }

    fn on_lease_granted(
        &mut self,
        granter: PeerAdvertisement,
        lease_ms: u64,
        now: u64,
    ) -> Vec<LeaseAction> {
        let peer = granter.peer_id;
        let pending = self.pending.remove(&peer);
        let margin = lease_ms / 3;
        let publish = LeaseAction::Publish {
            advertisement: granter.clone(),
            lifetime_ms: lease_ms,
            expiration_ms: lease_ms,
        };

        if let Some(conn) = self.connections.get_mut(&peer) {
            conn.connect(granter, lease_ms, margin, now);
            if let Some(p) = pending {
                conn.record_presented(p.presented);
            }
            tracing::debug!("lease from {peer} renewed for {lease_ms}ms");
            return vec![LeaseAction::emit(EventKind::RdvReconnect, peer), publish];
        }

        if pending.is_none() && self.connections.len() >= self.config.target_connections {
            tracing::debug!("unsolicited lease from {peer} while at target, releasing it");
            return vec![
                LeaseAction::disconnect(granter, &self.local),
                LeaseAction::Release(peer),
            ];
        }

        let presented = pending.map(|p| p.presented).unwrap_or_else(|| self.local.digest());
        let mut conn = LeaseConnection::new(granter.clone());
        conn.connect(granter, lease_ms, margin, now);
        conn.record_presented(presented);
        self.connections.insert(peer, conn);
        self.tried.remove(&peer);
        tracing::info!("connected to rendezvous {peer} (lease {lease_ms}ms)");
        vec![LeaseAction::emit(EventKind::RdvConnect, peer), publish]
    }

    /// Lease refused (lease <= 0). Not an error: try elsewhere.
    pub fn on_lease_denied(&mut self, peer: PeerId) -> Vec<LeaseAction> {
        self.pending.remove(&peer);
        self.tried.insert(peer);
        match self.connections.remove(&peer) {
            Some(_) => {
                tracing::info!("rendezvous {peer} refused to renew our lease");
                vec![
                    LeaseAction::emit(EventKind::RdvFailed, peer),
                    LeaseAction::Release(peer),
                ]
            }
            None => {
                tracing::debug!("rendezvous {peer} declined our lease request");
                vec![LeaseAction::Release(peer)]
            }
        }
    }

    /// The rendezvous told us it is ending the lease.
    pub fn on_remote_disconnect(&mut self, peer: PeerId) -> Vec<LeaseAction> {
        let mut actions = self.drop_pending(peer);
        if self.connections.remove(&peer).is_some() {
            tracing::info!("rendezvous {peer} disconnected us");
            actions.push(LeaseAction::emit(EventKind::RdvDisconnect, peer));
            actions.push(LeaseAction::Release(peer));
        }
        actions
    }

    /// A send to `peer` failed at the transport. Returns whether a pending
    /// request to it was dropped.
    pub fn on_send_failed(&mut self, peer: PeerId) -> bool {
        let dropped = self.pending.remove(&peer).is_some();
        if dropped {
            tracing::debug!("candidate {peer} unreachable, skipping");
            self.tried.insert(peer);
        }
        if let Some(conn) = self.connections.get_mut(&peer) {
            conn.set_connected(false);
        }
        dropped
    }

    /// Voluntarily end the lease with `peer`, or give up a request to it.
    pub fn disconnect(&mut self, peer: PeerId) -> Vec<LeaseAction> {
        let mut actions = self.drop_pending(peer);
        if let Some(conn) = self.connections.remove(&peer) {
            actions.push(LeaseAction::disconnect(conn.advertisement().clone(), &self.local));
            actions.push(LeaseAction::emit(EventKind::RdvDisconnect, peer));
            actions.push(LeaseAction::Release(peer));
        }
        actions
    }

    /// Cap the remaining lease with `peer` to `delay_ms`; `<= 0` drops it now.
    pub fn challenge(&mut self, peer: PeerId, delay_ms: i64, now: u64) -> Vec<LeaseAction> {
        let Some(conn) = self.connections.get_mut(&peer) else {
            return vec![];
        };
        if conn.challenge(delay_ms, now) {
            return vec![];
        }
        self.connections.remove(&peer);
        vec![
            LeaseAction::emit(EventKind::RdvFailed, peer),
            LeaseAction::ReportFailure(peer),
            LeaseAction::Release(peer),
        ]
    }

    /// Disconnect everything and refuse further work.
    pub fn shutdown(&mut self) -> Vec<LeaseAction> {
        let peers: Vec<PeerId> = self.connections.keys().copied().collect();
        let mut actions = Vec::new();
        for peer in peers {
            actions.extend(self.disconnect(peer));
        }
        self.pending.clear();
        self.closed = true;
        actions
    }
}
