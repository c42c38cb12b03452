use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use tokio::sync::oneshot;

use crate::action::LeaseAction;
use crate::collab::{InboundPath, ViewEvent};
use crate::dissemination::{Admission, Disseminator, Egress, Message, Plan, PropagationHeader};
use crate::edge::EdgeClient;
use crate::error::RdvError;
use crate::events::{EventKind, RendezvousEvent};
use crate::message::{Frame, OverlayMessage};
use crate::server::RendezvousServer;
use crate::types::{PeerAdvertisement, PeerId, PeerRole, ServiceAddress};

use super::effect::RuntimeEffect;
use super::{DeliveredMessage, RuntimeConfig};

/// Reply slot of a caller blocked in `connect_to_rendezvous`.
pub type LeaseWaiter = oneshot::Sender<Result<(), RdvError>>;

enum Role {
    Edge(EdgeClient),
    Rendezvous(RendezvousServer),
}

/// Complete overlay state for one peer group: no async, no network.
///
/// Every `handle_*` / `tick_*` method returns `Vec<RuntimeEffect>`.
pub struct RuntimeState {
    group: String,
    local: PeerAdvertisement,
    config: RuntimeConfig,
    role: Role,
    disseminator: Disseminator,
    has_forwarder: bool,
    waiters: HashMap<PeerId, Vec<LeaseWaiter>>,
    closed: bool,
}

impl RuntimeState {
    pub fn new(config: RuntimeConfig, has_forwarder: bool) -> Self {
        let local = config.local.clone();
        let role = match config.role {
            PeerRole::Edge => Role::Edge(EdgeClient::new(local.clone(), config.edge.clone())),
            PeerRole::Rendezvous => {
                Role::Rendezvous(RendezvousServer::new(local.clone(), config.server.clone()))
            }
        };
        Self {
            group: config.group_id.clone(),
            disseminator: Disseminator::with_limits(
                local.peer_id,
                config.max_ttl,
                config.dedup_capacity,
            ),
            local,
            config,
            role,
            has_forwarder,
            waiters: HashMap::new(),
            closed: false,
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local.peer_id
    }

    pub fn role(&self) -> PeerRole {
        match self.role {
            Role::Edge(_) => PeerRole::Edge,
            Role::Rendezvous(_) => PeerRole::Rendezvous,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn monitor_interval(&self) -> Duration {
        self.config.edge.monitor_interval
    }

    pub fn gc_interval(&self) -> Duration {
        self.config.server.gc_interval
    }

    /// Whether this peer can reach the overlay. A rendezvous always can.
    pub fn is_connected(&self, now: u64) -> bool {
        match &self.role {
            Role::Edge(edge) => edge.is_connected(now),
            Role::Rendezvous(_) => true,
        }
    }

    /// Held rendezvous (edge) or admitted clients (rendezvous).
    pub fn connected_peers(&self, now: u64) -> Vec<PeerId> {
        match &self.role {
            Role::Edge(edge) => edge.connected_peers(now),
            Role::Rendezvous(server) => server.clients(now),
        }
    }

    fn advertisement_of(&self, peer: &PeerId) -> Option<PeerAdvertisement> {
        match &self.role {
            Role::Edge(edge) => edge.connection(peer).map(|c| c.advertisement().clone()),
            Role::Rendezvous(server) => server.client(peer).map(|c| c.advertisement().clone()),
        }
    }

    fn frame(&self, body: OverlayMessage) -> Frame {
        Frame::new(self.group.clone(), self.local.peer_id, body)
    }

    fn lease_effects(&mut self, actions: Vec<LeaseAction>) -> Vec<RuntimeEffect> {
        let mut effects = Vec::with_capacity(actions.len());
        for action in actions {
            let effect = match action {
                LeaseAction::Send { to, message } => RuntimeEffect::SendTo {
                    to,
                    frame: self.frame(message),
                },
                LeaseAction::Emit(event) => RuntimeEffect::Emit(event),
                LeaseAction::ReportFailure(peer) => RuntimeEffect::ReportFailure(peer),
                LeaseAction::Publish {
                    advertisement,
                    lifetime_ms,
                    expiration_ms,
                } => RuntimeEffect::Publish {
                    advertisement,
                    lifetime_ms,
                    expiration_ms,
                },
                LeaseAction::Abandon(peer) => {
                    self.resolve_waiters(peer, Err(RdvError::Timeout { peer }));
                    RuntimeEffect::Forget(peer)
                }
                LeaseAction::Release(peer) => RuntimeEffect::Forget(peer),
            };
            effects.push(effect);
        }
        effects
    }

    // ── Scheduling ───────────────────────────────────────────────────────

    /// Effects due when the instance starts: a rendezvous announces itself.
    pub fn start(&mut self) -> Vec<RuntimeEffect> {
        let actions = match &self.role {
            Role::Rendezvous(server) => server.start(),
            Role::Edge(_) => return vec![],
        };
        self.lease_effects(actions)
    }

    /// Delay before the first edge monitor tick; `None` on a rendezvous.
    pub fn start_monitor(&mut self, view: &[PeerAdvertisement]) -> Option<Duration> {
        match &mut self.role {
            Role::Edge(edge) if !self.closed => Some(edge.start(view)),
            _ => None,
        }
    }

    pub fn tick_monitor<R: Rng + ?Sized>(
        &mut self,
        view: &[PeerAdvertisement],
        now: u64,
        rng: &mut R,
    ) -> Vec<RuntimeEffect> {
        let actions = match &mut self.role {
            Role::Edge(edge) if !self.closed => edge.monitor_tick(view, now, rng),
            _ => return vec![],
        };
        // Callers that stopped waiting leave closed senders behind.
        self.waiters.retain(|_, waiters| {
            waiters.retain(|w| !w.is_closed());
            !waiters.is_empty()
        });
        self.lease_effects(actions)
    }

    pub fn tick_gc(&mut self, now: u64) -> Vec<RuntimeEffect> {
        let actions = match &mut self.role {
            Role::Rendezvous(server) if !self.closed => server.gc_tick(now),
            _ => return vec![],
        };
        self.lease_effects(actions)
    }

    /// Returns effects plus an optional monitor reschedule delay.
    pub fn handle_view_event(
        &mut self,
        event: ViewEvent,
        now: u64,
    ) -> (Vec<RuntimeEffect>, Option<Duration>) {
        let Role::Edge(edge) = &mut self.role else {
            return (vec![], None);
        };
        if self.closed {
            return (vec![], None);
        }
        match event {
            ViewEvent::Added(candidate) => (vec![], edge.on_candidate_added(&candidate, now)),
            ViewEvent::Removed(peer) | ViewEvent::Failed(peer) => {
                let actions = edge.on_candidate_removed(peer);
                (self.lease_effects(actions), None)
            }
        }
    }

    // ── Inbound frames ───────────────────────────────────────────────────

    pub fn handle_inbound(
        &mut self,
        data: &[u8],
        path: InboundPath,
        now: u64,
    ) -> Vec<RuntimeEffect> {
        if self.closed {
            return vec![];
        }
        let frame = match Frame::from_bytes(data) {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!("dropping undecodable frame: {e}");
                return vec![];
            }
        };
        if frame.group != self.group {
            tracing::trace!("frame for group {} ignored by {}", frame.group, self.group);
            return vec![];
        }
        if frame.from == self.local.peer_id {
            return vec![];
        }

        let from = frame.from;
        match frame.body {
            OverlayMessage::ConnectRequest { advertisement, .. } => {
                if advertisement.peer_id != from {
                    tracing::debug!("connect request from {from} carries foreign advertisement");
                    return vec![];
                }
                match &mut self.role {
                    Role::Rendezvous(server) => {
                        let actions = server.on_lease_request(advertisement, now);
                        self.lease_effects(actions)
                    }
                    Role::Edge(_) => {
                        tracing::debug!("edge ignoring connect request from {from}");
                        vec![]
                    }
                }
            }
            OverlayMessage::ConnectedReply {
                advertisement,
                peer_id,
                lease_ms,
            } => self.handle_connected_reply(from, advertisement, peer_id, lease_ms, now),
            OverlayMessage::DisconnectRequest { advertisement } => {
                if advertisement.peer_id != from {
                    tracing::debug!("disconnect request from {from} carries foreign advertisement");
                    return vec![];
                }
                let actions = match &mut self.role {
                    Role::Edge(edge) => edge.on_remote_disconnect(from),
                    Role::Rendezvous(server) => server.on_disconnect_request(from),
                };
                self.lease_effects(actions)
            }
            OverlayMessage::Propagate {
                header,
                service,
                payload,
            } => self.handle_incoming_propagate(from, path, header, service, payload, now),
            OverlayMessage::Walk {
                header,
                destination,
                targets,
                payload,
            } => self.handle_incoming_walk(from, header, destination, targets, payload),
        }
    }

    fn handle_connected_reply(
        &mut self,
        from: PeerId,
        advertisement: Option<PeerAdvertisement>,
        peer_id: Option<PeerId>,
        lease_ms: Option<i64>,
        now: u64,
    ) -> Vec<RuntimeEffect> {
        let Role::Edge(edge) = &mut self.role else {
            tracing::debug!("rendezvous ignoring connected reply from {from}");
            return vec![];
        };
        if peer_id.is_some_and(|id| id != from) {
            tracing::debug!("connected reply relayed by {from} for another granter, dropped");
            return vec![];
        }
        let actions = edge.on_connected_reply(advertisement, peer_id, lease_ms, now);

        let outcome = if edge.connection(&from).is_some_and(|c| c.is_live(now)) {
            Some(Ok(()))
        } else if !edge.is_pending(&from) {
            Some(Err(RdvError::LeaseDenied { peer: from }))
        } else {
            None
        };
        if let Some(outcome) = outcome {
            self.resolve_waiters(from, outcome);
        }
        self.lease_effects(actions)
    }

    fn handle_incoming_propagate(
        &mut self,
        from: PeerId,
        path: InboundPath,
        header: PropagationHeader,
        service: ServiceAddress,
        payload: Vec<u8>,
        now: u64,
    ) -> Vec<RuntimeEffect> {
        if self.disseminator.admit(&header) == Admission::Duplicate {
            tracing::debug!("duplicate propagate {} from {from}", header.message_id);
            return vec![];
        }

        let mut effects = vec![RuntimeEffect::Deliver(DeliveredMessage {
            message_id: header.message_id.clone(),
            origin: header.origin().unwrap_or(from),
            from,
            service: service.clone(),
            payload: payload.clone(),
            walked: false,
        })];

        let Role::Rendezvous(server) = &self.role else {
            return effects;
        };
        let ttl = header.ttl;
        let mut msg = Message {
            header: Some(header),
            payload,
        };
        let plan = match path {
            InboundPath::Broadcast => self.disseminator.repropagate(&mut msg, PeerRole::Rendezvous),
            InboundPath::Direct => {
                let clients: Vec<PeerId> = server
                    .clients(now)
                    .into_iter()
                    .filter(|c| *c != from)
                    .collect();
                self.disseminator
                    .propagate_in_group(&mut msg, ttl, PeerRole::Rendezvous, &clients)
            }
        };
        if let Some(plan) = plan {
            let body = OverlayMessage::Propagate {
                header: plan.header.clone(),
                service,
                payload: msg.payload,
            };
            effects.extend(self.plan_effects(plan, body));
        }
        effects
    }

    fn handle_incoming_walk(
        &mut self,
        from: PeerId,
        header: PropagationHeader,
        destination: ServiceAddress,
        targets: Vec<PeerId>,
        payload: Vec<u8>,
    ) -> Vec<RuntimeEffect> {
        if self.disseminator.admit(&header) == Admission::Duplicate {
            tracing::debug!("duplicate walk {} from {from}", header.message_id);
            return vec![];
        }

        let local = self.local.peer_id;
        let mut effects = Vec::new();
        if targets.is_empty() || targets.contains(&local) {
            effects.push(RuntimeEffect::Deliver(DeliveredMessage {
                message_id: header.message_id.clone(),
                origin: header.origin().unwrap_or(from),
                from,
                service: destination.clone(),
                payload: payload.clone(),
                walked: true,
            }));
        }

        if !matches!(self.role, Role::Rendezvous(_)) {
            return effects;
        }
        let remaining: Vec<PeerId> = targets
            .iter()
            .copied()
            .filter(|t| *t != local && !header.path.contains(t))
            .collect();
        if !targets.is_empty() && remaining.is_empty() {
            return effects;
        }

        let ttl = header.ttl;
        let mut msg = Message {
            header: Some(header),
            payload,
        };
        let Some(plan) =
            self.disseminator
                .propagate_in_group(&mut msg, ttl, PeerRole::Rendezvous, &[])
        else {
            return effects;
        };
        let frame = self.frame(OverlayMessage::Walk {
            header: plan.header.clone(),
            destination,
            targets,
            payload: msg.payload,
        });
        effects.extend(walk_effects(frame, &remaining, plan.header.ttl));
        effects
    }

    /// Turn an egress plan into sends.
    fn plan_effects(&self, plan: Plan, body: OverlayMessage) -> Vec<RuntimeEffect> {
        let ttl = plan.header.ttl;
        let frame = self.frame(body);
        let mut effects = Vec::with_capacity(plan.egress.len());
        for egress in plan.egress {
            match egress {
                Egress::Direct(peer) => match self.advertisement_of(&peer) {
                    Some(to) => effects.push(RuntimeEffect::SendTo {
                        to,
                        frame: frame.clone(),
                    }),
                    None => tracing::debug!("no advertisement for direct peer {peer}"),
                },
                Egress::SubnetBroadcast => effects.push(RuntimeEffect::Broadcast(frame.clone())),
                Egress::Walker if self.has_forwarder => effects.push(RuntimeEffect::Walk {
                    dest: None,
                    frame: frame.clone(),
                    ttl,
                }),
                Egress::Walker => {}
            }
        }
        effects
    }

    // ── Commands ─────────────────────────────────────────────────────────

    /// Ask `candidate` for a lease; `waiter` is answered when the outcome is known.
    pub fn request_lease(
        &mut self,
        candidate: PeerAdvertisement,
        waiter: Option<LeaseWaiter>,
        now: u64,
    ) -> Vec<RuntimeEffect> {
        let reject = |waiter: Option<LeaseWaiter>, err: RdvError| {
            if let Some(w) = waiter {
                let _ = w.send(Err(err));
            }
            vec![]
        };
        if self.closed {
            return reject(waiter, RdvError::Shutdown);
        }
        let Role::Edge(edge) = &mut self.role else {
            return reject(waiter, RdvError::NotEdge);
        };
        let peer = candidate.peer_id;
        let action = edge.request_lease(candidate, now);
        if let Some(w) = waiter {
            let waiters = self.waiters.entry(peer).or_default();
            waiters.retain(|slot| !slot.is_closed());
            waiters.push(w);
        }
        self.lease_effects(vec![action])
    }

    /// End the lease with `peer`. Fails if nothing is held or pending with it.
    pub fn disconnect(&mut self, peer: PeerId) -> Result<Vec<RuntimeEffect>, RdvError> {
        let actions = match &mut self.role {
            Role::Edge(edge) => edge.disconnect(peer),
            Role::Rendezvous(server) => server.disconnect_client(peer),
        };
        if actions.is_empty() {
            return Err(RdvError::NotConnected { peer });
        }
        Ok(self.lease_effects(actions))
    }

    pub fn challenge(&mut self, peer: PeerId, delay_ms: i64, now: u64) -> Vec<RuntimeEffect> {
        let actions = match &mut self.role {
            Role::Edge(edge) => edge.challenge(peer, delay_ms, now),
            Role::Rendezvous(_) => return vec![],
        };
        self.lease_effects(actions)
    }

    /// Flood `msg`; stamps its header on first send. Declined sends are silent.
    pub fn propagate(
        &mut self,
        msg: &mut Message,
        service: ServiceAddress,
        ttl: u32,
        in_group: bool,
        now: u64,
    ) -> Vec<RuntimeEffect> {
        if self.closed {
            return vec![];
        }
        let role = self.role();
        let direct = self.connected_peers(now);
        let plan = if in_group {
            self.disseminator.propagate_in_group(msg, ttl, role, &direct)
        } else {
            self.disseminator.propagate(msg, ttl, role, &direct)
        };
        let Some(plan) = plan else {
            tracing::debug!("propagate declined: duplicate id or ttl exhausted");
            return vec![];
        };
        let body = OverlayMessage::Propagate {
            header: plan.header.clone(),
            service,
            payload: msg.payload.clone(),
        };
        self.plan_effects(plan, body)
    }

    /// Walk `msg` to every rendezvous (`targets` empty) or to the listed peers.
    pub fn walk(
        &mut self,
        msg: &mut Message,
        destination: ServiceAddress,
        targets: Vec<PeerId>,
        ttl: u32,
        now: u64,
    ) -> Result<Vec<RuntimeEffect>, RdvError> {
        if self.closed {
            return Err(RdvError::Shutdown);
        }
        match self.role() {
            PeerRole::Rendezvous => {
                if !self.has_forwarder {
                    return Err(RdvError::NoForwarder);
                }
                let Some(plan) =
                    self.disseminator
                        .propagate_in_group(msg, ttl, PeerRole::Rendezvous, &[])
                else {
                    return Ok(vec![]);
                };
                let frame = self.frame(OverlayMessage::Walk {
                    header: plan.header.clone(),
                    destination,
                    targets: targets.clone(),
                    payload: msg.payload.clone(),
                });
                Ok(walk_effects(frame, &targets, plan.header.ttl))
            }
            PeerRole::Edge => {
                // Edges hand the walk to their rendezvous, which continue it.
                let rendezvous = self.connected_peers(now);
                if rendezvous.is_empty() {
                    return Err(RdvError::NoRoute);
                }
                let Some(plan) =
                    self.disseminator
                        .propagate_in_group(msg, ttl, PeerRole::Edge, &rendezvous)
                else {
                    return Ok(vec![]);
                };
                let body = OverlayMessage::Walk {
                    header: plan.header.clone(),
                    destination,
                    targets,
                    payload: msg.payload.clone(),
                };
                Ok(self.plan_effects(plan, body))
            }
        }
    }

    pub fn set_local_advertisement(&mut self, advertisement: PeerAdvertisement) {
        self.local = advertisement.clone();
        match &mut self.role {
            Role::Edge(edge) => edge.set_local_advertisement(advertisement),
            Role::Rendezvous(server) => server.set_local_advertisement(advertisement),
        }
    }

    /// A transport send to `peer` failed.
    pub fn on_send_failed(&mut self, peer: PeerId, reason: &str) {
        match &mut self.role {
            Role::Edge(edge) => {
                let dropped = edge.on_send_failed(peer);
                if dropped || edge.connection(&peer).is_none() {
                    self.resolve_waiters(
                        peer,
                        Err(RdvError::Transport {
                            peer,
                            reason: reason.to_string(),
                        }),
                    );
                }
            }
            Role::Rendezvous(server) => server.on_send_failed(peer),
        }
    }

    fn resolve_waiters(&mut self, peer: PeerId, outcome: Result<(), RdvError>) {
        let Some(waiters) = self.waiters.remove(&peer) else {
            return;
        };
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    fn fail_all_waiters(&mut self, err: RdvError) {
        for (_, waiters) in self.waiters.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(err.clone()));
            }
        }
    }

    // ── Role switching ───────────────────────────────────────────────────

    pub fn become_rendezvous(&mut self) -> Vec<RuntimeEffect> {
        let Role::Edge(edge) = &mut self.role else {
            return vec![];
        };
        let mut actions = edge.shutdown();
        self.fail_all_waiters(RdvError::NotEdge);

        let server = RendezvousServer::new(self.local.clone(), self.config.server.clone());
        actions.extend(server.start());
        self.role = Role::Rendezvous(server);
        tracing::info!("{} became rendezvous for group {}", self.local.peer_id, self.group);

        let mut effects = self.lease_effects(actions);
        effects.push(RuntimeEffect::Emit(RendezvousEvent::new(
            EventKind::BecameRendezvous,
            self.local.peer_id,
        )));
        effects
    }

    pub fn become_edge(&mut self) -> Vec<RuntimeEffect> {
        let Role::Rendezvous(server) = &mut self.role else {
            return vec![];
        };
        let actions = server.shutdown();
        self.role = Role::Edge(EdgeClient::new(self.local.clone(), self.config.edge.clone()));
        tracing::info!("{} became edge for group {}", self.local.peer_id, self.group);

        let mut effects = self.lease_effects(actions);
        effects.push(RuntimeEffect::Emit(RendezvousEvent::new(
            EventKind::BecameEdge,
            self.local.peer_id,
        )));
        effects
    }

    /// Disconnect everything; later ticks and frames are ignored.
    pub fn shutdown(&mut self) -> Vec<RuntimeEffect> {
        if self.closed {
            return vec![];
        }
        let actions = match &mut self.role {
            Role::Edge(edge) => edge.shutdown(),
            Role::Rendezvous(server) => server.shutdown(),
        };
        self.closed = true;
        self.fail_all_waiters(RdvError::Shutdown);
        self.lease_effects(actions)
    }
}

/// One forwarder send per target, or a single flood when there are none.
fn walk_effects(frame: Frame, targets: &[PeerId], ttl: u32) -> Vec<RuntimeEffect> {
    if targets.is_empty() {
        return vec![RuntimeEffect::Walk {
            dest: None,
            frame,
            ttl,
        }];
    }
    targets
        .iter()
        .map(|t| RuntimeEffect::Walk {
            dest: Some(*t),
            frame: frame.clone(),
            ttl,
        })
        .collect()
}
