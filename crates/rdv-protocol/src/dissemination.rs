/// Dissemination engine: decides where a propagated message goes.
///
/// Pure decision logic. Stamps or continues the propagation header,
/// enforces the loop guard (each message id leaves a peer at most once per
/// egress set) and returns the egress plan. No I/O.
use std::num::NonZeroUsize;

use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::types::{PeerId, PeerRole, MAX_TTL};

/// Number of message ids remembered for loop avoidance.
pub const DEDUP_CAPACITY: usize = 10_000;

/// Carried by every propagated or walked message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagationHeader {
    /// Stamped once at origin (UUID v4), never changed by later hops.
    pub message_id: String,
    /// Remaining hops.
    pub ttl: u32,
    /// Peers that have forwarded this message, origin first.
    pub path: Vec<PeerId>,
}

impl PropagationHeader {
    fn fresh(origin: PeerId, ttl: u32) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            ttl,
            path: vec![origin],
        }
    }

    pub fn origin(&self) -> Option<PeerId> {
        self.path.first().copied()
    }
}

/// Application message as seen by the dissemination layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Option<PropagationHeader>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            header: None,
            payload: payload.into(),
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        self.header.as_ref().map(|h| h.message_id.as_str())
    }
}

/// One way out of this peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Egress {
    /// A peer we hold a lease with (edge) or that holds one with us (rendezvous).
    Direct(PeerId),
    /// Local-subnet broadcast.
    SubnetBroadcast,
    /// The multi-hop walk forwarder (rendezvous only).
    Walker,
}

/// Which send path is asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Direct connections plus every network path.
    Propagate,
    /// Direct connections plus the walker; never the subnet.
    InGroup,
    /// Network path only, TTL re-stamped to the maximum.
    Repropagate,
}

/// Result of a successful decision: the header to send and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub header: PropagationHeader,
    pub egress: Vec<Egress>,
}

/// What has already left this peer for a given message id.
#[derive(Debug, Clone, Copy, Default)]
struct Forwarded {
    direct: bool,
    network: bool,
}

/// Incoming-message dedup verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First time seen: deliver locally.
    Fresh,
    /// Seen before (or our own message looping back): drop.
    Duplicate,
}

pub struct Disseminator {
    local_id: PeerId,
    max_ttl: u32,
    seen: LruCache<String, Forwarded>,
}

impl Disseminator {
    pub fn new(local_id: PeerId) -> Self {
        Self::with_limits(local_id, MAX_TTL, DEDUP_CAPACITY)
    }

    pub fn with_limits(local_id: PeerId, max_ttl: u32, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            local_id,
            max_ttl: max_ttl.max(1),
            seen: LruCache::new(capacity),
        }
    }

    pub fn max_ttl(&self) -> u32 {
        self.max_ttl
    }

    /// Record an incoming header. Duplicates are dropped by the caller.
    pub fn admit(&mut self, header: &PropagationHeader) -> Admission {
        if self.seen.contains(&header.message_id) || header.path.contains(&self.local_id) {
            return Admission::Duplicate;
        }
        self.seen.put(header.message_id.clone(), Forwarded::default());
        Admission::Fresh
    }

    /// Flood to direct connections and the network.
    pub fn propagate(
        &mut self,
        msg: &mut Message,
        ttl: u32,
        role: PeerRole,
        direct: &[PeerId],
    ) -> Option<Plan> {
        self.plan(msg, ttl, role, direct, Scope::Propagate)
    }

    /// Same as [`propagate`](Self::propagate) without the subnet broadcast.
    pub fn propagate_in_group(
        &mut self,
        msg: &mut Message,
        ttl: u32,
        role: PeerRole,
        direct: &[PeerId],
    ) -> Option<Plan> {
        self.plan(msg, ttl, role, direct, Scope::InGroup)
    }

    /// Re-send on the network path only, skipping direct connections.
    pub fn repropagate(&mut self, msg: &mut Message, role: PeerRole) -> Option<Plan> {
        let max = self.max_ttl;
        self.plan(msg, max, role, &[], Scope::Repropagate)
    }

    fn plan(
        &mut self,
        msg: &mut Message,
        ttl: u32,
        role: PeerRole,
        direct: &[PeerId],
        scope: Scope,
    ) -> Option<Plan> {
        let header = match (&msg.header, scope) {
            (None, Scope::Repropagate) => PropagationHeader::fresh(self.local_id, self.max_ttl),
            (None, _) => {
                let ttl = ttl.min(self.max_ttl);
                if ttl == 0 {
                    return None;
                }
                PropagationHeader::fresh(self.local_id, ttl)
            }
            (Some(existing), _) => self.continue_header(existing, ttl, scope)?,
        };

        let mut egress = Vec::new();
        if scope != Scope::Repropagate {
            egress.extend(direct.iter().copied().map(Egress::Direct));
        }
        if role == PeerRole::Rendezvous {
            egress.push(Egress::Walker);
        }
        if scope != Scope::InGroup {
            egress.push(Egress::SubnetBroadcast);
        }

        let uses_network = egress
            .iter()
            .any(|e| matches!(e, Egress::Walker | Egress::SubnetBroadcast));
        let mut entry = self
            .seen
            .peek(&header.message_id)
            .copied()
            .unwrap_or_default();
        if scope != Scope::Repropagate {
            entry.direct = true;
        }
        if uses_network {
            entry.network = true;
        }
        self.seen.put(header.message_id.clone(), entry);

        msg.header = Some(header.clone());
        Some(Plan { header, egress })
    }

    /// Continue an existing header, or decline (`None`).
    fn continue_header(
        &self,
        existing: &PropagationHeader,
        ttl: u32,
        scope: Scope,
    ) -> Option<PropagationHeader> {
        let forwarded = self.seen.peek(&existing.message_id).copied().unwrap_or_default();
        let already = match scope {
            Scope::Repropagate => forwarded.network,
            _ => forwarded.direct || forwarded.network,
        };
        if already {
            return None;
        }

        let mut header = existing.clone();
        if scope == Scope::Repropagate {
            header.ttl = self.max_ttl;
        } else {
            // Taking a hop through us costs one.
            let hop_cost = u32::from(!existing.path.contains(&self.local_id));
            header.ttl = existing
                .ttl
                .min(ttl)
                .min(self.max_ttl)
                .saturating_sub(hop_cost);
            if header.ttl == 0 {
                return None;
            }
        }
        if !header.path.contains(&self.local_id) {
            header.path.push(self.local_id);
        }
        Some(header)
    }
}
