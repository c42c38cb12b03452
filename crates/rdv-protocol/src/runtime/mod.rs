/// Overlay runtime: one actor task per peer group.
///
/// The task owns the edge or rendezvous state, the dissemination engine
/// and the listener list. The application talks to it through a cheap,
/// cloneable [`RuntimeHandle`]; inbound transport frames arrive on an
/// `mpsc` channel and candidate-view changes on a broadcast subscription.
mod effect;
mod executor;
mod r#loop;
mod state;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::collab::{Collaborators, InboundFrame};
use crate::dissemination::{Message, PropagationHeader, DEDUP_CAPACITY};
use crate::edge::EdgeConfig;
use crate::error::RdvError;
use crate::events::{EventListener, ListenerId};
use crate::server::ServerConfig;
use crate::types::{PeerAdvertisement, PeerId, PeerRole, ServiceAddress, MAX_TTL};

pub use effect::RuntimeEffect;
pub use state::RuntimeState;

use state::LeaseWaiter;

// ── Configuration ─────────────────────────────────────────────────────

/// Configuration for one overlay instance.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Peer group this instance serves; frames for other groups are dropped.
    pub group_id: String,
    /// Our own advertisement.
    pub local: PeerAdvertisement,
    /// Role at start-up; can be switched later.
    pub role: PeerRole,
    pub edge: EdgeConfig,
    pub server: ServerConfig,
    /// Hop bound for propagate and walk.
    pub max_ttl: u32,
    /// Message ids remembered for loop avoidance.
    pub dedup_capacity: usize,
    /// First wait for a lease reply in `connect_to_rendezvous`.
    pub connect_wait: Duration,
    /// Wait after the single re-send.
    pub connect_retry_wait: Duration,
    /// Capacity of the command and delivery channels.
    pub channel_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            group_id: "default".to_string(),
            local: PeerAdvertisement::new(PeerId::random(), "anonymous"),
            role: PeerRole::Edge,
            edge: EdgeConfig::default(),
            server: ServerConfig::default(),
            max_ttl: MAX_TTL,
            dedup_capacity: DEDUP_CAPACITY,
            connect_wait: Duration::from_secs(5),
            connect_retry_wait: Duration::from_secs(15),
            channel_capacity: 256,
        }
    }
}

// ── Commands (app → runtime) ──────────────────────────────────────────

type HeaderReply = oneshot::Sender<Result<Option<PropagationHeader>, RdvError>>;

pub(crate) enum RuntimeCommand {
    RequestLease {
        advertisement: PeerAdvertisement,
        reply: Option<LeaseWaiter>,
    },
    ResolvePeer {
        peer: PeerId,
        reply: oneshot::Sender<Option<PeerAdvertisement>>,
    },
    Disconnect {
        peer: PeerId,
        reply: oneshot::Sender<Result<(), RdvError>>,
    },
    Propagate {
        message: Message,
        service: ServiceAddress,
        ttl: u32,
        in_group: bool,
        reply: HeaderReply,
    },
    Walk {
        message: Message,
        destination: ServiceAddress,
        targets: Vec<PeerId>,
        ttl: u32,
        reply: HeaderReply,
    },
    IsConnected {
        reply: oneshot::Sender<bool>,
    },
    ConnectedPeers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    Role {
        reply: oneshot::Sender<PeerRole>,
    },
    AddListener {
        listener: Arc<dyn EventListener>,
        reply: oneshot::Sender<ListenerId>,
    },
    RemoveListener {
        id: ListenerId,
        reply: oneshot::Sender<bool>,
    },
    Challenge {
        peer: PeerId,
        delay_ms: i64,
    },
    SetLocalAdvertisement {
        advertisement: PeerAdvertisement,
    },
    BecomeRendezvous,
    BecomeEdge,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// ── Events (runtime → app) ───────────────────────────────────────────

/// A propagated or walked payload that reached this peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    pub message_id: String,
    /// Peer that first sent the message.
    pub origin: PeerId,
    /// Previous hop.
    pub from: PeerId,
    /// Target service the payload was addressed to.
    pub service: ServiceAddress,
    pub payload: Vec<u8>,
    /// Arrived through the walk forwarder rather than a flood.
    pub walked: bool,
}

// ── RuntimeHandle (app-facing API) ───────────────────────────────────

/// Handle to a running overlay instance.
///
/// Cheap to clone. Once the runtime has shut down every call fails with
/// [`RdvError::Shutdown`] (queries return empty defaults).
#[derive(Clone)]
pub struct RuntimeHandle {
    cmd_tx: mpsc::Sender<RuntimeCommand>,
    local_id: PeerId,
    group_id: String,
    connect_wait: Duration,
    connect_retry_wait: Duration,
}

impl RuntimeHandle {
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    async fn send(&self, cmd: RuntimeCommand) -> Result<(), RdvError> {
        self.cmd_tx.send(cmd).await.map_err(|_| RdvError::Shutdown)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RuntimeCommand,
    ) -> Result<T, RdvError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| RdvError::Shutdown)
    }

    /// Request a lease and wait for the answer.
    ///
    /// Waits `connect_wait`, re-sends once, then waits `connect_retry_wait`
    /// before giving up with [`RdvError::Timeout`].
    pub async fn connect_to_rendezvous(
        &self,
        advertisement: PeerAdvertisement,
    ) -> Result<(), RdvError> {
        let peer = advertisement.peer_id;
        for wait in [self.connect_wait, self.connect_retry_wait] {
            let (tx, rx) = oneshot::channel();
            self.send(RuntimeCommand::RequestLease {
                advertisement: advertisement.clone(),
                reply: Some(tx),
            })
            .await?;
            match tokio::time::timeout(wait, rx).await {
                Ok(Ok(outcome)) => return outcome,
                Ok(Err(_)) => return Err(RdvError::Shutdown),
                Err(_) => tracing::debug!("no lease reply from {peer} within {wait:?}"),
            }
        }
        Err(RdvError::Timeout { peer })
    }

    /// Like [`connect_to_rendezvous`](Self::connect_to_rendezvous), resolving
    /// the advertisement from the local advertisement store.
    pub async fn connect_to_rendezvous_id(&self, peer: PeerId) -> Result<(), RdvError> {
        let advertisement = self
            .request(|reply| RuntimeCommand::ResolvePeer { peer, reply })
            .await?
            .ok_or_else(|| RdvError::UnknownPeer(peer.to_string()))?;
        self.connect_to_rendezvous(advertisement).await
    }

    /// End the lease with a rendezvous (edge) or with a client (rendezvous).
    ///
    /// Fails with [`RdvError::NotConnected`] when no lease is held with `peer`.
    pub async fn disconnect_from_rendezvous(&self, peer: PeerId) -> Result<(), RdvError> {
        self.request(|reply| RuntimeCommand::Disconnect { peer, reply })
            .await?
    }

    /// Flood `message` to direct connections and the network.
    ///
    /// The header is stamped into `message` on first send; propagating the
    /// same message again from this peer is a no-op.
    pub async fn propagate(
        &self,
        message: &mut Message,
        service: ServiceAddress,
        ttl: u32,
    ) -> Result<(), RdvError> {
        self.propagate_scoped(message, service, ttl, false).await
    }

    /// Like [`propagate`](Self::propagate) but never on the local subnet.
    pub async fn propagate_in_group(
        &self,
        message: &mut Message,
        service: ServiceAddress,
        ttl: u32,
    ) -> Result<(), RdvError> {
        self.propagate_scoped(message, service, ttl, true).await
    }

    async fn propagate_scoped(
        &self,
        message: &mut Message,
        service: ServiceAddress,
        ttl: u32,
        in_group: bool,
    ) -> Result<(), RdvError> {
        let header = self
            .request(|reply| RuntimeCommand::Propagate {
                message: message.clone(),
                service,
                ttl,
                in_group,
                reply,
            })
            .await??;
        message.header = header;
        Ok(())
    }

    /// Walk `message` to every reachable rendezvous within `ttl` hops.
    ///
    /// Fails with [`RdvError::NoForwarder`] on a rendezvous without a
    /// forwarder and [`RdvError::NoRoute`] on an unconnected edge.
    pub async fn walk(
        &self,
        message: &mut Message,
        destination: ServiceAddress,
        ttl: u32,
    ) -> Result<(), RdvError> {
        self.walk_to(Vec::new(), message, destination, ttl).await
    }

    /// Walk `message` to specific peers. A failure towards one target is
    /// logged and does not stop the others.
    pub async fn walk_to(
        &self,
        targets: Vec<PeerId>,
        message: &mut Message,
        destination: ServiceAddress,
        ttl: u32,
    ) -> Result<(), RdvError> {
        let header = self
            .request(|reply| RuntimeCommand::Walk {
                message: message.clone(),
                destination,
                targets,
                ttl,
                reply,
            })
            .await??;
        message.header = header;
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.request(|reply| RuntimeCommand::IsConnected { reply })
            .await
            .unwrap_or_default()
    }

    /// Held rendezvous on an edge, admitted clients on a rendezvous.
    pub async fn connected_peers(&self) -> Vec<PeerId> {
        self.request(|reply| RuntimeCommand::ConnectedPeers { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn role(&self) -> Result<PeerRole, RdvError> {
        self.request(|reply| RuntimeCommand::Role { reply }).await
    }

    pub async fn add_listener(
        &self,
        listener: Arc<dyn EventListener>,
    ) -> Result<ListenerId, RdvError> {
        self.request(|reply| RuntimeCommand::AddListener { listener, reply })
            .await
    }

    pub async fn remove_listener(&self, id: ListenerId) -> bool {
        self.request(|reply| RuntimeCommand::RemoveListener { id, reply })
            .await
            .unwrap_or(false)
    }

    /// Shrink the remaining lease with `peer` to `delay_ms`; `<= 0` drops it.
    pub async fn challenge(&self, peer: PeerId, delay_ms: i64) -> Result<(), RdvError> {
        self.send(RuntimeCommand::Challenge { peer, delay_ms }).await
    }

    /// Replace our advertisement; held leases are challenged and renewed.
    pub async fn set_local_advertisement(
        &self,
        advertisement: PeerAdvertisement,
    ) -> Result<(), RdvError> {
        self.send(RuntimeCommand::SetLocalAdvertisement { advertisement })
            .await
    }

    pub async fn become_rendezvous(&self) -> Result<(), RdvError> {
        self.send(RuntimeCommand::BecomeRendezvous).await
    }

    pub async fn become_edge(&self) -> Result<(), RdvError> {
        self.send(RuntimeCommand::BecomeEdge).await
    }

    /// Disconnect every lease, then stop the runtime.
    pub async fn shutdown(&self) {
        let _ = self.request(|reply| RuntimeCommand::Shutdown { reply }).await;
    }
}

// ── RuntimeChannels ──────────────────────────────────────────────────

/// Channels returned to the application when the runtime starts.
pub struct RuntimeChannels {
    pub handle: RuntimeHandle,
    /// Propagated and walked payloads addressed to this peer.
    pub messages: mpsc::Receiver<DeliveredMessage>,
}

// ── OverlayRuntime ───────────────────────────────────────────────────

/// The overlay runtime. Spawn it and communicate via channels.
pub struct OverlayRuntime;

impl OverlayRuntime {
    /// Start one overlay instance on the current tokio runtime.
    ///
    /// `inbound` carries every frame the transport receives for this peer.
    pub fn spawn(
        config: RuntimeConfig,
        collaborators: Collaborators,
        inbound: mpsc::Receiver<InboundFrame>,
    ) -> RuntimeChannels {
        let capacity = config.channel_capacity.max(1);
        let (cmd_tx, cmd_rx) = mpsc::channel::<RuntimeCommand>(capacity);
        let (msg_tx, msg_rx) = mpsc::channel::<DeliveredMessage>(capacity);

        let handle = RuntimeHandle {
            cmd_tx,
            local_id: config.local.peer_id,
            group_id: config.group_id.clone(),
            connect_wait: config.connect_wait,
            connect_retry_wait: config.connect_retry_wait,
        };

        tokio::spawn(r#loop::runtime_loop(
            config,
            collaborators,
            cmd_rx,
            inbound,
            msg_tx,
        ));

        RuntimeChannels {
            handle,
            messages: msg_rx,
        }
    }
}
