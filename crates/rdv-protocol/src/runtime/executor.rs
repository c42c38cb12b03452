//! Effect executor, the only place that touches I/O.
//!
//! Takes a list of RuntimeEffect and executes them concretely:
//! - SendTo -> cached transport connection, send on the rendezvous service
//! - Broadcast -> transport.broadcast()
//! - Walk -> walk forwarder
//! - Deliver -> delivery channel (try_send)
//! - Emit -> listeners, synchronously
//! - ReportFailure / Publish -> peer view / advertisement store
//! - Forget -> drop the cached connection
//!
//! Nothing here fails the caller: failures are logged and returned in a
//! [`Report`] so the state can react on the next step.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::collab::{Collaborators, Connection};
use crate::error::RdvError;
use crate::events::EventNotifier;
use crate::message::Frame;
use crate::types::{PeerAdvertisement, PeerId, ServiceAddress};

use super::effect::RuntimeEffect;
use super::DeliveredMessage;

/// What went wrong while executing a batch.
#[derive(Debug, Default)]
pub(super) struct Report {
    pub failed_sends: Vec<(PeerId, String)>,
    pub walk_errors: Vec<RdvError>,
}

pub(super) struct Executor {
    group: String,
    collab: Collaborators,
    connections: HashMap<PeerId, Arc<dyn Connection>>,
    deliver_tx: mpsc::Sender<DeliveredMessage>,
}

impl Executor {
    pub fn new(
        group: String,
        collab: Collaborators,
        deliver_tx: mpsc::Sender<DeliveredMessage>,
    ) -> Self {
        Self {
            group,
            collab,
            connections: HashMap::new(),
            deliver_tx,
        }
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collab
    }

    /// Peers with a cached connection.
    #[cfg(test)]
    pub fn cached_connections(&self) -> usize {
        self.connections.len()
    }

    pub async fn execute(
        &mut self,
        effects: Vec<RuntimeEffect>,
        notifier: &EventNotifier,
    ) -> Report {
        let mut report = Report::default();
        for effect in effects {
            match effect {
                RuntimeEffect::SendTo { to, frame } => {
                    if let Err(e) = self.send_to(&to, &frame).await {
                        tracing::warn!("{} to {} failed: {e}", frame.body.kind(), to.peer_id);
                        report.failed_sends.push((to.peer_id, e.to_string()));
                    }
                }
                RuntimeEffect::Broadcast(frame) => {
                    let service = ServiceAddress::propagate(&self.group);
                    let sent = match frame.to_bytes() {
                        Ok(bytes) => self.collab.transport.broadcast(&bytes, &service).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = sent {
                        tracing::warn!("subnet broadcast failed: {e}");
                    }
                }
                RuntimeEffect::Walk { dest, frame, ttl } => {
                    if let Err(e) = self.walk(dest, &frame, ttl).await {
                        match dest {
                            Some(peer) => tracing::warn!("walk to {peer} failed: {e}"),
                            None => tracing::warn!("walk failed: {e}"),
                        }
                        report.walk_errors.push(e);
                    }
                }
                RuntimeEffect::Deliver(msg) => {
                    // try_send: never block the runtime on a slow consumer.
                    if self.deliver_tx.try_send(msg).is_err() {
                        tracing::debug!("delivery channel full or closed, message dropped");
                    }
                }
                RuntimeEffect::Emit(event) => notifier.notify(&event),
                RuntimeEffect::ReportFailure(peer) => {
                    self.collab.view.report_failure(peer, true);
                }
                RuntimeEffect::Publish {
                    advertisement,
                    lifetime_ms,
                    expiration_ms,
                } => {
                    if let Err(e) = self
                        .collab
                        .store
                        .publish(&advertisement, lifetime_ms, expiration_ms)
                        .await
                    {
                        tracing::warn!("publishing {} failed: {e}", advertisement.peer_id);
                    }
                }
                RuntimeEffect::Forget(peer) => {
                    if self.connections.remove(&peer).is_some() {
                        tracing::trace!("dropped cached connection to {peer}");
                    }
                }
            }
        }
        report
    }

    async fn send_to(&mut self, to: &PeerAdvertisement, frame: &Frame) -> Result<(), RdvError> {
        let bytes = frame.to_bytes()?;
        let peer = to.peer_id;
        let conn = self
            .connection(to)
            .await
            .ok_or_else(|| RdvError::Transport {
                peer,
                reason: "no connection".into(),
            })?;
        let result = conn.send(&bytes, &ServiceAddress::rendezvous(&self.group)).await;
        if result.is_err() {
            self.connections.remove(&peer);
        }
        result
    }

    /// Cached connection to `to`, reopened when the cached one closed.
    async fn connection(&mut self, to: &PeerAdvertisement) -> Option<Arc<dyn Connection>> {
        let peer = to.peer_id;
        if let Some(conn) = self.connections.get(&peer) {
            if !conn.is_closed() {
                return Some(conn.clone());
            }
            self.connections.remove(&peer);
        }
        let conn = self
            .collab
            .transport
            .connection(peer, to.route_hint())
            .await?;
        self.connections.insert(peer, conn.clone());
        Some(conn)
    }

    async fn walk(&self, dest: Option<PeerId>, frame: &Frame, ttl: u32) -> Result<(), RdvError> {
        let forwarder = self.collab.forwarder.as_ref().ok_or(RdvError::NoForwarder)?;
        let bytes = frame.to_bytes()?;
        forwarder
            .send(dest, &bytes, &ServiceAddress::walk(&self.group), ttl, None)
            .await
    }
}
