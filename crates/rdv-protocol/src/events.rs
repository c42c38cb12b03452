/// Lifecycle events and the listener registry that fans them out.
///
/// Listeners are called synchronously, in registration order, from the
/// task that owns the overlay state. They must not block.
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::types::PeerId;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    // ── Edge side (peer = rendezvous) ─────────────
    RdvConnect,
    RdvReconnect,
    /// Voluntary: we left, or the rendezvous told us it was leaving.
    RdvDisconnect,
    /// Detected: expiry, transport failure, denial, or view removal.
    RdvFailed,
    // ── Rendezvous side (peer = client) ───────────
    ClientConnect,
    ClientReconnect,
    ClientDisconnect,
    ClientFailed,
    // ── Role changes (peer = local) ───────────────
    BecameRendezvous,
    BecameEdge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RendezvousEvent {
    pub kind: EventKind,
    pub peer: PeerId,
}

impl RendezvousEvent {
    pub fn new(kind: EventKind, peer: PeerId) -> Self {
        Self { kind, peer }
    }
}

/// Receives lifecycle events.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &RendezvousEvent);
}

impl<F> EventListener for F
where
    F: Fn(&RendezvousEvent) + Send + Sync,
{
    fn on_event(&self, event: &RendezvousEvent) {
        self(event)
    }
}

impl EventListener for mpsc::Sender<RendezvousEvent> {
    fn on_event(&self, event: &RendezvousEvent) {
        // Never block the owning task; a slow consumer loses events.
        if self.try_send(event.clone()).is_err() {
            tracing::debug!("event listener full or closed, dropped {:?}", event.kind);
        }
    }
}

/// Handle returned by [`EventNotifier::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Ordered list of listeners.
#[derive(Default)]
pub struct EventNotifier {
    next_id: u64,
    listeners: Vec<(ListenerId, Arc<dyn EventListener>)>,
}

impl EventNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&mut self, listener: Arc<dyn EventListener>) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.listeners.push((id, listener));
        id
    }

    /// Returns whether a listener was removed.
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    pub fn notify(&self, event: &RendezvousEvent) {
        tracing::debug!(kind = ?event.kind, peer = %event.peer, "rendezvous event");
        for (_, listener) in &self.listeners {
            listener.on_event(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn peer(seed: u8) -> PeerId {
        PeerId::from_bytes([seed; 32])
    }

    #[test]
    fn listeners_called_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut notifier = EventNotifier::new();

        let l1 = log.clone();
        notifier.add_listener(Arc::new(move |e: &RendezvousEvent| {
            l1.lock().unwrap().push((1, e.kind));
        }));
        let l2 = log.clone();
        notifier.add_listener(Arc::new(move |e: &RendezvousEvent| {
            l2.lock().unwrap().push((2, e.kind));
        }));

        notifier.notify(&RendezvousEvent::new(EventKind::RdvConnect, peer(1)));
        assert_eq!(
            *log.lock().unwrap(),
            vec![(1, EventKind::RdvConnect), (2, EventKind::RdvConnect)]
        );
    }

    #[test]
    fn removed_listener_is_silent() {
        let hits = Arc::new(Mutex::new(0u32));
        let mut notifier = EventNotifier::new();
        let h = hits.clone();
        let id = notifier.add_listener(Arc::new(move |_: &RendezvousEvent| {
            *h.lock().unwrap() += 1;
        }));

        assert!(notifier.remove_listener(id));
        assert!(!notifier.remove_listener(id));
        notifier.notify(&RendezvousEvent::new(EventKind::ClientFailed, peer(2)));
        assert_eq!(*hits.lock().unwrap(), 0);
        assert_eq!(notifier.listener_count(), 0);
    }

    #[test]
    fn channel_listener_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut notifier = EventNotifier::new();
        notifier.add_listener(Arc::new(tx));

        notifier.notify(&RendezvousEvent::new(EventKind::ClientConnect, peer(1)));
        notifier.notify(&RendezvousEvent::new(EventKind::ClientConnect, peer(2)));

        assert_eq!(rx.try_recv().unwrap().peer, peer(1));
        assert!(rx.try_recv().is_err());
    }
}
