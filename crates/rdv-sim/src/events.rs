use crate::output;
use rdv_protocol::{EventKind, RendezvousEvent};
use serde::Serialize;
use std::io::Write;

/// Emit a JSONL event to stdout (flushed, for piping) and to the run file.
pub fn emit<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = writeln!(lock, "{json}");
        let _ = lock.flush();

        output::append(&json);
    }
}

pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ── Session ─────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventStarted {
    pub event: &'static str,
    pub scenario: String,
    pub group: String,
    pub timestamp: String,
}

impl EventStarted {
    pub fn new(scenario: &str, group: &str) -> Self {
        Self {
            event: "started",
            scenario: scenario.to_string(),
            group: group.to_string(),
            timestamp: now_iso(),
        }
    }
}

// ── Overlay lifecycle ───────────────────────────────────────────

/// One lease or role event as seen by a simulated peer.
#[derive(Serialize)]
pub struct EventOverlay {
    pub event: &'static str,
    /// Name of the peer that observed the event.
    pub observer: String,
    pub kind: EventKind,
    pub peer: String,
    pub timestamp: String,
}

impl EventOverlay {
    pub fn new(observer: &str, e: &RendezvousEvent) -> Self {
        Self {
            event: "overlay",
            observer: observer.to_string(),
            kind: e.kind,
            peer: e.peer.to_string(),
            timestamp: now_iso(),
        }
    }
}

// ── Dissemination ───────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventDelivery {
    pub event: &'static str,
    pub messages_sent: usize,
    /// Peers expected to receive each message.
    pub receivers: usize,
    pub delivered: usize,
    pub duplicates: usize,
    pub missing: usize,
    pub elapsed_ms: f64,
}
