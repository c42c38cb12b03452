/// Common types and helpers for overlay scenarios.
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rdv_protocol::{
    DeliveredMessage, EdgeConfig, EventKind, MemoryNetwork, OverlayRuntime, PeerAdvertisement,
    PeerId, PeerRole, RendezvousEvent, RuntimeConfig, RuntimeHandle, ServerConfig,
};
use tokio::sync::mpsc;

use crate::events::{emit, EventOverlay};

/// Result of a scenario step.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step: String,
    pub ok: bool,
    pub elapsed_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Result of a full scenario run.
#[derive(Debug, Serialize)]
pub struct ScenarioResult {
    pub scenario: String,
    pub steps: Vec<StepResult>,
    pub total_ms: f64,
    pub passed: usize,
    pub failed: usize,
}

impl ScenarioResult {
    pub fn new(scenario: &str) -> Self {
        Self {
            scenario: scenario.into(),
            steps: Vec::new(),
            total_ms: 0.0,
            passed: 0,
            failed: 0,
        }
    }

    pub fn add(&mut self, step: StepResult) {
        if step.ok {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        self.steps.push(step);
    }

    pub fn finalize(&mut self, start: Instant) {
        self.total_ms = start.elapsed().as_secs_f64() * 1000.0;
    }

    pub fn success(&self) -> bool {
        self.failed == 0
    }

    pub fn print_summary(&self) {
        let icon = if self.success() { "PASS" } else { "FAIL" };
        eprintln!("\n[{icon}] Scenario: {} ({:.1}ms)", self.scenario, self.total_ms);
        eprintln!("  {} passed, {} failed", self.passed, self.failed);
        for step in &self.steps {
            let mark = if step.ok { " ok" } else { "FAIL" };
            eprint!("  [{mark}] {} ({:.1}ms)", step.step, step.elapsed_ms);
            if let Some(detail) = &step.detail {
                eprint!(": {detail}");
            }
            eprintln!();
        }
    }
}

/// Run a timed async step.
pub async fn timed_step_async<F, Fut>(name: &str, f: F) -> StepResult
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<String, String>>,
{
    let start = Instant::now();
    let outcome = f().await;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    match outcome {
        Ok(detail) => StepResult {
            step: name.into(),
            ok: true,
            elapsed_ms,
            detail: (!detail.is_empty()).then_some(detail),
        },
        Err(detail) => StepResult {
            step: name.into(),
            ok: false,
            elapsed_ms,
            detail: Some(detail),
        },
    }
}

// ── Simulated peers ─────────────────────────────────────────────

/// Timers scaled down so a scenario runs in seconds of wall time.
pub fn fast_config(group: &str, local: PeerAdvertisement, role: PeerRole) -> RuntimeConfig {
    RuntimeConfig {
        group_id: group.to_string(),
        local,
        role,
        edge: EdgeConfig {
            monitor_interval: Duration::from_millis(500),
            max_choice_delay: Duration::from_secs(1),
            min_choice_delay: Duration::from_millis(100),
            add_event_debounce: Duration::from_millis(200),
            requested_lease: Duration::from_secs(4),
            challenge_window: Duration::from_secs(1),
            pending_timeout: Duration::from_secs(2),
            ..Default::default()
        },
        server: ServerConfig {
            lease_duration: Duration::from_secs(4),
            gc_interval: Duration::from_secs(1),
            ..Default::default()
        },
        connect_wait: Duration::from_secs(1),
        connect_retry_wait: Duration::from_secs(2),
        ..Default::default()
    }
}

/// One overlay instance plus what the scenario observes of it.
pub struct SimPeer {
    pub name: String,
    pub advertisement: PeerAdvertisement,
    pub handle: RuntimeHandle,
    pub messages: mpsc::Receiver<DeliveredMessage>,
    pub events: mpsc::Receiver<RendezvousEvent>,
}

impl SimPeer {
    /// Attach to `net` on `subnet` and start a runtime. Every lifecycle
    /// event is logged as JSONL and queued on `events`.
    pub async fn spawn(
        net: &MemoryNetwork,
        name: &str,
        subnet: &str,
        config: RuntimeConfig,
    ) -> anyhow::Result<Self> {
        let advertisement = config.local.clone();
        tracing::debug!(
            "spawning {name} ({}) as {:?} on {subnet}",
            advertisement.peer_id,
            config.role
        );
        let attached = net.attach(&advertisement, subnet);
        let channels = OverlayRuntime::spawn(config, attached.collaborators, attached.inbound);

        let (tx, events) = mpsc::channel(256);
        let observer = name.to_string();
        channels
            .handle
            .add_listener(Arc::new(move |e: &RendezvousEvent| {
                emit(&EventOverlay::new(&observer, e));
                let _ = tx.try_send(e.clone());
            }))
            .await?;

        Ok(Self {
            name: name.to_string(),
            advertisement,
            handle: channels.handle,
            messages: channels.messages,
            events,
        })
    }

    pub fn id(&self) -> PeerId {
        self.advertisement.peer_id
    }

    /// Event kinds received so far.
    pub fn drain_events(&mut self) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        while let Ok(e) = self.events.try_recv() {
            kinds.push(e.kind);
        }
        kinds
    }

    pub fn drain_messages(&mut self) -> Vec<DeliveredMessage> {
        let mut out = Vec::new();
        while let Ok(m) = self.messages.try_recv() {
            out.push(m);
        }
        out
    }

    /// Wait for an event of `kind`, discarding others.
    pub async fn wait_event(
        &mut self,
        kind: EventKind,
        timeout: Duration,
    ) -> Result<PeerId, String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(e)) if e.kind == kind => return Ok(e.peer),
                Ok(Some(_)) => continue,
                Ok(None) => return Err(format!("{} stopped", self.name)),
                Err(_) => {
                    return Err(format!("{} saw no {kind:?} within {timeout:?}", self.name))
                }
            }
        }
    }
}

/// Deterministic advertisement so runs are comparable.
pub fn advertisement(seed: u8, name: &str) -> PeerAdvertisement {
    PeerAdvertisement::new(PeerId::from_bytes([seed; 32]), name)
}

/// Poll `check` every 100ms until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
