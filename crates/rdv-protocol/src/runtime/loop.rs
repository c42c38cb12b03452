/// The overlay event loop.
///
/// A single async task that owns the [`RuntimeState`] and multiplexes over
/// inbound frames, application commands, candidate-view changes and the
/// monitor / GC timers.
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::collab::{Collaborators, InboundFrame};
use crate::events::EventNotifier;
use crate::types::{now_ms, PeerRole};

use super::effect::RuntimeEffect;
use super::executor::{Executor, Report};
use super::state::RuntimeState;
use super::{DeliveredMessage, RuntimeCommand, RuntimeConfig};

/// Unix-millisecond clock driven by tokio time, so paused test time moves it.
struct Clock {
    origin: Instant,
    base: u64,
}

impl Clock {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            base: now_ms(),
        }
    }

    fn now(&self) -> u64 {
        self.base + self.origin.elapsed().as_millis() as u64
    }
}

/// Execute effects and feed send failures back into the state.
async fn run(
    state: &mut RuntimeState,
    executor: &mut Executor,
    notifier: &EventNotifier,
    effects: Vec<RuntimeEffect>,
) -> Report {
    if effects.is_empty() {
        return Report::default();
    }
    let report = executor.execute(effects, notifier).await;
    for (peer, reason) in &report.failed_sends {
        state.on_send_failed(*peer, reason);
    }
    report
}

/// Main event loop. Owns all overlay state for one group.
pub(super) async fn runtime_loop(
    config: RuntimeConfig,
    collab: Collaborators,
    mut cmd_rx: mpsc::Receiver<RuntimeCommand>,
    mut inbound_rx: mpsc::Receiver<InboundFrame>,
    msg_tx: mpsc::Sender<DeliveredMessage>,
) {
    let clock = Clock::new();
    let mut rng = StdRng::from_os_rng();
    let group = config.group_id.clone();

    let mut state = RuntimeState::new(config, collab.forwarder.is_some());
    let mut executor = Executor::new(group.clone(), collab.clone(), msg_tx);
    let mut notifier = EventNotifier::new();

    let mut view_rx = collab.view.subscribe();
    let mut view_open = true;

    // ── Timers ──────────────────────────────────────────────────────
    let first_tick = state
        .start_monitor(&collab.view.current_view())
        .unwrap_or_else(|| state.monitor_interval());
    let monitor = tokio::time::sleep(first_tick);
    tokio::pin!(monitor);

    let mut gc = tokio::time::interval(state.gc_interval());
    // Skip the immediate first tick
    gc.tick().await;

    let effects = state.start();
    run(&mut state, &mut executor, &notifier, effects).await;
    tracing::info!(
        "overlay runtime for group {group} started as {:?}",
        state.role()
    );

    loop {
        tokio::select! {
            // ── 1. Incoming frames from the transport ───────────
            Some(frame) = inbound_rx.recv() => {
                let effects = state.handle_inbound(&frame.data, frame.path, clock.now());
                run(&mut state, &mut executor, &notifier, effects).await;
            }

            // ── 2. Commands from the application ────────────────
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    tracing::debug!("all handles dropped, stopping group {group}");
                    let effects = state.shutdown();
                    run(&mut state, &mut executor, &notifier, effects).await;
                    break;
                };
                let now = clock.now();
                match cmd {
                    RuntimeCommand::RequestLease { advertisement, reply } => {
                        let effects = state.request_lease(advertisement, reply, now);
                        run(&mut state, &mut executor, &notifier, effects).await;
                    }
                    RuntimeCommand::ResolvePeer { peer, reply } => {
                        let found = executor
                            .collaborators()
                            .store
                            .query_local("Peer", "PID", &peer.to_string())
                            .await
                            .into_iter()
                            .find(|adv| adv.peer_id == peer);
                        let _ = reply.send(found);
                    }
                    RuntimeCommand::Disconnect { peer, reply } => match state.disconnect(peer) {
                        Ok(effects) => {
                            run(&mut state, &mut executor, &notifier, effects).await;
                            let _ = reply.send(Ok(()));
                        }
                        Err(e) => {
                            let _ = reply.send(Err(e));
                        }
                    },
                    RuntimeCommand::Propagate { mut message, service, ttl, in_group, reply } => {
                        let effects = state.propagate(&mut message, service, ttl, in_group, now);
                        run(&mut state, &mut executor, &notifier, effects).await;
                        let _ = reply.send(Ok(message.header));
                    }
                    RuntimeCommand::Walk { mut message, destination, targets, ttl, reply } => {
                        let flood = targets.is_empty();
                        match state.walk(&mut message, destination, targets, ttl, now) {
                            Ok(effects) => {
                                let report = run(&mut state, &mut executor, &notifier, effects).await;
                                // Directed walks only log per-target failures.
                                let outcome = match report.walk_errors.into_iter().next() {
                                    Some(e) if flood => Err(e),
                                    _ => Ok(message.header),
                                };
                                let _ = reply.send(outcome);
                            }
                            Err(e) => {
                                let _ = reply.send(Err(e));
                            }
                        }
                    }
                    RuntimeCommand::IsConnected { reply } => {
                        let _ = reply.send(state.is_connected(now));
                    }
                    RuntimeCommand::ConnectedPeers { reply } => {
                        let _ = reply.send(state.connected_peers(now));
                    }
                    RuntimeCommand::Role { reply } => {
                        let _ = reply.send(state.role());
                    }
                    RuntimeCommand::AddListener { listener, reply } => {
                        let _ = reply.send(notifier.add_listener(listener));
                    }
                    RuntimeCommand::RemoveListener { id, reply } => {
                        let _ = reply.send(notifier.remove_listener(id));
                    }
                    RuntimeCommand::Challenge { peer, delay_ms } => {
                        let effects = state.challenge(peer, delay_ms, now);
                        run(&mut state, &mut executor, &notifier, effects).await;
                    }
                    RuntimeCommand::SetLocalAdvertisement { advertisement } => {
                        state.set_local_advertisement(advertisement);
                    }
                    RuntimeCommand::BecomeRendezvous => {
                        let effects = state.become_rendezvous();
                        run(&mut state, &mut executor, &notifier, effects).await;
                        gc.reset();
                    }
                    RuntimeCommand::BecomeEdge => {
                        let effects = state.become_edge();
                        run(&mut state, &mut executor, &notifier, effects).await;
                        let view = executor.collaborators().view.current_view();
                        if let Some(delay) = state.start_monitor(&view) {
                            monitor.as_mut().reset(Instant::now() + delay);
                        }
                    }
                    RuntimeCommand::Shutdown { reply } => {
                        let effects = state.shutdown();
                        run(&mut state, &mut executor, &notifier, effects).await;
                        let _ = reply.send(());
                        break;
                    }
                }
            }

            // ── 3. Edge monitor tick ────────────────────────────
            () = &mut monitor, if state.role() == PeerRole::Edge && !state.is_closed() => {
                let view = executor.collaborators().view.current_view();
                let effects = state.tick_monitor(&view, clock.now(), &mut rng);
                run(&mut state, &mut executor, &notifier, effects).await;
                monitor.as_mut().reset(Instant::now() + state.monitor_interval());
            }

            // ── 4. Rendezvous client GC ─────────────────────────
            _ = gc.tick(), if state.role() == PeerRole::Rendezvous => {
                let effects = state.tick_gc(clock.now());
                run(&mut state, &mut executor, &notifier, effects).await;
            }

            // ── 5. Candidate view changes ───────────────────────
            event = view_rx.recv(), if view_open => {
                match event {
                    Ok(event) => {
                        let (effects, reschedule) = state.handle_view_event(event, clock.now());
                        run(&mut state, &mut executor, &notifier, effects).await;
                        if let Some(delay) = reschedule {
                            monitor.as_mut().reset(Instant::now() + delay);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!("view subscription lagged, {n} change(s) skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        view_open = false;
                    }
                }
            }
        }
    }

    tracing::info!("overlay runtime for group {group} stopped");
}
