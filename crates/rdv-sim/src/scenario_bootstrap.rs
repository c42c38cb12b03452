/// Bootstrap scenario: edges start with an empty candidate view, stay
/// unconnected, then all lease from the rendezvous once it is announced.
use std::time::{Duration, Instant};

use rdv_protocol::{EventKind, MemoryNetwork, PeerRole};

use crate::scenario_common::{
    advertisement, fast_config, timed_step_async, wait_until, ScenarioResult, SimPeer,
};

pub async fn run(group: &str, edges: usize) -> anyhow::Result<ScenarioResult> {
    let mut result = ScenarioResult::new("bootstrap");
    let start = Instant::now();
    let net = MemoryNetwork::new();

    let rdv_adv = advertisement(200, "rdv");
    let rdv = SimPeer::spawn(
        &net,
        "rdv",
        "dc",
        fast_config(group, rdv_adv.clone(), PeerRole::Rendezvous),
    )
    .await?;

    let mut peers = Vec::with_capacity(edges);
    for i in 0..edges {
        let name = format!("edge-{i}");
        let adv = advertisement(i as u8 + 1, &name);
        let config = fast_config(group, adv, PeerRole::Edge);
        peers.push(SimPeer::spawn(&net, &name, "home", config).await?);
    }
    eprintln!("rendezvous {} with {edges} edge(s)", rdv.id());

    // ── Nothing to lease from yet ───────────────────────────────────
    let step = timed_step_async("no lease without candidates", || async {
        tokio::time::sleep(Duration::from_secs(2)).await;
        for p in &peers {
            if p.handle.is_connected().await {
                return Err(format!("{} connected with an empty view", p.name));
            }
        }
        Ok(String::new())
    })
    .await;
    result.add(step);

    // ── Announce the rendezvous ─────────────────────────────────────
    net.add_candidate(rdv_adv);
    let step = timed_step_async("edges lease after announcement", || async {
        for p in peers.iter_mut() {
            let granter = p.wait_event(EventKind::RdvConnect, Duration::from_secs(5)).await?;
            if granter != rdv.id() {
                return Err(format!("{} leased from unknown {granter}", p.name));
            }
        }
        Ok(format!("{edges} edge(s) connected"))
    })
    .await;
    result.add(step);

    let rdv_handle = rdv.handle.clone();
    let step = timed_step_async("rendezvous lists every client", || async {
        let all = wait_until(Duration::from_secs(2), || {
            let h = rdv_handle.clone();
            async move { h.connected_peers().await.len() == edges }
        })
        .await;
        if all {
            Ok(String::new())
        } else {
            let n = rdv.handle.connected_peers().await.len();
            Err(format!("{n}/{edges} clients admitted"))
        }
    })
    .await;
    result.add(step);

    // ── Leases survive renewal ──────────────────────────────────────
    let step = timed_step_async("leases renewed past one window", || async {
        tokio::time::sleep(Duration::from_secs(6)).await;
        for p in peers.iter_mut() {
            if !p.handle.is_connected().await {
                return Err(format!("{} lost its lease", p.name));
            }
            if !p.drain_events().contains(&EventKind::RdvReconnect) {
                return Err(format!("{} never renewed", p.name));
            }
        }
        Ok(String::new())
    })
    .await;
    result.add(step);

    for p in &peers {
        p.handle.shutdown().await;
    }
    rdv.handle.shutdown().await;

    result.finalize(start);
    Ok(result)
}
