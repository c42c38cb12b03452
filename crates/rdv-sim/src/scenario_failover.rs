/// Failover scenario: an edge leases from one of several rendezvous, that
/// rendezvous crashes, and the edge detects the loss and re-leases elsewhere.
///
/// Self-contained: `rendezvous` super-peers and one edge on the in-memory network.
use std::time::{Duration, Instant};

use rdv_protocol::{EventKind, MemoryNetwork, PeerRole};

use crate::scenario_common::{
    advertisement, fast_config, timed_step_async, ScenarioResult, SimPeer,
};

pub async fn run(group: &str, rendezvous: usize) -> anyhow::Result<ScenarioResult> {
    let mut result = ScenarioResult::new("failover");
    let start = Instant::now();
    let net = MemoryNetwork::new();

    // ── Spawn super-peers and announce them ─────────────────────────
    let mut servers = Vec::with_capacity(rendezvous);
    for i in 0..rendezvous {
        let name = format!("rdv-{i}");
        let adv = advertisement(200 + i as u8, &name);
        let config = fast_config(group, adv.clone(), PeerRole::Rendezvous);
        servers.push(SimPeer::spawn(&net, &name, &format!("dc-{i}"), config).await?);
        net.add_candidate(adv);
    }

    let mut edge = SimPeer::spawn(
        &net,
        "edge",
        "home",
        fast_config(group, advertisement(1, "edge"), PeerRole::Edge),
    )
    .await?;
    eprintln!("edge {} with {rendezvous} rendezvous", edge.id());

    // ── Initial lease ───────────────────────────────────────────────
    let step = timed_step_async("edge picks a rendezvous", || async {
        let granter = edge
            .wait_event(EventKind::RdvConnect, Duration::from_secs(5))
            .await?;
        Ok(format!("leased from {granter}"))
    })
    .await;
    let ok = step.ok;
    result.add(step);
    if !ok {
        result.finalize(start);
        return Ok(result);
    }

    let held = edge.handle.connected_peers().await;
    let Some(&lost) = held.first() else {
        anyhow::bail!("edge reported a lease but holds none");
    };

    // ── Crash the held rendezvous ───────────────────────────────────
    net.set_reachable(lost, false);
    let step = timed_step_async("loss detected", || async {
        let failed = edge
            .wait_event(EventKind::RdvFailed, Duration::from_secs(10))
            .await?;
        if failed == lost {
            Ok(String::new())
        } else {
            Err(format!("failure reported for {failed}, crashed {lost}"))
        }
    })
    .await;
    result.add(step);

    let step = timed_step_async("re-leased from a survivor", || async {
        let granter = edge
            .wait_event(EventKind::RdvConnect, Duration::from_secs(10))
            .await?;
        if granter == lost {
            return Err("re-leased from the crashed rendezvous".into());
        }
        let reported = net.reported_failures().contains(&lost);
        Ok(format!("now on {granter}, failure reported to view: {reported}"))
    })
    .await;
    result.add(step);

    // ── The survivor keeps us ───────────────────────────────────────
    let step = timed_step_async("survivor lists the edge", || async {
        let now_held = edge.handle.connected_peers().await;
        let Some(survivor) = servers.iter().find(|s| now_held.contains(&s.id())) else {
            return Err("edge holds no lease".into());
        };
        if survivor.handle.connected_peers().await.contains(&edge.id()) {
            Ok(format!("{} admitted the edge", survivor.name))
        } else {
            Err(format!("{} does not list the edge", survivor.name))
        }
    })
    .await;
    result.add(step);

    edge.handle.shutdown().await;
    for s in &servers {
        s.handle.shutdown().await;
    }

    result.finalize(start);
    Ok(result)
}
