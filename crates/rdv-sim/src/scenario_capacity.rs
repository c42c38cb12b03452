/// Capacity scenario: more edges than the rendezvous admits ask for a lease.
/// The first `max_clients` are granted, the rest are declined, and a
/// released slot can be taken by a declined edge.
use std::time::{Duration, Instant};

use rdv_protocol::{MemoryNetwork, PeerRole, RdvError};

use crate::scenario_common::{
    advertisement, fast_config, timed_step_async, ScenarioResult, SimPeer,
};

pub async fn run(
    group: &str,
    max_clients: usize,
    edges: usize,
) -> anyhow::Result<ScenarioResult> {
    let mut result = ScenarioResult::new("capacity");
    let start = Instant::now();
    let net = MemoryNetwork::new();

    let rdv_adv = advertisement(200, "rdv");
    let mut rdv_config = fast_config(group, rdv_adv.clone(), PeerRole::Rendezvous);
    rdv_config.server.max_clients = max_clients;
    let rdv = SimPeer::spawn(&net, "rdv", "dc", rdv_config).await?;

    let mut peers = Vec::with_capacity(edges);
    for i in 0..edges {
        let name = format!("edge-{i}");
        let config = fast_config(group, advertisement(i as u8 + 1, &name), PeerRole::Edge);
        peers.push(SimPeer::spawn(&net, &name, "home", config).await?);
    }
    eprintln!("rendezvous admits {max_clients}, {edges} edge(s) asking");

    // ── Everyone asks at once ───────────────────────────────────────
    let mut declined = Vec::new();
    let step = timed_step_async("grants up to capacity", || async {
        let mut granted = 0usize;
        for (i, p) in peers.iter().enumerate() {
            match p.handle.connect_to_rendezvous(rdv_adv.clone()).await {
                Ok(()) => granted += 1,
                Err(RdvError::LeaseDenied { .. }) => declined.push(i),
                Err(e) => return Err(format!("{}: unexpected {e}", p.name)),
            }
        }
        let expected = max_clients.min(edges);
        if granted == expected {
            Ok(format!("{granted} granted, {} declined", declined.len()))
        } else {
            Err(format!("{granted} granted, expected {expected}"))
        }
    })
    .await;
    result.add(step);

    let step = timed_step_async("rendezvous holds exactly the granted", || async {
        let clients = rdv.handle.connected_peers().await;
        if clients.len() == max_clients.min(edges) {
            Ok(String::new())
        } else {
            Err(format!("{} clients listed", clients.len()))
        }
    })
    .await;
    result.add(step);

    // ── A released slot is reusable ─────────────────────────────────
    if let Some(&waiting) = declined.first().filter(|_| max_clients > 0) {
        let step = timed_step_async("released slot goes to a declined edge", || async {
            let holder = peers
                .iter()
                .enumerate()
                .find(|(i, _)| !declined.contains(i))
                .map(|(_, p)| p)
                .ok_or("no edge holds a lease")?;
            holder
                .handle
                .disconnect_from_rendezvous(rdv_adv.peer_id)
                .await
                .map_err(|e| e.to_string())?;
            tokio::time::sleep(Duration::from_millis(200)).await;

            peers[waiting]
                .handle
                .connect_to_rendezvous(rdv_adv.clone())
                .await
                .map_err(|e| format!("{}: {e}", peers[waiting].name))?;
            Ok(format!("{} took the slot", peers[waiting].name))
        })
        .await;
        result.add(step);
    }

    for p in &peers {
        p.handle.shutdown().await;
    }
    rdv.handle.shutdown().await;

    result.finalize(start);
    Ok(result)
}
