/// Flood scenario: edges on two subnets share one rendezvous; one edge
/// propagates a batch of messages and every other peer must deliver each
/// exactly once. Then a walk crosses a ring of rendezvous.
use std::collections::HashMap;
use std::time::{Duration, Instant};

use rdv_protocol::{MemoryNetwork, Message, PeerRole, ServiceAddress};

use crate::events::{emit, EventDelivery};
use crate::scenario_common::{
    advertisement, fast_config, timed_step_async, ScenarioResult, SimPeer,
};

/// Count deliveries per message id: (delivered, duplicates, missing).
fn tally(peers: &mut [SimPeer], ids: &[String]) -> (usize, usize, usize) {
    let mut delivered = 0;
    let mut duplicates = 0;
    let mut missing = 0;
    for p in peers.iter_mut() {
        let mut seen: HashMap<String, usize> = HashMap::new();
        for m in p.drain_messages() {
            *seen.entry(m.message_id).or_default() += 1;
        }
        for id in ids {
            match seen.get(id).copied().unwrap_or(0) {
                0 => missing += 1,
                n => {
                    delivered += 1;
                    duplicates += n - 1;
                }
            }
        }
    }
    (delivered, duplicates, missing)
}

pub async fn run(group: &str, edges: usize, messages: usize) -> anyhow::Result<ScenarioResult> {
    let mut result = ScenarioResult::new("flood");
    let start = Instant::now();
    let net = MemoryNetwork::new();
    let service = ServiceAddress::propagate(group);

    let rdv_adv = advertisement(200, "rdv");
    let rdv_config = fast_config(group, rdv_adv.clone(), PeerRole::Rendezvous);
    let mut receivers = vec![SimPeer::spawn(&net, "rdv", "lan-a", rdv_config).await?];

    let sender_config = fast_config(group, advertisement(1, "edge-0"), PeerRole::Edge);
    let sender = SimPeer::spawn(&net, "edge-0", "lan-a", sender_config).await?;
    for i in 1..edges.max(2) {
        let name = format!("edge-{i}");
        let subnet = if i % 2 == 0 { "lan-a" } else { "lan-b" };
        let config = fast_config(group, advertisement(i as u8 + 1, &name), PeerRole::Edge);
        receivers.push(SimPeer::spawn(&net, &name, subnet, config).await?);
    }

    // ── Lease everyone ──────────────────────────────────────────────
    let step = timed_step_async("edges lease from the rendezvous", || async {
        let edges_only = receivers.iter().skip(1).chain(std::iter::once(&sender));
        for p in edges_only {
            p.handle
                .connect_to_rendezvous(rdv_adv.clone())
                .await
                .map_err(|e| format!("{}: {e}", p.name))?;
        }
        Ok(String::new())
    })
    .await;
    result.add(step);

    // ── Flood a batch ───────────────────────────────────────────────
    let mut ids = Vec::with_capacity(messages);
    let flood_start = Instant::now();
    let step = timed_step_async("every peer delivers each message once", || async {
        for n in 0..messages {
            let mut msg = Message::new(format!("flood-{n}").into_bytes());
            sender
                .handle
                .propagate(&mut msg, service.clone(), 5)
                .await
                .map_err(|e| e.to_string())?;
            if let Some(id) = msg.message_id() {
                ids.push(id.to_string());
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        let (delivered, duplicates, missing) = tally(&mut receivers, &ids);
        emit(&EventDelivery {
            event: "flood_result",
            messages_sent: messages,
            receivers: receivers.len(),
            delivered,
            duplicates,
            missing,
            elapsed_ms: flood_start.elapsed().as_secs_f64() * 1000.0,
        });
        if duplicates == 0 && missing == 0 {
            Ok(format!("{delivered} deliveries"))
        } else {
            Err(format!("{missing} missing, {duplicates} duplicate(s)"))
        }
    })
    .await;
    result.add(step);

    let step = timed_step_async("sender never hears its own message", || async {
        let mut sender = sender;
        let echoed = sender.drain_messages().len();
        sender.handle.shutdown().await;
        if echoed == 0 {
            Ok(String::new())
        } else {
            Err(format!("{echoed} echo(es)"))
        }
    })
    .await;
    result.add(step);

    for p in &receivers {
        p.handle.shutdown().await;
    }

    // ── Walk across rendezvous ──────────────────────────────────────
    let mut ring = Vec::new();
    for i in 0..3u8 {
        let name = format!("ring-{i}");
        let adv = advertisement(220 + i, &name);
        let config = fast_config(group, adv.clone(), PeerRole::Rendezvous);
        ring.push(SimPeer::spawn(&net, &name, &format!("site-{i}"), config).await?);
        net.add_candidate(adv);
    }
    let step = timed_step_async("walk reaches every other rendezvous once", || async {
        let mut msg = Message::new(b"walk".to_vec());
        ring[0]
            .handle
            .walk(&mut msg, ServiceAddress::walk(group), 5)
            .await
            .map_err(|e| e.to_string())?;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let id = msg.message_id().unwrap_or_default().to_string();
        let (delivered, duplicates, missing) = tally(&mut ring[1..], std::slice::from_ref(&id));
        let looped = ring[0].drain_messages().len();
        if delivered == 2 && duplicates == 0 && missing == 0 && looped == 0 {
            Ok(String::new())
        } else {
            Err(format!(
                "{delivered} delivered, {duplicates} dup, {missing} missing, {looped} looped"
            ))
        }
    })
    .await;
    result.add(step);

    for p in &ring {
        p.handle.shutdown().await;
    }

    result.finalize(start);
    Ok(result)
}
