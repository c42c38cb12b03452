/// Integration tests: flood and walk dissemination.
///
/// Edges lease from a rendezvous, rendezvous walk between each other,
/// and every peer must see each message exactly once.
use std::time::Duration;

use rdv_protocol::{
    DeliveredMessage, MemoryNetwork, Message, OverlayRuntime, PeerAdvertisement, PeerId,
    PeerRole, RdvError, RuntimeChannels, RuntimeConfig, ServiceAddress,
};
use tokio::sync::mpsc;

const GROUP: &str = "flood-group";

fn adv(seed: u8) -> PeerAdvertisement {
    PeerAdvertisement::new(PeerId::from_bytes([seed; 32]), format!("peer-{seed}"))
}

fn spawn(net: &MemoryNetwork, seed: u8, role: PeerRole, subnet: &str) -> RuntimeChannels {
    let config = RuntimeConfig {
        group_id: GROUP.into(),
        local: adv(seed),
        role,
        ..Default::default()
    };
    let peer = net.attach(&config.local, subnet);
    OverlayRuntime::spawn(config, peer.collaborators, peer.inbound)
}

fn chat() -> ServiceAddress {
    ServiceAddress::new("chat", Some("room-1".into()))
}

fn received(rx: &mut mpsc::Receiver<DeliveredMessage>) -> Vec<DeliveredMessage> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test(start_paused = true)]
async fn flood_delivers_once_per_peer() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();

    let net = MemoryNetwork::new();
    let mut rdv = spawn(&net, 100, PeerRole::Rendezvous, "lan-a");
    let mut e1 = spawn(&net, 1, PeerRole::Edge, "lan-a");
    let mut e2 = spawn(&net, 2, PeerRole::Edge, "lan-a");
    let mut e3 = spawn(&net, 3, PeerRole::Edge, "lan-b");
    for edge in [&e1, &e2, &e3] {
        edge.handle.connect_to_rendezvous(adv(100)).await.unwrap();
    }

    let mut msg = Message::new(b"hello".to_vec());
    e1.handle.propagate(&mut msg, chat(), 5).await.unwrap();
    settle().await;

    // e2 hears it twice (subnet + relay) but delivers once.
    let at_e2 = received(&mut e2.messages);
    assert_eq!(at_e2.len(), 1);
    assert_eq!(at_e2[0].payload, b"hello");
    assert_eq!(at_e2[0].origin, adv(1).peer_id);
    assert_eq!(at_e2[0].service, chat());
    assert!(!at_e2[0].walked);

    let at_e3 = received(&mut e3.messages);
    assert_eq!(at_e3.len(), 1);
    assert_eq!(at_e3[0].from, adv(100).peer_id);

    assert_eq!(received(&mut rdv.messages).len(), 1);
    assert!(received(&mut e1.messages).is_empty());

    // Same message again: nobody sees it a second time.
    let first_id = msg.message_id().map(str::to_owned);
    e1.handle.propagate(&mut msg, chat(), 5).await.unwrap();
    settle().await;
    assert_eq!(msg.message_id().map(str::to_owned), first_id);
    for rx in [&mut rdv.messages, &mut e2.messages, &mut e3.messages] {
        assert!(received(rx).is_empty());
    }
}

#[tokio::test(start_paused = true)]
async fn in_group_flood_skips_subnet() {
    let net = MemoryNetwork::new();
    let _rdv = spawn(&net, 100, PeerRole::Rendezvous, "dc");
    let e1 = spawn(&net, 1, PeerRole::Edge, "lan");
    let mut e2 = spawn(&net, 2, PeerRole::Edge, "lan");
    e1.handle.connect_to_rendezvous(adv(100)).await.unwrap();
    e2.handle.connect_to_rendezvous(adv(100)).await.unwrap();

    let mut msg = Message::new(b"group only".to_vec());
    e1.handle.propagate_in_group(&mut msg, chat(), 5).await.unwrap();
    settle().await;

    let at_e2 = received(&mut e2.messages);
    assert_eq!(at_e2.len(), 1);
    // Came through the rendezvous, not the shared subnet.
    assert_eq!(at_e2[0].from, adv(100).peer_id);
}

#[tokio::test(start_paused = true)]
async fn unconnected_edge_floods_its_subnet() {
    let net = MemoryNetwork::new();
    let e1 = spawn(&net, 1, PeerRole::Edge, "lan");
    let mut e2 = spawn(&net, 2, PeerRole::Edge, "lan");
    let mut far = spawn(&net, 3, PeerRole::Edge, "elsewhere");

    let mut msg = Message::new(b"local".to_vec());
    e1.handle.propagate(&mut msg, chat(), 3).await.unwrap();
    settle().await;

    assert_eq!(received(&mut e2.messages).len(), 1);
    assert!(received(&mut far.messages).is_empty());
}

#[tokio::test(start_paused = true)]
async fn zero_ttl_sends_nothing() {
    let net = MemoryNetwork::new();
    let e1 = spawn(&net, 1, PeerRole::Edge, "lan");
    let mut e2 = spawn(&net, 2, PeerRole::Edge, "lan");

    let mut msg = Message::new(b"nowhere".to_vec());
    e1.handle.propagate(&mut msg, chat(), 0).await.unwrap();
    settle().await;

    assert!(received(&mut e2.messages).is_empty());
}

#[tokio::test(start_paused = true)]
async fn walk_reaches_every_rendezvous_once() {
    let net = MemoryNetwork::new();
    let mut r1 = spawn(&net, 101, PeerRole::Rendezvous, "a");
    let mut r2 = spawn(&net, 102, PeerRole::Rendezvous, "b");
    let mut r3 = spawn(&net, 103, PeerRole::Rendezvous, "c");
    for seed in [101, 102, 103] {
        net.add_candidate(adv(seed));
    }

    let mut msg = Message::new(b"query".to_vec());
    r1.handle
        .walk(&mut msg, ServiceAddress::walk(GROUP), 5)
        .await
        .unwrap();
    settle().await;

    for rx in [&mut r2.messages, &mut r3.messages] {
        let got = received(rx);
        assert_eq!(got.len(), 1);
        assert!(got[0].walked);
        assert_eq!(got[0].origin, adv(101).peer_id);
    }
    // Walked back to the origin by the others, but the loop guard drops it.
    assert!(received(&mut r1.messages).is_empty());
}

#[tokio::test(start_paused = true)]
async fn directed_walk_reaches_only_targets() {
    let net = MemoryNetwork::new();
    let r1 = spawn(&net, 101, PeerRole::Rendezvous, "a");
    let mut r2 = spawn(&net, 102, PeerRole::Rendezvous, "b");
    let mut r3 = spawn(&net, 103, PeerRole::Rendezvous, "c");
    for seed in [101, 102, 103] {
        net.add_candidate(adv(seed));
    }

    let mut msg = Message::new(b"just you".to_vec());
    r1.handle
        .walk_to(vec![adv(103).peer_id], &mut msg, ServiceAddress::walk(GROUP), 5)
        .await
        .unwrap();
    settle().await;

    assert_eq!(received(&mut r3.messages).len(), 1);
    assert!(received(&mut r2.messages).is_empty());
}

#[tokio::test(start_paused = true)]
async fn directed_walk_to_missing_peer_is_not_an_error() {
    let net = MemoryNetwork::new();
    let r1 = spawn(&net, 101, PeerRole::Rendezvous, "a");

    let mut msg = Message::new(b"lost".to_vec());
    let sent = r1
        .handle
        .walk_to(vec![adv(99).peer_id], &mut msg, ServiceAddress::walk(GROUP), 5)
        .await;
    assert!(sent.is_ok());
}

#[tokio::test(start_paused = true)]
async fn edge_walk_goes_through_its_rendezvous() {
    let net = MemoryNetwork::new();
    let mut r1 = spawn(&net, 101, PeerRole::Rendezvous, "a");
    let mut r2 = spawn(&net, 102, PeerRole::Rendezvous, "b");
    net.add_candidate(adv(101));
    net.add_candidate(adv(102));
    let edge = spawn(&net, 1, PeerRole::Edge, "home");
    edge.handle.connect_to_rendezvous(adv(101)).await.unwrap();

    let mut msg = Message::new(b"search".to_vec());
    edge.handle
        .walk(&mut msg, ServiceAddress::walk(GROUP), 5)
        .await
        .unwrap();
    settle().await;

    let at_r1 = received(&mut r1.messages);
    assert_eq!(at_r1.len(), 1);
    assert_eq!(at_r1[0].from, adv(1).peer_id);
    let at_r2 = received(&mut r2.messages);
    assert_eq!(at_r2.len(), 1);
    assert_eq!(at_r2[0].origin, adv(1).peer_id);
}

#[tokio::test(start_paused = true)]
async fn edge_walk_without_rendezvous_has_no_route() {
    let net = MemoryNetwork::new();
    let edge = spawn(&net, 1, PeerRole::Edge, "home");

    let mut msg = Message::new(b"search".to_vec());
    let err = edge
        .handle
        .walk(&mut msg, ServiceAddress::walk(GROUP), 5)
        .await
        .unwrap_err();
    assert!(matches!(err, RdvError::NoRoute));
}

#[tokio::test(start_paused = true)]
async fn rendezvous_without_forwarder_cannot_walk() {
    let net = MemoryNetwork::new();
    let config = RuntimeConfig {
        group_id: GROUP.into(),
        local: adv(101),
        role: PeerRole::Rendezvous,
        ..Default::default()
    };
    let mut peer = net.attach(&config.local, "a");
    peer.collaborators.forwarder = None;
    let rdv = OverlayRuntime::spawn(config, peer.collaborators, peer.inbound);

    let mut msg = Message::new(b"stuck".to_vec());
    let err = rdv
        .handle
        .walk(&mut msg, ServiceAddress::walk(GROUP), 5)
        .await
        .unwrap_err();
    assert!(matches!(err, RdvError::NoForwarder));
    assert!(msg.header.is_none());
}
