/// Integration test: lease lifecycle through the full runtime.
///
/// Rendezvous and edge runtimes talk over the in-memory network with
/// tokio time paused, so lease windows of minutes run instantly.
use std::sync::Arc;
use std::time::Duration;

use rdv_protocol::{
    AdvertisementStore, EdgeConfig, EventKind, MemoryNetwork, MemoryStore, OverlayRuntime,
    PeerAdvertisement, PeerId, PeerRole, RdvError, RendezvousEvent, RuntimeChannels,
    RuntimeConfig, RuntimeHandle, ServerConfig,
};
use tokio::sync::mpsc;

const GROUP: &str = "it-group";

fn adv(seed: u8) -> PeerAdvertisement {
    PeerAdvertisement::new(PeerId::from_bytes([seed; 32]), format!("peer-{seed}"))
}

fn config(seed: u8, role: PeerRole) -> RuntimeConfig {
    RuntimeConfig {
        group_id: GROUP.into(),
        local: adv(seed),
        role,
        ..Default::default()
    }
}

fn spawn(net: &MemoryNetwork, config: RuntimeConfig) -> (RuntimeChannels, Arc<MemoryStore>) {
    let peer = net.attach(&config.local, "lan");
    let store = peer.store.clone();
    let channels = OverlayRuntime::spawn(config, peer.collaborators, peer.inbound);
    (channels, store)
}

fn rendezvous(net: &MemoryNetwork, seed: u8) -> RuntimeHandle {
    spawn(net, config(seed, PeerRole::Rendezvous)).0.handle
}

fn edge(net: &MemoryNetwork, seed: u8) -> RuntimeHandle {
    spawn(net, config(seed, PeerRole::Edge)).0.handle
}

async fn listen(handle: &RuntimeHandle) -> mpsc::Receiver<RendezvousEvent> {
    let (tx, rx) = mpsc::channel(256);
    handle.add_listener(Arc::new(tx)).await.expect("runtime alive");
    rx
}

fn drain(rx: &mut mpsc::Receiver<RendezvousEvent>) -> Vec<EventKind> {
    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind);
    }
    kinds
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test(start_paused = true)]
async fn edge_waits_for_candidate_then_connects() {
    let net = MemoryNetwork::new();
    let _rdv = rendezvous(&net, 100);
    let edge = edge(&net, 1);
    let mut events = listen(&edge).await;

    // Empty view: nothing happens, however long we wait.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(!edge.is_connected().await);

    net.add_candidate(adv(100));
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert!(edge.is_connected().await);
    assert_eq!(edge.connected_peers().await, vec![adv(100).peer_id]);
    assert!(drain(&mut events).contains(&EventKind::RdvConnect));
}

#[tokio::test(start_paused = true)]
async fn explicit_connect_gets_server_lease() {
    let net = MemoryNetwork::new();
    let rdv = rendezvous(&net, 100);
    let mut cfg = config(1, PeerRole::Edge);
    cfg.edge = EdgeConfig {
        requested_lease: Duration::from_secs(60),
        ..Default::default()
    };
    let (channels, store) = spawn(&net, cfg);
    let edge = channels.handle;

    edge.connect_to_rendezvous(adv(100)).await.expect("lease granted");

    // The granted lease is the server's 20 minutes, not the 1 minute asked for.
    let granter = store.get(&adv(100).peer_id).expect("granter published");
    assert_eq!(granter.lifetime_ms, 20 * 60 * 1000);
    assert_eq!(rdv.connected_peers().await, vec![adv(1).peer_id]);
}

#[tokio::test(start_paused = true)]
async fn full_rendezvous_declines_new_clients() {
    let net = MemoryNetwork::new();
    let mut cfg = config(100, PeerRole::Rendezvous);
    cfg.server = ServerConfig {
        max_clients: 1,
        ..Default::default()
    };
    let rdv = spawn(&net, cfg).0.handle;
    let first = edge(&net, 1);
    let second = edge(&net, 2);

    first.connect_to_rendezvous(adv(100)).await.unwrap();
    let err = second.connect_to_rendezvous(adv(100)).await.unwrap_err();

    assert!(matches!(err, RdvError::LeaseDenied { peer } if peer == adv(100).peer_id));
    assert_eq!(rdv.connected_peers().await, vec![adv(1).peer_id]);
    assert!(!second.is_connected().await);

    // The admitted client can still renew at capacity.
    first.connect_to_rendezvous(adv(100)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn connect_times_out_without_reply() {
    let net = MemoryNetwork::new();
    // Attached but no runtime reading its inbox.
    let _silent = net.attach(&adv(100), "lan");
    let edge = edge(&net, 1);

    let started = tokio::time::Instant::now();
    let err = edge.connect_to_rendezvous(adv(100)).await.unwrap_err();
    assert!(matches!(err, RdvError::Timeout { .. }));
    assert!(started.elapsed() >= Duration::from_secs(20));
}

#[tokio::test(start_paused = true)]
async fn connect_to_unreachable_peer_fails_fast() {
    let net = MemoryNetwork::new();
    let edge = edge(&net, 1);
    let err = edge.connect_to_rendezvous(adv(100)).await.unwrap_err();
    assert!(matches!(err, RdvError::Transport { .. }));
}

#[tokio::test(start_paused = true)]
async fn frames_do_not_cross_groups() {
    let net = MemoryNetwork::new();
    let mut other = config(100, PeerRole::Rendezvous);
    other.group_id = "another-group".into();
    let _rdv = spawn(&net, other);
    let edge = edge(&net, 1);

    let err = edge.connect_to_rendezvous(adv(100)).await.unwrap_err();
    assert!(matches!(err, RdvError::Timeout { .. }));
}

#[tokio::test(start_paused = true)]
async fn connect_by_id_resolves_from_store() {
    let net = MemoryNetwork::new();
    let _rdv = rendezvous(&net, 100);
    let (channels, store) = spawn(&net, config(1, PeerRole::Edge));
    let edge = channels.handle;

    let err = edge.connect_to_rendezvous_id(adv(100).peer_id).await.unwrap_err();
    assert!(matches!(err, RdvError::UnknownPeer(_)));

    store.publish(&adv(100), 60_000, 60_000).await.unwrap();
    edge.connect_to_rendezvous_id(adv(100).peer_id).await.unwrap();
    assert!(edge.is_connected().await);
}

#[tokio::test(start_paused = true)]
async fn lease_is_renewed_before_expiry() {
    let net = MemoryNetwork::new();
    let mut cfg = config(100, PeerRole::Rendezvous);
    cfg.server.lease_duration = Duration::from_secs(120);
    let rdv = spawn(&net, cfg).0.handle;
    let edge = edge(&net, 1);
    let mut edge_events = listen(&edge).await;
    let mut rdv_events = listen(&rdv).await;

    edge.connect_to_rendezvous(adv(100)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(10 * 60)).await;

    assert!(edge.is_connected().await);
    assert_eq!(rdv.connected_peers().await, vec![adv(1).peer_id]);

    let edge_kinds = drain(&mut edge_events);
    assert!(edge_kinds.contains(&EventKind::RdvReconnect));
    assert!(!edge_kinds.contains(&EventKind::RdvFailed));
    assert!(!drain(&mut rdv_events).contains(&EventKind::ClientFailed));
}

#[tokio::test(start_paused = true)]
async fn server_collects_silent_client() {
    let net = MemoryNetwork::new();
    let mut cfg = config(100, PeerRole::Rendezvous);
    cfg.server.lease_duration = Duration::from_secs(60);
    cfg.server.gc_interval = Duration::from_secs(30);
    let rdv = spawn(&net, cfg).0.handle;
    let mut rdv_events = listen(&rdv).await;
    let edge = edge(&net, 1);

    edge.connect_to_rendezvous(adv(100)).await.unwrap();
    // The edge dies and never renews.
    net.set_reachable(adv(1).peer_id, false);
    tokio::time::sleep(Duration::from_secs(3 * 60)).await;

    assert!(rdv.connected_peers().await.is_empty());
    let failed = drain(&mut rdv_events)
        .into_iter()
        .filter(|k| *k == EventKind::ClientFailed)
        .count();
    assert_eq!(failed, 1);
}

#[tokio::test(start_paused = true)]
async fn edge_fails_over_to_another_rendezvous() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();

    let net = MemoryNetwork::new();
    let mut first = config(100, PeerRole::Rendezvous);
    first.server.lease_duration = Duration::from_secs(120);
    let _r1 = spawn(&net, first);
    let mut second = config(101, PeerRole::Rendezvous);
    second.server.lease_duration = Duration::from_secs(120);
    let _r2 = spawn(&net, second);

    let edge = edge(&net, 1);
    let mut events = listen(&edge).await;
    net.add_candidate(adv(100));
    net.add_candidate(adv(101));
    tokio::time::sleep(Duration::from_secs(30)).await;

    let held = edge.connected_peers().await;
    assert_eq!(held.len(), 1);
    let lost = held[0];
    let spare = if lost == adv(100).peer_id {
        adv(101).peer_id
    } else {
        adv(100).peer_id
    };

    net.set_reachable(lost, false);
    tokio::time::sleep(Duration::from_secs(5 * 60)).await;

    assert_eq!(edge.connected_peers().await, vec![spare]);
    assert!(drain(&mut events).contains(&EventKind::RdvFailed));
    assert!(net.reported_failures().contains(&lost));
}

#[tokio::test(start_paused = true)]
async fn view_failure_drops_lease_immediately() {
    let net = MemoryNetwork::new();
    let _rdv = rendezvous(&net, 100);
    let edge = edge(&net, 1);
    let mut events = listen(&edge).await;

    edge.connect_to_rendezvous(adv(100)).await.unwrap();
    net.add_candidate(adv(100));
    settle().await;
    net.fail_candidate(adv(100).peer_id);
    settle().await;

    assert!(!edge.is_connected().await);
    assert!(drain(&mut events).contains(&EventKind::RdvFailed));
}

#[tokio::test(start_paused = true)]
async fn challenge_zero_drops_lease() {
    let net = MemoryNetwork::new();
    let _rdv = rendezvous(&net, 100);
    let edge = edge(&net, 1);
    let mut events = listen(&edge).await;

    edge.connect_to_rendezvous(adv(100)).await.unwrap();
    edge.challenge(adv(100).peer_id, 0).await.unwrap();
    settle().await;

    assert!(!edge.is_connected().await);
    assert_eq!(drain(&mut events), vec![EventKind::RdvConnect, EventKind::RdvFailed]);
}

#[tokio::test(start_paused = true)]
async fn voluntary_disconnect_reaches_rendezvous() {
    let net = MemoryNetwork::new();
    let rdv = rendezvous(&net, 100);
    let mut rdv_events = listen(&rdv).await;
    let edge = edge(&net, 1);

    edge.connect_to_rendezvous(adv(100)).await.unwrap();
    edge.disconnect_from_rendezvous(adv(100).peer_id).await.unwrap();
    settle().await;

    assert!(rdv.connected_peers().await.is_empty());
    assert_eq!(
        drain(&mut rdv_events),
        vec![EventKind::ClientConnect, EventKind::ClientDisconnect]
    );
}

#[tokio::test(start_paused = true)]
async fn disconnect_without_lease_is_rejected() {
    let net = MemoryNetwork::new();
    let rdv = rendezvous(&net, 100);
    let edge = edge(&net, 1);

    let err = edge.disconnect_from_rendezvous(adv(100).peer_id).await.unwrap_err();
    assert!(matches!(err, RdvError::NotConnected { .. }));

    edge.connect_to_rendezvous(adv(100)).await.unwrap();
    edge.disconnect_from_rendezvous(adv(100).peer_id).await.unwrap();
    let again = edge.disconnect_from_rendezvous(adv(100).peer_id).await;
    assert!(matches!(again, Err(RdvError::NotConnected { .. })));

    let err = rdv.disconnect_from_rendezvous(adv(1).peer_id).await.unwrap_err();
    assert!(matches!(err, RdvError::NotConnected { .. }));
}

#[tokio::test(start_paused = true)]
async fn role_switch_emits_events() {
    let net = MemoryNetwork::new();
    let rdv = rendezvous(&net, 100);
    let mut rdv_events = listen(&rdv).await;
    let peer = edge(&net, 1);
    let mut events = listen(&peer).await;

    peer.connect_to_rendezvous(adv(100)).await.unwrap();
    peer.become_rendezvous().await.unwrap();
    settle().await;

    assert_eq!(peer.role().await.unwrap(), PeerRole::Rendezvous);
    assert!(peer.is_connected().await);
    assert!(rdv.connected_peers().await.is_empty());
    assert!(drain(&mut events).contains(&EventKind::BecameRendezvous));
    assert!(drain(&mut rdv_events).contains(&EventKind::ClientDisconnect));

    let err = peer.connect_to_rendezvous(adv(100)).await.unwrap_err();
    assert!(matches!(err, RdvError::NotEdge));

    peer.become_edge().await.unwrap();
    settle().await;
    assert_eq!(peer.role().await.unwrap(), PeerRole::Edge);
    assert!(drain(&mut events).contains(&EventKind::BecameEdge));
}

#[tokio::test(start_paused = true)]
async fn shutdown_releases_leases_and_stops() {
    let net = MemoryNetwork::new();
    let rdv = rendezvous(&net, 100);
    let edge = edge(&net, 1);

    edge.connect_to_rendezvous(adv(100)).await.unwrap();
    edge.shutdown().await;
    settle().await;

    assert!(rdv.connected_peers().await.is_empty());
    assert!(!edge.is_connected().await);
    assert!(matches!(
        edge.connect_to_rendezvous(adv(100)).await,
        Err(RdvError::Shutdown)
    ));
}

#[tokio::test(start_paused = true)]
async fn removed_listener_stops_receiving() {
    let net = MemoryNetwork::new();
    let _rdv = rendezvous(&net, 100);
    let edge = edge(&net, 1);

    let (tx, mut rx) = mpsc::channel(16);
    let id = edge.add_listener(Arc::new(tx)).await.unwrap();
    assert!(edge.remove_listener(id).await);
    assert!(!edge.remove_listener(id).await);

    edge.connect_to_rendezvous(adv(100)).await.unwrap();
    assert!(rx.try_recv().is_err());
}
