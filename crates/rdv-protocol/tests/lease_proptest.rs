use proptest::prelude::*;
use rdv_protocol::{
    Admission, Disseminator, LeaseConnection, Message, PeerAdvertisement, PeerId, PeerRole,
    RendezvousServer, ServerConfig,
};
use std::time::Duration;

/// Deterministic advertisement from a seed.
fn adv(seed: u8) -> PeerAdvertisement {
    PeerAdvertisement::new(PeerId::from_bytes([seed; 32]), format!("peer-{seed}"))
}

const START: u64 = 1_700_000_000_000;

proptest! {
    /// A live lease is always inside its window.
    #[test]
    fn live_lease_is_never_past_expiry(
        lease in 0u64..10_000_000,
        margin in 0u64..10_000_000,
        offset in 0u64..20_000_000,
    ) {
        let mut conn = LeaseConnection::new(adv(1));
        conn.connect(adv(1), lease, margin, START);
        let now = START + offset;
        if conn.is_live(now) {
            prop_assert!(now < conn.expires_at());
        }
        prop_assert!(conn.renewal_deadline() <= conn.expires_at());
        prop_assert!(conn.renewal_deadline() >= START);
    }

    /// Challenging a lease can only shorten it.
    #[test]
    fn challenge_never_extends(
        lease in 1u64..10_000_000,
        delay in -1_000i64..20_000_000,
        offset in 0u64..10_000_000,
    ) {
        let mut conn = LeaseConnection::new(adv(1));
        conn.connect(adv(1), lease, lease / 3, START);
        let before = conn.expires_at();
        let now = START + offset;

        let still_connected = conn.challenge(delay, now);

        prop_assert!(conn.expires_at() <= before);
        if delay <= 0 {
            prop_assert!(!still_connected);
            prop_assert!(!conn.is_live(now));
        } else {
            prop_assert!(conn.expires_at() <= now.max(START) + delay as u64);
        }
    }

    /// A rendezvous never admits more than `max_clients`.
    #[test]
    fn server_respects_capacity(
        max_clients in 0usize..8,
        requests in prop::collection::vec(0u8..32, 0..64),
    ) {
        let config = ServerConfig {
            max_clients,
            lease_duration: Duration::from_secs(60),
            ..Default::default()
        };
        let mut server = RendezvousServer::new(adv(200), config);
        for (i, seed) in requests.iter().enumerate() {
            server.on_lease_request(adv(*seed), START + i as u64);
            prop_assert!(server.client_count() <= max_clients);
        }
    }

    /// Stamped headers stay within the hop bound and each id is admitted once.
    #[test]
    fn ttl_is_bounded_and_ids_admitted_once(
        max_ttl in 1u32..16,
        ttl in 0u32..64,
    ) {
        let mut origin = Disseminator::with_limits(adv(1).peer_id, max_ttl, 64);
        let mut msg = Message::new(b"x".to_vec());
        let plan = origin.propagate(&mut msg, ttl, PeerRole::Edge, &[]);

        if ttl == 0 {
            prop_assert!(plan.is_none());
            prop_assert!(msg.header.is_none());
        } else {
            let plan = plan.unwrap();
            prop_assert!(plan.header.ttl <= max_ttl);
            prop_assert_eq!(plan.header.path.clone(), vec![adv(1).peer_id]);

            let mut receiver = Disseminator::with_limits(adv(2).peer_id, max_ttl, 64);
            prop_assert_eq!(receiver.admit(&plan.header), Admission::Fresh);
            prop_assert_eq!(receiver.admit(&plan.header), Admission::Duplicate);
            // Our own message coming back is never fresh.
            prop_assert_eq!(origin.admit(&plan.header), Admission::Duplicate);
        }
    }
}
