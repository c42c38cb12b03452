/// LeaseConnection: one time-bounded relationship with a remote peer.
///
/// Pure state: every time-dependent query takes an explicit `now` (Unix ms).
/// Used on both sides: the edge holds one per rendezvous it leases from,
/// the rendezvous holds one per admitted client.
use crate::types::{AdvertisementDigest, PeerAdvertisement, PeerId};

/// Lifecycle position of a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// Never granted.
    Unleased,
    /// Granted and inside its window.
    Leased,
    /// Explicitly marked disconnected (voluntary or detected failure).
    Disconnected,
    /// Window elapsed without renewal.
    Expired,
}

#[derive(Debug, Clone)]
pub struct LeaseConnection {
    advertisement: PeerAdvertisement,
    lease_obtained_at: u64,
    lease_length: u64,
    renewal_margin: u64,
    connected: bool,
    granted: bool,
    /// A renewal request is in flight for the current window.
    renewal_pending: bool,
    /// Digest of the local advertisement last presented to this peer.
    presented_digest: Option<AdvertisementDigest>,
}

impl LeaseConnection {
    pub fn new(advertisement: PeerAdvertisement) -> Self {
        Self {
            advertisement,
            lease_obtained_at: 0,
            lease_length: 0,
            renewal_margin: 0,
            connected: false,
            granted: false,
            renewal_pending: false,
            presented_digest: None,
        }
    }

    /// Grant (or re-grant) the lease starting at `now`.
    pub fn connect(
        &mut self,
        advertisement: PeerAdvertisement,
        lease_length_ms: u64,
        renewal_margin_ms: u64,
        now: u64,
    ) {
        self.advertisement = advertisement;
        self.lease_obtained_at = now;
        self.lease_length = lease_length_ms;
        self.renewal_margin = renewal_margin_ms.min(lease_length_ms);
        self.connected = true;
        self.granted = true;
        self.renewal_pending = false;
    }

    pub fn peer_id(&self) -> PeerId {
        self.advertisement.peer_id
    }

    pub fn advertisement(&self) -> &PeerAdvertisement {
        &self.advertisement
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    pub fn lease_obtained_at(&self) -> u64 {
        self.lease_obtained_at
    }

    pub fn lease_length(&self) -> u64 {
        self.lease_length
    }

    pub fn expires_at(&self) -> u64 {
        self.lease_obtained_at.saturating_add(self.lease_length)
    }

    /// Milliseconds left in the current window (0 once expired).
    pub fn remaining(&self, now: u64) -> u64 {
        self.expires_at().saturating_sub(now)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at()
    }

    /// Connected and still inside the lease window.
    pub fn is_live(&self, now: u64) -> bool {
        self.connected && !self.is_expired(now)
    }

    /// `leaseObtainedAt + leaseLength - renewalMargin`.
    pub fn renewal_deadline(&self) -> u64 {
        self.expires_at().saturating_sub(self.renewal_margin)
    }

    /// Renewal is due and none is already in flight.
    pub fn needs_renewal(&self, now: u64) -> bool {
        self.connected && !self.renewal_pending && now >= self.renewal_deadline()
    }

    pub fn mark_renewal_sent(&mut self) {
        self.renewal_pending = true;
    }

    pub fn renewal_pending(&self) -> bool {
        self.renewal_pending
    }

    /// Remember which local advertisement this peer last saw.
    pub fn record_presented(&mut self, digest: AdvertisementDigest) {
        self.presented_digest = Some(digest);
    }

    /// Whether `latest` differs from what was last presented to the peer.
    pub fn advertisement_has_changed(&self, latest: &PeerAdvertisement) -> bool {
        match self.presented_digest {
            Some(digest) => digest != latest.digest(),
            None => false,
        }
    }

    /// Shrink the remaining window to `min(remaining, delay_ms)`.
    ///
    /// A non-positive delay disconnects immediately. Returns whether the
    /// lease is still connected afterwards. Never extends the window.
    pub fn challenge(&mut self, delay_ms: i64, now: u64) -> bool {
        if delay_ms <= 0 {
            self.connected = false;
            return false;
        }
        let capped = now
            .saturating_sub(self.lease_obtained_at)
            .saturating_add(delay_ms as u64);
        self.lease_length = self.lease_length.min(capped);
        self.connected
    }

    pub fn state(&self, now: u64) -> LeaseState {
        if !self.granted {
            LeaseState::Unleased
        } else if !self.connected {
            LeaseState::Disconnected
        } else if self.is_expired(now) {
            LeaseState::Expired
        } else {
            LeaseState::Leased
        }
    }
}
