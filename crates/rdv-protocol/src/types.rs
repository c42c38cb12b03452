use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::RdvError;

/// Service name of the lease protocol itself (connect/disconnect/reply).
pub const RDV_SERVICE: &str = "rdv";

/// Service name the walk forwarder delivers to.
pub const WALK_SERVICE: &str = "rdv-walk";

/// Service name used for subnet broadcast of propagated messages.
pub const PROPAGATE_SERVICE: &str = "rdv-propagate";

/// Upper bound on the hop count of any propagated or walked message.
pub const MAX_TTL: u32 = 10;

/// Current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── PeerId ─────────────────────────────────────────────────────────────

/// Overlay identity of a peer, 32 opaque bytes.
///
/// Displayed and parsed as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 32]);

impl PeerId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Fresh random identity.
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_string();
        write!(f, "PeerId({}...)", &hex[..12])
    }
}

impl FromStr for PeerId {
    type Err = RdvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RdvError::MalformedMessage {
            reason: format!("invalid peer id: {s}"),
        };
        if s.len() != 64 || !s.is_ascii() {
            return Err(invalid());
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk).map_err(|_| invalid())?;
            bytes[i] = u8::from_str_radix(pair, 16).map_err(|_| invalid())?;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── PeerAdvertisement ──────────────────────────────────────────────────

/// What a peer publishes about itself: identity, display name, route hints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAdvertisement {
    pub peer_id: PeerId,
    pub name: String,
    /// Transport-level addresses or relay hints, most preferred first.
    pub route_hints: Vec<String>,
}

/// SHA-256 of an advertisement's encoded content.
pub type AdvertisementDigest = [u8; 32];

impl PeerAdvertisement {
    pub fn new(peer_id: PeerId, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
            route_hints: Vec::new(),
        }
    }

    pub fn with_route_hint(mut self, hint: impl Into<String>) -> Self {
        self.route_hints.push(hint.into());
        self
    }

    /// Content digest; changes whenever any field changes.
    pub fn digest(&self) -> AdvertisementDigest {
        let bytes = rmp_serde::to_vec(self).unwrap_or_default();
        Sha256::digest(&bytes).into()
    }

    /// First route hint, if any.
    pub fn route_hint(&self) -> Option<&str> {
        self.route_hints.first().map(String::as_str)
    }
}

// ── ServiceAddress ─────────────────────────────────────────────────────

/// A (service name, service parameter) pair addressing a local handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceAddress {
    pub name: String,
    pub param: Option<String>,
}

impl ServiceAddress {
    pub fn new(name: impl Into<String>, param: Option<String>) -> Self {
        Self {
            name: name.into(),
            param,
        }
    }

    /// The lease protocol endpoint for a peer group.
    pub fn rendezvous(group: &str) -> Self {
        Self::new(RDV_SERVICE, Some(group.to_string()))
    }

    pub fn walk(group: &str) -> Self {
        Self::new(WALK_SERVICE, Some(group.to_string()))
    }

    pub fn propagate(group: &str) -> Self {
        Self::new(PROPAGATE_SERVICE, Some(group.to_string()))
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.param {
            Some(param) => write!(f, "{}/{}", self.name, param),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Role a peer plays in its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerRole {
    /// Lease-holding client of one or more rendezvous peers.
    Edge,
    /// Super-peer admitting edge clients.
    Rendezvous,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_hex_roundtrip() {
        let id = PeerId::from_bytes([0xab; 32]);
        let s = id.to_string();
        assert_eq!(s.len(), 64);
        assert!(s.starts_with("abab"));
        let parsed: PeerId = s.parse().expect("parse");
        assert_eq!(parsed, id);
    }

    #[test]
    fn peer_id_rejects_bad_hex() {
        assert!("zz".parse::<PeerId>().is_err());
        assert!("g".repeat(64).parse::<PeerId>().is_err());
    }

    #[test]
    fn peer_id_debug_is_short() {
        let id = PeerId::from_bytes([1; 32]);
        assert_eq!(format!("{id:?}"), "PeerId(010101010101...)");
    }

    #[test]
    fn digest_tracks_content() {
        let id = PeerId::from_bytes([7; 32]);
        let adv = PeerAdvertisement::new(id, "alice");
        let same = PeerAdvertisement::new(id, "alice");
        assert_eq!(adv.digest(), same.digest());

        let moved = adv.clone().with_route_hint("tcp://10.0.0.1:9701");
        assert_ne!(adv.digest(), moved.digest());
    }

    #[test]
    fn service_address_display() {
        assert_eq!(ServiceAddress::rendezvous("g1").to_string(), "rdv/g1");
        assert_eq!(ServiceAddress::new("chat", None).to_string(), "chat");
    }
}
