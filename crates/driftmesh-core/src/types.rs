//! Core types for the driftmesh protocol
//!
//! This module defines the fundamental types used throughout the stack,
//! using newtype patterns for semantic validation and type safety.

use core::fmt;
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Node Hash
// ----------------------------------------------------------------------------

/// 16-byte address of a mesh node
///
/// Addresses are derived from identity public keys or assigned by foreign
/// mesh nodes. Short identifiers from legacy transports are left-padded
/// with zeros to the full 16 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeHash([u8; 16]);

impl NodeHash {
    pub const LEN: usize = 16;

    /// Special broadcast address (all 0xFF); no peer may adopt it
    pub const BROADCAST: Self = Self([0xFF; 16]);

    /// Create a new NodeHash from 16 bytes
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Reconstruct a full hash from a short identifier, left-padding with zeros
    pub fn from_short(bytes: &[u8]) -> Self {
        let mut hash = [0u8; 16];
        let len = core::cmp::min(bytes.len(), 16);
        hash[..len].copy_from_slice(&bytes[..len]);
        Self(hash)
    }

    /// Parse from a 32-character hex string
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// First 8 bytes, for transports with a short address schema
    pub fn short(&self) -> [u8; 8] {
        let mut short = [0u8; 8];
        short.copy_from_slice(&self.0[..8]);
        short
    }

    /// Check whether this is the broadcast address
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Hex rendering for table keys and logs
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for NodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for NodeHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ----------------------------------------------------------------------------
// Packet Id
// ----------------------------------------------------------------------------

/// Packet fingerprint used for deduplication
///
/// Eight random bytes, rendered as 16 hex characters on the wire and in
/// logs. Generated once per send; equality on the id is packet identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PacketId([u8; 8]);

impl PacketId {
    /// Generate a fresh random packet id
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Create from raw bytes
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Parse from the 16-hex-character wire form
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 8] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// 16-bit short id used in fragment headers
    pub fn short_id(&self) -> u16 {
        u16::from_be_bytes([self.0[0], self.0[1]])
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

// ----------------------------------------------------------------------------
// Transport Tag
// ----------------------------------------------------------------------------

/// Identifies a transport family within the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TransportTag {
    /// Short-range high-bandwidth adjacency (e.g. BLE mesh)
    ShortRange,
    /// Long-range narrow-band radio (e.g. LoRa)
    LongRange,
    /// Foreign mesh protocol interop
    Fmp,
}

impl TransportTag {
    /// Stable short name used in link-metric keys and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportTag::ShortRange => "short_range",
            TransportTag::LongRange => "long_range",
            TransportTag::Fmp => "fmp",
        }
    }
}

impl fmt::Display for TransportTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// Time-to-Live
// ----------------------------------------------------------------------------

/// Time-to-live for packet relaying
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ttl(u8);

impl Ttl {
    /// Default TTL for new packets
    pub const DEFAULT: Self = Self(8);

    /// Create a new TTL
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    /// Get the raw value
    pub fn value(&self) -> u8 {
        self.0
    }

    /// Decrement, returning None once exhausted
    pub fn decrement(self) -> Option<Self> {
        if self.0 > 0 {
            Some(Self(self.0 - 1))
        } else {
            None
        }
    }
}

impl Default for Ttl {
    fn default() -> Self {
        Self::DEFAULT
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create a timestamp from raw milliseconds
    pub const fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Get the raw milliseconds
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Milliseconds elapsed since an earlier timestamp, saturating at zero
    pub fn millis_since(&self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_hash_from_short_pads() {
        let hash = NodeHash::from_short(&[1, 2, 3, 4]);
        assert_eq!(&hash.as_bytes()[..4], &[1, 2, 3, 4]);
        assert_eq!(&hash.as_bytes()[4..], &[0u8; 12]);
    }

    #[test]
    fn broadcast_detection() {
        assert!(NodeHash::BROADCAST.is_broadcast());
        assert!(!NodeHash::new([0x01; 16]).is_broadcast());
    }

    #[test]
    fn node_hash_hex_round_trip() {
        let hash = NodeHash::new([0xAB; 16]);
        let parsed = NodeHash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, parsed);
        assert!(NodeHash::from_hex("deadbeef").is_none());
    }

    #[test]
    fn packet_id_hex_round_trip() {
        let id = PacketId::from_bytes([0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF]);
        assert_eq!(id.to_string(), "0123456789abcdef");
        assert_eq!(PacketId::from_hex("0123456789abcdef"), Some(id));
        assert_eq!(id.short_id(), 0x0123);
    }

    #[test]
    fn random_packet_ids_differ() {
        // Collisions across a handful of draws would indicate a broken RNG
        let ids: Vec<PacketId> = (0..16).map(|_| PacketId::random()).collect();
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn ttl_decrement() {
        let mut ttl = Ttl::new(2);
        ttl = ttl.decrement().unwrap();
        ttl = ttl.decrement().unwrap();
        assert_eq!(ttl.value(), 0);
        assert!(ttl.decrement().is_none());
    }
}
