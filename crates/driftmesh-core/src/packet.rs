//! Universal packet model and binary wire format
//!
//! Every transport carries the same packet value; transports that need a
//! byte stream use the fixed big-endian wire layout below. Packet equality
//! is defined solely by the packet id, which doubles as the dedup
//! fingerprint.
//!
//! ## Wire Layout
//!
//! ```text
//! type(1) | flags(1) | hops(1) | ttl(1) | timestamp(8, BE) |
//! packet_id(8) | source(16) | destination(16) | payload_len(4, BE) | payload
//! ```

use serde::{Deserialize, Serialize};

use crate::errors::{MeshError, PacketError, Result};
use crate::types::{NodeHash, PacketId, Timestamp, TransportTag, Ttl};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Fixed header size ahead of the payload
pub const HEADER_SIZE: usize = 56;

/// Hard ceiling on hop counts, matching the 4-bit foreign mesh field
pub const MAX_HOPS: u8 = 15;

/// Flag bit: delivery should be retried through the pending queue
const FLAG_RELIABLE: u8 = 0x01;

// ----------------------------------------------------------------------------
// Packet Type
// ----------------------------------------------------------------------------

/// Packet types carried across all transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    /// Application payload
    Data = 0x01,
    /// Identity and path advertisement
    Announce = 0x02,
    /// Key agreement message
    Handshake = 0x03,
    /// Delivery acknowledgment
    Ack = 0x04,
    /// Piece of a fragmented payload
    Fragment = 0x05,
}

impl PacketType {
    /// Convert from the raw wire byte
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(PacketType::Data),
            0x02 => Ok(PacketType::Announce),
            0x03 => Ok(PacketType::Handshake),
            0x04 => Ok(PacketType::Ack),
            0x05 => Ok(PacketType::Fragment),
            _ => Err(PacketError::UnknownPacketType { value }.into()),
        }
    }

    /// Raw wire byte
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

// ----------------------------------------------------------------------------
// Packet
// ----------------------------------------------------------------------------

/// Universal message unit of the mesh
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    /// Packet fingerprint; identity under equality and dedup
    pub id: PacketId,
    /// Originating node
    pub source: NodeHash,
    /// Target node, or [`NodeHash::BROADCAST`]
    pub destination: NodeHash,
    /// Packet type
    pub packet_type: PacketType,
    /// Relay hops taken so far
    pub hops: u8,
    /// Remaining time-to-live
    pub ttl: Ttl,
    /// Creation time in milliseconds
    pub timestamp: Timestamp,
    /// Whether delivery should be retried on failure
    pub reliable: bool,
    /// Application payload
    pub payload: Vec<u8>,
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Packet {}

impl Packet {
    /// Create a new packet with a fresh random id
    pub fn new(
        source: NodeHash,
        destination: NodeHash,
        packet_type: PacketType,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id: PacketId::random(),
            source,
            destination,
            packet_type,
            hops: 0,
            ttl: Ttl::DEFAULT,
            timestamp: Timestamp::now(),
            reliable: false,
            payload,
        }
    }

    /// Create a data packet addressed to a single node
    pub fn new_data(source: NodeHash, destination: NodeHash, payload: Vec<u8>) -> Self {
        Self::new(source, destination, PacketType::Data, payload)
    }

    /// Create a broadcast data packet
    pub fn new_broadcast(source: NodeHash, payload: Vec<u8>) -> Self {
        Self::new(source, NodeHash::BROADCAST, PacketType::Data, payload)
    }

    /// Create an announce broadcast
    pub fn new_announce(source: NodeHash, payload: Vec<u8>) -> Self {
        Self::new(source, NodeHash::BROADCAST, PacketType::Announce, payload)
    }

    /// Mark the packet for store-and-forward retry
    pub fn reliable(mut self) -> Self {
        self.reliable = true;
        self
    }

    /// Override the default TTL
    pub fn with_ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = ttl;
        self
    }

    /// Check whether this packet is addressed to everyone
    pub fn is_broadcast(&self) -> bool {
        self.destination.is_broadcast()
    }

    /// Produce the relayed copy of this packet
    ///
    /// Hops strictly increase and TTL strictly decreases; `None` once the
    /// TTL is exhausted or the hop ceiling is reached.
    pub fn hop(&self) -> Option<Packet> {
        if self.hops >= MAX_HOPS {
            return None;
        }
        let ttl = self.ttl.decrement()?;
        let mut relayed = self.clone();
        relayed.hops += 1;
        relayed.ttl = ttl;
        Some(relayed)
    }

    /// Validate structural invariants
    pub fn validate(&self, max_payload: usize) -> Result<()> {
        if self.payload.len() > max_payload {
            return Err(PacketError::PayloadTooLarge {
                max: max_payload,
                actual: self.payload.len(),
            }
            .into());
        }
        if self.hops > self.ttl.value() {
            return Err(PacketError::HopsExceedTtl {
                hops: self.hops,
                ttl: self.ttl.value(),
            }
            .into());
        }
        if self.hops > MAX_HOPS {
            return Err(MeshError::malformed("hop count exceeds protocol maximum"));
        }
        Ok(())
    }

    /// Serialize to the wire format
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        bytes.push(self.packet_type.as_u8());
        bytes.push(if self.reliable { FLAG_RELIABLE } else { 0 });
        bytes.push(self.hops);
        bytes.push(self.ttl.value());
        bytes.extend_from_slice(&self.timestamp.as_millis().to_be_bytes());
        bytes.extend_from_slice(self.id.as_bytes());
        bytes.extend_from_slice(self.source.as_bytes());
        bytes.extend_from_slice(self.destination.as_bytes());
        bytes.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Deserialize from the wire format
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(PacketError::Truncated {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            }
            .into());
        }

        let packet_type = PacketType::from_u8(bytes[0])?;
        let flags = bytes[1];
        let hops = bytes[2];
        let ttl = Ttl::new(bytes[3]);

        let timestamp_bytes: [u8; 8] = bytes[4..12]
            .try_into()
            .map_err(|_| MeshError::malformed("invalid timestamp"))?;
        let timestamp = Timestamp::new(u64::from_be_bytes(timestamp_bytes));
        let id_bytes: [u8; 8] = bytes[12..20]
            .try_into()
            .map_err(|_| MeshError::malformed("invalid packet id"))?;
        let id = PacketId::from_bytes(id_bytes);
        let source_bytes: [u8; 16] = bytes[20..36]
            .try_into()
            .map_err(|_| MeshError::malformed("invalid source hash"))?;
        let source = NodeHash::new(source_bytes);
        let dest_bytes: [u8; 16] = bytes[36..52]
            .try_into()
            .map_err(|_| MeshError::malformed("invalid destination hash"))?;
        let destination = NodeHash::new(dest_bytes);

        let len_bytes: [u8; 4] = bytes[52..56]
            .try_into()
            .map_err(|_| MeshError::malformed("invalid payload length"))?;
        let payload_len = u32::from_be_bytes(len_bytes) as usize;
        if bytes.len() < HEADER_SIZE + payload_len {
            return Err(PacketError::Truncated {
                expected: HEADER_SIZE + payload_len,
                actual: bytes.len(),
            }
            .into());
        }
        let payload = bytes[HEADER_SIZE..HEADER_SIZE + payload_len].to_vec();

        Ok(Self {
            id,
            source,
            destination,
            packet_type,
            hops,
            ttl,
            timestamp,
            reliable: flags & FLAG_RELIABLE != 0,
            payload,
        })
    }
}

// ----------------------------------------------------------------------------
// Transport Metadata
// ----------------------------------------------------------------------------

/// Link-level observations attached to a received packet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportMetadata {
    /// Transport the packet arrived on
    pub transport: TransportTag,
    /// Received signal strength in dBm, where the link reports it
    pub rssi: Option<i16>,
    /// Signal-to-noise ratio in dB
    pub snr: Option<f32>,
    /// Arrival time
    pub timestamp: Timestamp,
    /// Hop count observed on arrival
    pub hops: u8,
    /// One-way link latency estimate in milliseconds
    pub link_latency_ms: Option<u64>,
}

impl TransportMetadata {
    /// Metadata with only the transport tag and arrival time populated
    pub fn for_transport(transport: TransportTag) -> Self {
        Self {
            transport,
            rssi: None,
            snr: None,
            timestamp: Timestamp::now(),
            hops: 0,
            link_latency_ms: None,
        }
    }

    pub fn with_signal(mut self, rssi: i16, snr: f32) -> Self {
        self.rssi = Some(rssi);
        self.snr = Some(snr);
        self
    }

    pub fn with_hops(mut self, hops: u8) -> Self {
        self.hops = hops;
        self
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
