//! Foreign Mesh Protocol wire codec
//!
//! FMP packets are exchanged with existing radio nodes that speak the
//! foreign mesh protocol. Layout:
//!
//! ```text
//! header(2) | destination_hash(16) | transport_id(16) | payload
//! ```
//!
//! Header byte 0 packs three fields: bits 7–6 the packet type, bits 5–4
//! the destination type, bits 3–0 the hop count. Header byte 1 is a free
//! context value.

use driftmesh_core::errors::{CodecError, MeshError, Result};
use driftmesh_core::types::NodeHash;

// ----------------------------------------------------------------------------
// Header Fields
// ----------------------------------------------------------------------------

/// Packet type, bits 7–6 of the first header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FmpPacketType {
    Data = 0b00,
    Announce = 0b01,
    LinkRequest = 0b10,
    Proof = 0b11,
}

impl FmpPacketType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => FmpPacketType::Data,
            0b01 => FmpPacketType::Announce,
            0b10 => FmpPacketType::LinkRequest,
            _ => FmpPacketType::Proof,
        }
    }
}

/// Destination type, bits 5–4 of the first header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FmpDestinationType {
    Single = 0b00,
    Group = 0b01,
    Plain = 0b10,
    Link = 0b11,
}

impl FmpDestinationType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => FmpDestinationType::Single,
            0b01 => FmpDestinationType::Group,
            0b10 => FmpDestinationType::Plain,
            _ => FmpDestinationType::Link,
        }
    }
}

/// Hop ceiling imposed by the 4-bit header field
pub const FMP_MAX_HOPS: u8 = 15;

/// Fixed bytes ahead of the payload
pub const FMP_HEADER_SIZE: usize = 2 + 16 + 16;

// ----------------------------------------------------------------------------
// Packet
// ----------------------------------------------------------------------------

/// One foreign mesh packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FmpPacket {
    pub packet_type: FmpPacketType,
    pub destination_type: FmpDestinationType,
    /// Hop count, 0..=15
    pub hops: u8,
    pub context: u8,
    pub destination_hash: NodeHash,
    /// Identity of the node that put this packet on the air
    pub transport_id: NodeHash,
    pub payload: Vec<u8>,
}

impl FmpPacket {
    /// Serialize to the wire
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(FMP_HEADER_SIZE + self.payload.len());
        let header = ((self.packet_type as u8) << 6)
            | ((self.destination_type as u8) << 4)
            | (self.hops & 0x0F);
        bytes.push(header);
        bytes.push(self.context);
        bytes.extend_from_slice(self.destination_hash.as_bytes());
        bytes.extend_from_slice(self.transport_id.as_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Parse from the wire
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FMP_HEADER_SIZE {
            return Err(MeshError::Codec(CodecError::ForeignPacket {
                reason: format!("packet too short ({} bytes)", bytes.len()),
            }));
        }
        let header = bytes[0];
        let dest_bytes: [u8; 16] = bytes[2..18]
            .try_into()
            .map_err(|_| MeshError::Codec(CodecError::ForeignPacket {
                reason: "bad destination hash".into(),
            }))?;
        let transport_bytes: [u8; 16] = bytes[18..34]
            .try_into()
            .map_err(|_| MeshError::Codec(CodecError::ForeignPacket {
                reason: "bad transport id".into(),
            }))?;

        Ok(Self {
            packet_type: FmpPacketType::from_bits(header >> 6),
            destination_type: FmpDestinationType::from_bits(header >> 4),
            hops: header & 0x0F,
            context: bytes[1],
            destination_hash: NodeHash::new(dest_bytes),
            transport_id: NodeHash::new(transport_bytes),
            payload: bytes[FMP_HEADER_SIZE..].to_vec(),
        })
    }

    /// True for plain-addressed packets and the all-ones destination
    pub fn is_broadcast(&self) -> bool {
        self.destination_type == FmpDestinationType::Plain
            || self.destination_hash.is_broadcast()
    }

    /// Copy for retransmission with the hop count bumped, saturating at
    /// the 4-bit ceiling
    pub fn hop(&self) -> FmpPacket {
        let mut hopped = self.clone();
        hopped.hops = (self.hops + 1).min(FMP_MAX_HOPS);
        hopped
    }
}

// ----------------------------------------------------------------------------
// Announce Payload
// ----------------------------------------------------------------------------

/// Payload of an FMP announce
///
/// `identity_hash(16) | public_key(32) | app_data_len(4, BE) | app_data`.
/// The public key is carried and stored but not yet validated; a signed
/// announce scheme is still pending on the foreign side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FmpAnnounce {
    pub identity_hash: NodeHash,
    pub public_key: [u8; 32],
    pub app_data: Option<Vec<u8>>,
}

impl FmpAnnounce {
    pub fn to_bytes(&self) -> Vec<u8> {
        let app_data = self.app_data.as_deref().unwrap_or(&[]);
        let mut bytes = Vec::with_capacity(16 + 32 + 4 + app_data.len());
        bytes.extend_from_slice(self.identity_hash.as_bytes());
        bytes.extend_from_slice(&self.public_key);
        bytes.extend_from_slice(&(app_data.len() as u32).to_be_bytes());
        bytes.extend_from_slice(app_data);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 52 {
            return Err(MeshError::Codec(CodecError::ForeignPacket {
                reason: format!("announce too short ({} bytes)", bytes.len()),
            }));
        }
        let identity_bytes: [u8; 16] = bytes[..16]
            .try_into()
            .map_err(|_| MeshError::Codec(CodecError::ForeignPacket {
                reason: "bad announce identity".into(),
            }))?;
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(&bytes[16..48]);
        let len_bytes: [u8; 4] = bytes[48..52]
            .try_into()
            .map_err(|_| MeshError::Codec(CodecError::ForeignPacket {
                reason: "bad announce length".into(),
            }))?;
        let app_data_len = u32::from_be_bytes(len_bytes) as usize;
        if bytes.len() < 52 + app_data_len {
            return Err(MeshError::Codec(CodecError::ForeignPacket {
                reason: "announce app data truncated".into(),
            }));
        }
        let app_data = if app_data_len > 0 {
            Some(bytes[52..52 + app_data_len].to_vec())
        } else {
            None
        };
        Ok(Self {
            identity_hash: NodeHash::new(identity_bytes),
            public_key,
            app_data,
        })
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn node(byte: u8) -> NodeHash {
        NodeHash::new([byte; 16])
    }

    #[test]
    fn header_bit_packing() {
        let packet = FmpPacket {
            packet_type: FmpPacketType::Announce,
            destination_type: FmpDestinationType::Plain,
            hops: 5,
            context: 0x42,
            destination_hash: node(1),
            transport_id: node(2),
            payload: vec![],
        };
        let bytes = packet.to_bytes();
        // 01 (announce) | 10 (plain) | 0101 (hops)
        assert_eq!(bytes[0], 0b0110_0101);
        assert_eq!(bytes[1], 0x42);
        assert_eq!(FmpPacket::from_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn wire_round_trip_all_types() {
        for (packet_type, destination_type) in [
            (FmpPacketType::Data, FmpDestinationType::Single),
            (FmpPacketType::Announce, FmpDestinationType::Group),
            (FmpPacketType::LinkRequest, FmpDestinationType::Link),
            (FmpPacketType::Proof, FmpDestinationType::Plain),
        ] {
            let packet = FmpPacket {
                packet_type,
                destination_type,
                hops: 15,
                context: 0,
                destination_hash: node(9),
                transport_id: node(8),
                payload: b"body".to_vec(),
            };
            assert_eq!(FmpPacket::from_bytes(&packet.to_bytes()).unwrap(), packet);
        }
    }

    #[test]
    fn truncated_packet_rejected() {
        let packet = FmpPacket {
            packet_type: FmpPacketType::Data,
            destination_type: FmpDestinationType::Single,
            hops: 0,
            context: 0,
            destination_hash: node(1),
            transport_id: node(2),
            payload: vec![],
        };
        let bytes = packet.to_bytes();
        assert!(FmpPacket::from_bytes(&bytes[..FMP_HEADER_SIZE - 1]).is_err());
        assert!(FmpPacket::from_bytes(&[]).is_err());
    }

    #[test]
    fn broadcast_detection() {
        let mut packet = FmpPacket {
            packet_type: FmpPacketType::Data,
            destination_type: FmpDestinationType::Single,
            hops: 0,
            context: 0,
            destination_hash: node(1),
            transport_id: node(2),
            payload: vec![],
        };
        assert!(!packet.is_broadcast());

        packet.destination_type = FmpDestinationType::Plain;
        assert!(packet.is_broadcast());

        packet.destination_type = FmpDestinationType::Single;
        packet.destination_hash = NodeHash::BROADCAST;
        assert!(packet.is_broadcast());
    }

    #[test]
    fn hop_saturates() {
        let packet = FmpPacket {
            packet_type: FmpPacketType::Data,
            destination_type: FmpDestinationType::Single,
            hops: 14,
            context: 0,
            destination_hash: node(1),
            transport_id: node(2),
            payload: vec![],
        };
        assert_eq!(packet.hop().hops, 15);
        assert_eq!(packet.hop().hop().hops, 15);
    }

    #[test]
    fn announce_round_trip() {
        let announce = FmpAnnounce {
            identity_hash: node(0x01),
            public_key: [0x02; 32],
            app_data: Some(b"driftmesh".to_vec()),
        };
        assert_eq!(FmpAnnounce::from_bytes(&announce.to_bytes()).unwrap(), announce);

        let bare = FmpAnnounce {
            identity_hash: node(0x03),
            public_key: [0x04; 32],
            app_data: None,
        };
        assert_eq!(FmpAnnounce::from_bytes(&bare.to_bytes()).unwrap(), bare);
    }

    #[test]
    fn announce_truncation_rejected() {
        let announce = FmpAnnounce {
            identity_hash: node(0x01),
            public_key: [0x02; 32],
            app_data: Some(vec![1, 2, 3]),
        };
        let bytes = announce.to_bytes();
        // Cut into the app data
        assert!(FmpAnnounce::from_bytes(&bytes[..bytes.len() - 1]).is_err());
        assert!(FmpAnnounce::from_bytes(&bytes[..40]).is_err());
    }
}
