//! Legacy frame schema of the external short-range mesh
//!
//! The short-range stack predates 16-byte addressing: frames carry an
//! 8-byte sender, an optional 8-byte recipient, and a one-byte frame
//! type from a fixed table. Mesh packets travel inside the frame payload;
//! the two-field addresses exist for the legacy stack's own routing.

use driftmesh_core::packet::PacketType;

// ----------------------------------------------------------------------------
// Frame Types
// ----------------------------------------------------------------------------

/// Fixed legacy type bytes
pub mod frame_type {
    pub const ANNOUNCE: u8 = 0x01;
    pub const DATA: u8 = 0x02;
    pub const HANDSHAKE: u8 = 0x10;
    pub const FRAGMENT: u8 = 0x20;
    pub const ACK: u8 = 0x30;
}

/// Look up the legacy type byte for a packet type
pub fn type_byte(packet_type: PacketType) -> u8 {
    match packet_type {
        PacketType::Announce => frame_type::ANNOUNCE,
        PacketType::Data => frame_type::DATA,
        PacketType::Handshake => frame_type::HANDSHAKE,
        PacketType::Fragment => frame_type::FRAGMENT,
        PacketType::Ack => frame_type::ACK,
    }
}

/// Reverse lookup; unknown bytes fall back to data
pub fn packet_type(byte: u8) -> PacketType {
    match byte {
        frame_type::ANNOUNCE => PacketType::Announce,
        frame_type::HANDSHAKE => PacketType::Handshake,
        frame_type::FRAGMENT => PacketType::Fragment,
        frame_type::ACK => PacketType::Ack,
        _ => PacketType::Data,
    }
}

// ----------------------------------------------------------------------------
// Legacy Frame
// ----------------------------------------------------------------------------

/// One frame on the external short-range mesh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyFrame {
    /// First 8 bytes of the sender's mesh address
    pub sender_id: [u8; 8],
    /// First 8 bytes of the recipient, or none for broadcast
    pub recipient_id: Option<[u8; 8]>,
    /// Type byte from the fixed table
    pub frame_type: u8,
    pub payload: Vec<u8>,
}
