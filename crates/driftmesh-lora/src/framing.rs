//! Native binary framing for the serial radio link
//!
//! Command/response frames over a 115 200 baud serial stream:
//!
//! ```text
//! cmd(1) | len(2, BE) | flags(1) | payload(len)
//! ```
//!
//! The stream is byte-oriented; the parser accepts partial reads, rejects
//! oversize frames, and resynchronises past stray bytes by discarding one
//! byte at a time until a plausible header appears.

use driftmesh_core::errors::{CodecError, MeshError, Result};

// ----------------------------------------------------------------------------
// Commands and Responses
// ----------------------------------------------------------------------------

pub const CMD_SYNC: u8 = 0x01;
pub const CMD_CONFIG: u8 = 0x02;
pub const CMD_TX: u8 = 0x03;
pub const CMD_RX: u8 = 0x04;
pub const CMD_CAD: u8 = 0x05;
pub const CMD_STATUS: u8 = 0x06;

pub const RESP_ACK: u8 = 0x10;
pub const RESP_NACK: u8 = 0x11;
pub const RESP_RX: u8 = 0x12;
pub const RESP_CAD: u8 = 0x13;
pub const RESP_STATUS: u8 = 0x14;

/// Frames with payloads at or above this size are rejected
pub const MAX_FRAME_PAYLOAD: usize = 237;

const HEADER_LEN: usize = 4;

fn is_known_command(cmd: u8) -> bool {
    matches!(
        cmd,
        CMD_SYNC
            | CMD_CONFIG
            | CMD_TX
            | CMD_RX
            | CMD_CAD
            | CMD_STATUS
            | RESP_ACK
            | RESP_NACK
            | RESP_RX
            | RESP_CAD
            | RESP_STATUS
    )
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One framed command or response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u8,
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(command: u8, payload: Vec<u8>) -> Self {
        Self {
            command,
            flags: 0,
            payload,
        }
    }

    /// Serialize for the wire
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.payload.len() >= MAX_FRAME_PAYLOAD {
            return Err(MeshError::Codec(CodecError::FrameOversized {
                len: self.payload.len(),
                max: MAX_FRAME_PAYLOAD - 1,
            }));
        }
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.payload.len());
        bytes.push(self.command);
        bytes.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        bytes.push(self.flags);
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }
}

// ----------------------------------------------------------------------------
// RX Payload
// ----------------------------------------------------------------------------

/// Decoded RX response: link readings ahead of the received bytes
#[derive(Debug, Clone, PartialEq)]
pub struct RxPayload {
    /// Received signal strength in dBm
    pub rssi_dbm: i16,
    /// Signal-to-noise ratio in dB
    pub snr_db: f32,
    pub data: Vec<u8>,
}

impl RxPayload {
    /// Parse an RX response payload: `rssi(2, BE, biased by 32768) |
    /// snr(2, BE, ×10) | data`
    pub fn from_bytes(payload: &[u8]) -> Result<Self> {
        if payload.len() < 4 {
            return Err(MeshError::Codec(CodecError::FrameTooShort {
                len: payload.len(),
            }));
        }
        let rssi_raw = u16::from_be_bytes([payload[0], payload[1]]);
        let snr_raw = i16::from_be_bytes([payload[2], payload[3]]);
        Ok(Self {
            rssi_dbm: (i32::from(rssi_raw) - 32_768) as i16,
            snr_db: f32::from(snr_raw) / 10.0,
            data: payload[4..].to_vec(),
        })
    }

    /// Encode for the wire, used by the loopback tests
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + self.data.len());
        let rssi_raw = (i32::from(self.rssi_dbm) + 32_768) as u16;
        bytes.extend_from_slice(&rssi_raw.to_be_bytes());
        bytes.extend_from_slice(&((self.snr_db * 10.0) as i16).to_be_bytes());
        bytes.extend_from_slice(&self.data);
        bytes
    }
}

// ----------------------------------------------------------------------------
// Incremental Parser
// ----------------------------------------------------------------------------

/// Accumulates serial bytes and yields complete frames
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: Vec<u8>,
    /// Bytes discarded while resynchronising
    pub discarded: u64,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk from the serial stream; returns every frame that
    /// completed.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            // Resynchronise: discard until a known command byte leads
            while !self.buffer.is_empty() && !is_known_command(self.buffer[0]) {
                self.buffer.remove(0);
                self.discarded += 1;
            }
            if self.buffer.len() < HEADER_LEN {
                break;
            }

            let len = u16::from_be_bytes([self.buffer[1], self.buffer[2]]) as usize;
            if len >= MAX_FRAME_PAYLOAD {
                // Oversize claim: this header byte was noise
                self.buffer.remove(0);
                self.discarded += 1;
                continue;
            }
            if self.buffer.len() < HEADER_LEN + len {
                break;
            }

            let frame_bytes: Vec<u8> = self.buffer.drain(..HEADER_LEN + len).collect();
            frames.push(Frame {
                command: frame_bytes[0],
                flags: frame_bytes[3],
                payload: frame_bytes[HEADER_LEN..].to_vec(),
            });
        }
        frames
    }
}

// ----------------------------------------------------------------------------
// Config Payload
// ----------------------------------------------------------------------------

/// Serialize a radio configuration into a CONFIG frame payload
///
/// `freq(4, BE) | sf(1) | bw(4, BE) | cr(1) | power(1) | preamble(2, BE) |
/// sync_word(1)`
pub fn encode_config(config: &crate::config::RadioConfig) -> Vec<u8> {
    let mut payload = Vec::with_capacity(14);
    payload.extend_from_slice(&config.frequency_hz.to_be_bytes());
    payload.push(config.spreading_factor);
    payload.extend_from_slice(&config.bandwidth_hz.to_be_bytes());
    payload.push(config.coding_rate);
    payload.push(config.tx_power_dbm as u8);
    payload.extend_from_slice(&config.preamble_length.to_be_bytes());
    payload.push(config.sync_word);
    payload
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let frame = Frame::new(CMD_TX, vec![1, 2, 3, 4]);
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(bytes[0], CMD_TX);
        assert_eq!(u16::from_be_bytes([bytes[1], bytes[2]]), 4);

        let mut parser = FrameParser::new();
        let frames = parser.push_bytes(&bytes);
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn parser_handles_partial_reads() {
        let frame = Frame::new(RESP_RX, vec![9u8; 40]);
        let bytes = frame.to_bytes().unwrap();

        let mut parser = FrameParser::new();
        assert!(parser.push_bytes(&bytes[..3]).is_empty());
        assert!(parser.push_bytes(&bytes[3..20]).is_empty());
        let frames = parser.push_bytes(&bytes[20..]);
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn parser_skips_stray_bytes() {
        let frame = Frame::new(RESP_ACK, vec![]);
        let mut stream = vec![0xAA, 0xBB, 0xCC];
        stream.extend_from_slice(&frame.to_bytes().unwrap());

        let mut parser = FrameParser::new();
        let frames = parser.push_bytes(&stream);
        assert_eq!(frames, vec![frame]);
        assert_eq!(parser.discarded, 3);
    }

    #[test]
    fn oversize_frames_rejected() {
        let frame = Frame::new(CMD_TX, vec![0u8; MAX_FRAME_PAYLOAD]);
        assert!(frame.to_bytes().is_err());

        // A forged oversize header on the wire is skipped, and the valid
        // frame behind it still parses
        let mut stream = vec![CMD_TX, 0xFF, 0xFF, 0x00];
        let good = Frame::new(RESP_ACK, vec![0x55]);
        stream.extend_from_slice(&good.to_bytes().unwrap());

        let mut parser = FrameParser::new();
        let frames = parser.push_bytes(&stream);
        assert_eq!(frames, vec![good]);
    }

    #[test]
    fn back_to_back_frames() {
        let a = Frame::new(RESP_ACK, vec![]);
        let b = Frame::new(RESP_RX, RxPayload {
            rssi_dbm: -90,
            snr_db: 5.5,
            data: vec![1, 2, 3],
        }
        .to_bytes());
        let mut stream = a.to_bytes().unwrap();
        stream.extend_from_slice(&b.to_bytes().unwrap());

        let mut parser = FrameParser::new();
        let frames = parser.push_bytes(&stream);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], a);

        let rx = RxPayload::from_bytes(&frames[1].payload).unwrap();
        assert_eq!(rx.rssi_dbm, -90);
        assert!((rx.snr_db - 5.5).abs() < 0.01);
        assert_eq!(rx.data, vec![1, 2, 3]);
    }

    #[test]
    fn rx_payload_bias() {
        // -120 dBm encodes as 32768 - 120
        let encoded = RxPayload {
            rssi_dbm: -120,
            snr_db: -7.25,
            data: vec![],
        }
        .to_bytes();
        assert_eq!(u16::from_be_bytes([encoded[0], encoded[1]]), 32_648);
        let decoded = RxPayload::from_bytes(&encoded).unwrap();
        assert_eq!(decoded.rssi_dbm, -120);
        // SNR quantised to tenths
        assert!((decoded.snr_db - (-7.2)).abs() < 0.01);
    }

    #[test]
    fn config_payload_layout() {
        let payload = encode_config(&crate::config::RadioConfig::default());
        assert_eq!(payload.len(), 14);
        assert_eq!(
            u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
            868_100_000
        );
        assert_eq!(payload[4], 9);
        assert_eq!(payload[13], 0x2B);
    }
}
