//! KISS TNC framing for the FMP-capable radio firmware
//!
//! Frames are `FEND | cmd | escaped payload | FEND`. Byte stuffing
//! substitutes FEND with FESC TFEND and FESC with FESC TFESC inside the
//! payload. The low nibble of the command byte selects the KISS command;
//! hardware parameters ride on SETHARDWARE with a one-byte sub-command id.

use driftmesh_core::errors::{CodecError, MeshError, Result};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

pub const FEND: u8 = 0xC0;
pub const FESC: u8 = 0xDB;
pub const TFEND: u8 = 0xDC;
pub const TFESC: u8 = 0xDD;

/// KISS commands (low nibble of the command byte)
pub const CMD_DATA: u8 = 0x00;
pub const CMD_SET_HARDWARE: u8 = 0x06;

/// Hardware sub-command ids carried in the first SETHARDWARE payload byte
pub mod hardware {
    pub const FREQUENCY: u8 = 0x01;
    pub const BANDWIDTH: u8 = 0x02;
    pub const SPREADING_FACTOR: u8 = 0x03;
    pub const CODING_RATE: u8 = 0x04;
    pub const TX_POWER: u8 = 0x05;
    pub const READY: u8 = 0x06;
    pub const RX_MODE: u8 = 0x07;
    pub const TX_MODE: u8 = 0x08;
    pub const RSSI: u8 = 0x09;
    pub const SNR: u8 = 0x0A;
    pub const SYNC_WORD: u8 = 0x0B;
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One KISS frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KissFrame {
    pub command: u8,
    pub payload: Vec<u8>,
}

impl KissFrame {
    pub fn data(payload: Vec<u8>) -> Self {
        Self {
            command: CMD_DATA,
            payload,
        }
    }

    /// SETHARDWARE frame carrying one parameter
    pub fn set_hardware(sub_command: u8, value: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(1 + value.len());
        payload.push(sub_command);
        payload.extend_from_slice(value);
        Self {
            command: CMD_SET_HARDWARE,
            payload,
        }
    }

    /// Escape and delimit for the wire
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.payload.len() + 4);
        bytes.push(FEND);
        bytes.push(self.command);
        for &byte in &self.payload {
            match byte {
                FEND => bytes.extend_from_slice(&[FESC, TFEND]),
                FESC => bytes.extend_from_slice(&[FESC, TFESC]),
                other => bytes.push(other),
            }
        }
        bytes.push(FEND);
        bytes
    }
}

// ----------------------------------------------------------------------------
// Link Readings
// ----------------------------------------------------------------------------

/// Decode an RSSI report: one byte, signed dBm
pub fn decode_rssi(byte: u8) -> i16 {
    i16::from(byte as i8)
}

/// Decode an SNR report: one signed byte scaled by 4
pub fn decode_snr(byte: u8) -> f32 {
    f32::from(byte as i8) / 4.0
}

// ----------------------------------------------------------------------------
// Incremental Decoder
// ----------------------------------------------------------------------------

/// Accumulates serial bytes and yields unescaped KISS frames
///
/// Bytes outside frame delimiters are dropped. A dangling escape at a
/// frame end makes the frame malformed; the decoder counts it and moves
/// on.
#[derive(Debug, Default)]
pub struct KissDecoder {
    in_frame: bool,
    escaped: bool,
    current: Vec<u8>,
    /// Frames dropped for malformed escaping
    pub malformed: u64,
}

impl KissDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed serial bytes; returns every frame completed by this chunk
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<KissFrame> {
        let mut frames = Vec::new();
        for &byte in bytes {
            if !self.in_frame {
                if byte == FEND {
                    self.in_frame = true;
                    self.escaped = false;
                    self.current.clear();
                }
                continue;
            }

            match byte {
                FEND => {
                    if self.escaped {
                        // Escape sequence cut off by the delimiter
                        self.malformed += 1;
                        self.escaped = false;
                        self.current.clear();
                        // Stay in-frame: this FEND also opens the next frame
                        continue;
                    }
                    // Back-to-back FENDs are idle keep-alives
                    if !self.current.is_empty() {
                        let command = self.current[0];
                        frames.push(KissFrame {
                            command,
                            payload: self.current[1..].to_vec(),
                        });
                        self.current.clear();
                    }
                }
                FESC => {
                    if self.escaped {
                        self.malformed += 1;
                        self.abort_frame();
                    } else {
                        self.escaped = true;
                    }
                }
                TFEND if self.escaped => {
                    self.current.push(FEND);
                    self.escaped = false;
                }
                TFESC if self.escaped => {
                    self.current.push(FESC);
                    self.escaped = false;
                }
                other => {
                    if self.escaped {
                        self.malformed += 1;
                        self.abort_frame();
                    } else {
                        self.current.push(other);
                    }
                }
            }
        }
        frames
    }

    fn abort_frame(&mut self) {
        self.in_frame = false;
        self.escaped = false;
        self.current.clear();
    }
}

/// Validate and split a SETHARDWARE payload into (sub-command, value)
pub fn parse_hardware(payload: &[u8]) -> Result<(u8, &[u8])> {
    match payload.split_first() {
        Some((&sub, value)) if (hardware::FREQUENCY..=hardware::SYNC_WORD).contains(&sub) => {
            Ok((sub, value))
        }
        Some((&sub, _)) => Err(MeshError::Codec(CodecError::UnknownCommand { command: sub })),
        None => Err(MeshError::Codec(CodecError::FrameTooShort { len: 0 })),
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_round_trip() {
        let frame = KissFrame::data(vec![1, 2, 3]);
        let mut decoder = KissDecoder::new();
        let frames = decoder.push_bytes(&frame.to_bytes());
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn escaping_round_trip() {
        let frame = KissFrame::data(vec![FEND, FESC, 0x42, FEND]);
        let bytes = frame.to_bytes();
        // Interior delimiters must not appear unescaped
        assert_eq!(
            bytes.iter().filter(|&&b| b == FEND).count(),
            2,
            "only the outer delimiters remain"
        );

        let mut decoder = KissDecoder::new();
        let frames = decoder.push_bytes(&bytes);
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn stray_bytes_outside_frames_dropped() {
        let frame = KissFrame::data(vec![7, 8]);
        let mut stream = vec![0x11, 0x22];
        stream.extend_from_slice(&frame.to_bytes());

        let mut decoder = KissDecoder::new();
        assert_eq!(decoder.push_bytes(&stream), vec![frame]);
    }

    #[test]
    fn partial_feed() {
        let frame = KissFrame::data(vec![9u8; 32]);
        let bytes = frame.to_bytes();
        let mut decoder = KissDecoder::new();
        assert!(decoder.push_bytes(&bytes[..10]).is_empty());
        assert_eq!(decoder.push_bytes(&bytes[10..]), vec![frame]);
    }

    #[test]
    fn bad_escape_counted_and_dropped() {
        let stream = [FEND, CMD_DATA, FESC, 0x42, FEND];
        let mut decoder = KissDecoder::new();
        let frames = decoder.push_bytes(&stream);
        assert!(frames.is_empty());
        assert_eq!(decoder.malformed, 1);
    }

    #[test]
    fn hardware_frames() {
        let frame = KissFrame::set_hardware(hardware::FREQUENCY, &868_100_000u32.to_be_bytes());
        assert_eq!(frame.command, CMD_SET_HARDWARE);
        let (sub, value) = parse_hardware(&frame.payload).unwrap();
        assert_eq!(sub, hardware::FREQUENCY);
        assert_eq!(value, 868_100_000u32.to_be_bytes());

        assert!(parse_hardware(&[0x7F]).is_err());
        assert!(parse_hardware(&[]).is_err());
    }

    #[test]
    fn signal_decoding() {
        assert_eq!(decode_rssi(0x9C), -100);
        assert!((decode_snr(0xE8) - (-6.0)).abs() < f32::EPSILON);
        assert!((decode_snr(22) - 5.5).abs() < f32::EPSILON);
    }
}
