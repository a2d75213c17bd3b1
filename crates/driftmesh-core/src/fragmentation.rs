//! Payload fragmentation and reassembly for MTU-limited radio links
//!
//! A packet larger than the link MTU is serialized once and split into
//! chunks, each prefixed with a compact 4-byte header:
//!
//! ```text
//! packet_id_short(2, BE) | fragment_num(1) | total_fragments(1)
//! ```
//!
//! Reassembly buffers are keyed by `(packet_id_short, source)` so two
//! nodes reusing a short id never cross-contaminate. Buffers that stay
//! incomplete for 5 seconds are discarded; a late fragment for a discarded
//! buffer simply opens a new one.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::errors::{MeshError, PacketError, Result};
use crate::packet::Packet;
use crate::types::NodeHash;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Bytes of fragment header ahead of each chunk
pub const FRAGMENT_HEADER_SIZE: usize = 4;

/// Default effective MTU for the long-range link
pub const DEFAULT_MTU: usize = 200;

/// Reassembly buffers older than this are discarded
pub const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Fragment counts are carried in one byte
pub const MAX_FRAGMENTS: usize = 255;

// ----------------------------------------------------------------------------
// Fragment
// ----------------------------------------------------------------------------

/// One piece of a fragmented packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// 16-bit short id derived from the full packet id
    pub packet_id_short: u16,
    /// Zero-based position within the sequence
    pub fragment_num: u8,
    /// Total fragments in the sequence
    pub total_fragments: u8,
    /// Chunk of the serialized packet
    pub payload: Vec<u8>,
}

impl Fragment {
    /// Whether this fragment closes the sequence
    pub fn is_last(&self) -> bool {
        self.fragment_num + 1 == self.total_fragments
    }

    /// Serialize to wire form
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(FRAGMENT_HEADER_SIZE + self.payload.len());
        bytes.extend_from_slice(&self.packet_id_short.to_be_bytes());
        bytes.push(self.fragment_num);
        bytes.push(self.total_fragments);
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Parse from wire form
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FRAGMENT_HEADER_SIZE {
            return Err(PacketError::Truncated {
                expected: FRAGMENT_HEADER_SIZE,
                actual: bytes.len(),
            }
            .into());
        }
        let fragment = Self {
            packet_id_short: u16::from_be_bytes([bytes[0], bytes[1]]),
            fragment_num: bytes[2],
            total_fragments: bytes[3],
            payload: bytes[FRAGMENT_HEADER_SIZE..].to_vec(),
        };
        if fragment.total_fragments == 0 {
            return Err(MeshError::malformed("fragment sequence of zero length"));
        }
        if fragment.fragment_num >= fragment.total_fragments {
            return Err(MeshError::malformed("fragment index out of bounds"));
        }
        Ok(fragment)
    }
}

// ----------------------------------------------------------------------------
// Fragmenter
// ----------------------------------------------------------------------------

/// Splits serialized packets into MTU-sized fragments
#[derive(Debug, Clone)]
pub struct Fragmenter {
    mtu: usize,
}

impl Fragmenter {
    /// Create a fragmenter for the given link MTU
    pub fn new(mtu: usize) -> Self {
        Self { mtu }
    }

    /// Largest chunk a single fragment can carry
    pub fn chunk_size(&self) -> usize {
        self.mtu.saturating_sub(FRAGMENT_HEADER_SIZE)
    }

    /// Number of fragments a packet will occupy on the wire
    pub fn fragment_count(&self, packet: &Packet) -> usize {
        packet.to_bytes().len().div_ceil(self.chunk_size().max(1))
    }

    /// Split a packet into its ordered fragment sequence
    ///
    /// A packet whose serialized form fits one chunk still yields a single
    /// fragment with `total_fragments = 1`, so the receive path is uniform.
    pub fn fragment(&self, packet: &Packet) -> Result<Vec<Fragment>> {
        let bytes = packet.to_bytes();
        let chunk = self.chunk_size();
        if chunk == 0 {
            return Err(MeshError::config("MTU smaller than fragment header"));
        }

        let total = bytes.len().div_ceil(chunk);
        if total > MAX_FRAGMENTS {
            return Err(PacketError::PayloadTooLarge {
                max: chunk * MAX_FRAGMENTS,
                actual: bytes.len(),
            }
            .into());
        }

        let short = packet.id.short_id();
        let fragments = bytes
            .chunks(chunk)
            .enumerate()
            .map(|(i, piece)| Fragment {
                packet_id_short: short,
                fragment_num: i as u8,
                total_fragments: total as u8,
                payload: piece.to_vec(),
            })
            .collect();
        Ok(fragments)
    }
}

impl Default for Fragmenter {
    fn default() -> Self {
        Self::new(DEFAULT_MTU)
    }
}

// ----------------------------------------------------------------------------
// Reassembler
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct ReassemblyBuffer {
    pieces: Vec<Option<Vec<u8>>>,
    received: usize,
    first_received_at: Instant,
}

impl ReassemblyBuffer {
    fn new(total: u8) -> Self {
        Self {
            pieces: (0..total).map(|_| None).collect(),
            received: 0,
            first_received_at: Instant::now(),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.first_received_at) > REASSEMBLY_TIMEOUT
    }

    fn insert(&mut self, fragment: Fragment) {
        let slot = &mut self.pieces[fragment.fragment_num as usize];
        if slot.is_none() {
            *slot = Some(fragment.payload);
            self.received += 1;
        }
    }

    fn is_complete(&self) -> bool {
        self.received == self.pieces.len()
    }

    fn into_bytes(self) -> Vec<u8> {
        self.pieces.into_iter().flatten().flatten().collect()
    }
}

/// Rebuilds packets from fragments arriving in any order
#[derive(Debug, Default)]
pub struct Reassembler {
    buffers: HashMap<(u16, NodeHash), ReassemblyBuffer>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment; returns the reconstructed packet once the
    /// sequence is complete.
    ///
    /// A fragment whose `total_fragments` disagrees with the open buffer
    /// replaces it: the old sequence can never complete.
    pub fn defragment(&mut self, fragment: Fragment, source: NodeHash) -> Result<Option<Packet>> {
        if fragment.total_fragments == 0 || fragment.fragment_num >= fragment.total_fragments {
            return Err(MeshError::malformed("fragment index out of bounds"));
        }
        let key = (fragment.packet_id_short, source);
        let now = Instant::now();

        let stale = self
            .buffers
            .get(&key)
            .map(|buf| buf.is_expired(now) || buf.pieces.len() != fragment.total_fragments as usize)
            .unwrap_or(false);
        if stale {
            self.buffers.remove(&key);
        }

        let buffer = self
            .buffers
            .entry(key)
            .or_insert_with(|| ReassemblyBuffer::new(fragment.total_fragments));
        buffer.insert(fragment);

        if buffer.is_complete() {
            let buffer = self
                .buffers
                .remove(&key)
                .ok_or_else(|| MeshError::malformed("reassembly buffer vanished"))?;
            let packet = Packet::from_bytes(&buffer.into_bytes())?;
            return Ok(Some(packet));
        }
        Ok(None)
    }

    /// Drop buffers that have exceeded the reassembly timeout
    pub fn prune(&mut self) -> usize {
        let now = Instant::now();
        let before = self.buffers.len();
        self.buffers.retain(|_, buf| !buf.is_expired(now));
        before - self.buffers.len()
    }

    /// Open buffer count, for transport metrics
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
