//! Foreign Mesh Protocol interop for driftmesh
//!
//! Existing radio nodes speak their own mesh protocol; this crate parses
//! and serialises it ([`codec`]) and bridges it onto the universal packet
//! model as a [`Transport`](driftmesh_core::Transport) ([`transport`]):
//! periodic identity announces, a 10-minute forwarding table learned from
//! foreign announces, and hop-limited relay of foreign traffic.

pub mod codec;
pub mod transport;

pub use codec::{FmpAnnounce, FmpDestinationType, FmpPacket, FmpPacketType};
pub use transport::{FmpConfig, FmpPathEntry, FmpStats, FmpTransport, KnownDestination};
