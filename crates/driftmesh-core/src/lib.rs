//! Driftmesh Core Protocol Implementation
//!
//! This crate is the headless engine of the driftmesh stack: a universal
//! packet model federated across heterogeneous radio links. It has no
//! knowledge of any user interface or concrete hardware; transport crates
//! (`driftmesh-ble`, `driftmesh-lora`, `driftmesh-fmp`) implement the
//! [`Transport`] capability and are composed by the [`TransportManager`].
//!
//! ## Architecture Overview
//!
//! - [`packet`] — the universal packet value and its wire format; packet
//!   identity is the random 16-hex-char fingerprint used for dedup.
//! - [`fragmentation`] — split/reassemble packets across MTU-limited
//!   links with a compact 4-byte fragment header.
//! - [`dedup`] — the 60-second seen-packet window on a monotonic clock.
//! - [`crypto`] / [`handshake`] — Noise XX secure links with key pinning
//!   and a rekey policy, plus the Ed25519 identity key pair.
//! - [`pathfinder`] — distance-vector routing with link-quality scoring
//!   and the transport-selection decision table.
//! - [`transport`] / [`manager`] — the capability interface and the
//!   composition layer (dedup, relay, store-and-forward, status stream).
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use driftmesh_core::{
//!     config::{HandshakeConfig, MeshConfig, PathfinderConfig},
//!     crypto::{IdentityKeyPair, NoiseKeyPair},
//!     handshake::HandshakeManager,
//!     pathfinder::Pathfinder,
//!     TransportManager,
//! };
//!
//! # async fn run() -> driftmesh_core::Result<()> {
//! let identity = IdentityKeyPair::generate();
//! let pathfinder = Arc::new(Pathfinder::new(PathfinderConfig::default()));
//! let handshakes = Arc::new(HandshakeManager::new(
//!     NoiseKeyPair::generate()?,
//!     HandshakeConfig::default(),
//! ));
//!
//! let manager = Arc::new(
//!     TransportManager::new(identity.node_hash(), MeshConfig::default())
//!         .with_pathfinder(pathfinder)
//!         .with_handshakes(handshakes),
//! );
//! // manager.add_transport(...) for each available medium
//! manager.start_all().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod dedup;
pub mod errors;
pub mod fragmentation;
pub mod handshake;
pub mod manager;
pub mod packet;
pub mod pathfinder;
pub mod transport;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use errors::{MeshError, Result};
pub use manager::{ManagerStatus, PacketHandler, TransportManager};
pub use packet::{Packet, PacketType, TransportMetadata};
pub use transport::{DeliveryState, ReceiveCallback, Transport, TransmitResult, TransportMetrics};
pub use types::{NodeHash, PacketId, Timestamp, TransportTag, Ttl};
