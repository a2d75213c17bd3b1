//! Transport capability interface
//!
//! A transport is a start/stop/transmit/receive capability on one medium.
//! Concrete implementations live in their own crates (`driftmesh-ble`,
//! `driftmesh-lora`, `driftmesh-fmp`); the manager composes them behind
//! `Box<dyn Transport>` and dispatches only at that boundary. Hot paths
//! inside each transport stay monomorphic.

use std::time::Instant;

use crate::errors::Result;
use crate::packet::{Packet, TransportMetadata};
use crate::types::TransportTag;

// ----------------------------------------------------------------------------
// Delivery State
// ----------------------------------------------------------------------------

/// Application-visible delivery progression
///
/// A send moves `Sending → Sent`, `Sending → Queued → Sent`, or
/// `Sending → Failed`. There is no half-delivered state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Sending,
    Queued,
    Sent,
    Failed,
}

// ----------------------------------------------------------------------------
// Transmit Result
// ----------------------------------------------------------------------------

/// Outcome of one transmit attempt
#[derive(Debug, Clone)]
pub struct TransmitResult {
    pub success: bool,
    /// Whether the packet was queued for a later attempt
    pub queued: bool,
    /// When the packet is expected on the air, if known
    pub estimated_delivery: Option<Instant>,
    /// Final delivery state for the application
    pub state: DeliveryState,
    /// Failure description when `success` is false and nothing was queued
    pub error: Option<String>,
}

impl TransmitResult {
    /// Immediate success
    pub fn sent() -> Self {
        Self {
            success: true,
            queued: false,
            estimated_delivery: Some(Instant::now()),
            state: DeliveryState::Sent,
            error: None,
        }
    }

    /// Success with a known on-air completion time
    pub fn sent_at(estimated_delivery: Instant) -> Self {
        Self {
            success: true,
            queued: false,
            estimated_delivery: Some(estimated_delivery),
            state: DeliveryState::Sent,
            error: None,
        }
    }

    /// Deferred; the transport owns the retry
    pub fn queued_until(estimated_delivery: Instant) -> Self {
        Self {
            success: false,
            queued: true,
            estimated_delivery: Some(estimated_delivery),
            state: DeliveryState::Queued,
            error: None,
        }
    }

    /// Terminal failure
    pub fn failed<T: Into<String>>(error: T) -> Self {
        Self {
            success: false,
            queued: false,
            estimated_delivery: None,
            state: DeliveryState::Failed,
            error: Some(error.into()),
        }
    }
}

// ----------------------------------------------------------------------------
// Transport Metrics
// ----------------------------------------------------------------------------

/// Counters every transport keeps
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportMetrics {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Malformed frames dropped at the parser; never propagated upward
    pub parse_errors: u64,
    /// Peers currently reachable over this transport
    pub peer_count: usize,
    /// Nominal link bandwidth in bits per second
    pub bitrate_bps: u64,
}

// ----------------------------------------------------------------------------
// Receive Callback
// ----------------------------------------------------------------------------

/// Callback invoked by a transport for every received packet
pub type ReceiveCallback = std::sync::Arc<dyn Fn(Packet, TransportMetadata) + Send + Sync>;

// ----------------------------------------------------------------------------
// Transport Trait
// ----------------------------------------------------------------------------

/// Narrow capability interface every transport implements
///
/// Implementations must deliver `transmit` calls in submission order and
/// must not interleave fragments of different packets. Receive callbacks
/// may be invoked from any task.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Stable identifier for selection and metrics
    fn tag(&self) -> TransportTag;

    /// Whether the transport is started and has usable hardware
    fn is_available(&self) -> bool;

    /// Bring the transport up and begin receiving
    async fn start(&self) -> Result<()>;

    /// Stop background work, close resources, drop queued sends
    async fn stop(&self) -> Result<()>;

    /// Send one packet
    async fn transmit(&self, packet: &Packet) -> Result<TransmitResult>;

    /// Register the receive callback; replaces any previous registration
    fn set_receive_callback(&self, callback: ReceiveCallback);

    /// Counter snapshot
    fn metrics(&self) -> TransportMetrics;
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_constructors_set_states() {
        assert_eq!(TransmitResult::sent().state, DeliveryState::Sent);
        let queued = TransmitResult::queued_until(Instant::now());
        assert_eq!(queued.state, DeliveryState::Queued);
        assert!(queued.queued);
        assert!(!queued.success);
        let failed = TransmitResult::failed("no radio");
        assert_eq!(failed.state, DeliveryState::Failed);
        assert_eq!(failed.error.as_deref(), Some("no radio"));
    }
}
