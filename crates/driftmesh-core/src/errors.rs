//! Error types for the driftmesh stack
//!
//! Every layer below the transport manager surfaces typed errors; the
//! manager translates transport failures into retries or a failed
//! `TransmitResult`. Parse errors are counted in transport metrics and
//! never reach the application.

// ----------------------------------------------------------------------------
// Packet Errors
// ----------------------------------------------------------------------------

/// Packet construction and wire-format errors
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("payload too large (max {max}, got {actual})")]
    PayloadTooLarge { max: usize, actual: usize },
    #[error("unknown packet type: {value:#04x}")]
    UnknownPacketType { value: u8 },
    #[error("packet too short (expected at least {expected}, got {actual})")]
    Truncated { expected: usize, actual: usize },
    #[error("hop count {hops} exceeds ttl {ttl}")]
    HopsExceedTtl { hops: u8, ttl: u8 },
    #[error("{message}")]
    Malformed { message: String },
}

// ----------------------------------------------------------------------------
// Transport Errors
// ----------------------------------------------------------------------------

/// Failures surfaced by individual transports and the manager
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport {tag} is not available")]
    Unavailable { tag: String },
    #[error("duplicate packet {packet_id} within dedup window")]
    Duplicate { packet_id: String },
    #[error("channel busy after {attempts} CAD attempts")]
    ChannelBusy { attempts: u32 },
    #[error("duty cycle exceeded, retry in {backoff_ms}ms")]
    DutyCycleExceeded { backoff_ms: u64 },
    #[error("fragment reassembly timed out for {packet_id_short:#06x}")]
    FragmentTimeout { packet_id_short: u16 },
    #[error("pending packet dropped after {retries} retries")]
    RetryExhausted { retries: u32 },
    #[error("send queue full (capacity {capacity})")]
    QueueFull { capacity: usize },
    #[error("transport shut down: {reason}")]
    Shutdown { reason: String },
}

// ----------------------------------------------------------------------------
// Radio Errors
// ----------------------------------------------------------------------------

/// Long-range radio driver failures
#[derive(Debug, thiserror::Error)]
pub enum RadioError {
    #[error("serial I/O failed: {0}")]
    SerialIo(#[from] std::io::Error),
    #[error("serial port {port} is already owned by another driver")]
    PortInUse { port: String },
    #[error("device rejected command {command:#04x}")]
    Nack { command: u8 },
    #[error("no response to command {command:#04x} within {timeout_ms}ms")]
    CommandTimeout { command: u8, timeout_ms: u64 },
    #[error("driver is in error state and must be reconfigured")]
    Faulted,
    #[error("invalid radio configuration: {reason}")]
    InvalidConfig { reason: String },
}

// ----------------------------------------------------------------------------
// Codec Errors
// ----------------------------------------------------------------------------

/// Malformed bytes on a framed link or in a foreign mesh packet
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame too short ({len} bytes)")]
    FrameTooShort { len: usize },
    #[error("frame payload oversized ({len} bytes, max {max})")]
    FrameOversized { len: usize, max: usize },
    #[error("unknown frame command {command:#04x}")]
    UnknownCommand { command: u8 },
    #[error("bad escape sequence in framed stream")]
    BadEscape,
    #[error("foreign mesh packet malformed: {reason}")]
    ForeignPacket { reason: String },
}

// ----------------------------------------------------------------------------
// Handshake Errors
// ----------------------------------------------------------------------------

/// Two-party key agreement failures
///
/// None of these leave a partial secure link behind; a failed session is
/// removed from the store before the error is returned.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake with {peer} timed out after {timeout_secs}s")]
    Timeout { peer: String, timeout_secs: u64 },
    #[error("key pinning failed for {peer}")]
    PinningMismatch { peer: String },
    #[error("cipher authentication failed during handshake with {peer}")]
    AuthenticationFailed { peer: String },
    #[error("no established link with {peer}")]
    LinkNotFound { peer: String },
    #[error("handshake with {peer} in unexpected state: expected {expected}, got {actual}")]
    InvalidState {
        peer: String,
        expected: String,
        actual: String,
    },
    #[error("noise protocol failure: {0}")]
    Noise(#[from] snow::Error),
}

// ----------------------------------------------------------------------------
// Unified Error
// ----------------------------------------------------------------------------

/// Top-level error type for the driftmesh stack
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("radio error: {0}")]
    Radio(#[from] RadioError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("configuration error: {reason}")]
    Configuration { reason: String },
}

impl MeshError {
    /// Create a malformed-packet error with a message
    pub fn malformed<T: Into<String>>(message: T) -> Self {
        MeshError::Packet(PacketError::Malformed {
            message: message.into(),
        })
    }

    /// Create a configuration error with a reason
    pub fn config<T: Into<String>>(reason: T) -> Self {
        MeshError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a transport-unavailable error
    pub fn unavailable<T: Into<String>>(tag: T) -> Self {
        MeshError::Transport(TransportError::Unavailable { tag: tag.into() })
    }

    /// Create a duplicate-packet error
    pub fn duplicate<T: Into<String>>(packet_id: T) -> Self {
        MeshError::Transport(TransportError::Duplicate {
            packet_id: packet_id.into(),
        })
    }

    /// True when the failure is transient and a reliable packet should be
    /// re-queued rather than dropped.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MeshError::Transport(
                TransportError::ChannelBusy { .. }
                    | TransportError::DutyCycleExceeded { .. }
                    | TransportError::Unavailable { .. }
            )
        )
    }
}

// ----------------------------------------------------------------------------
// Type Alias
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, MeshError>;
