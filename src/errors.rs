//! Error types for D7A network/transport operations
//!
//! Only recoverable conditions live here. Contract violations between the
//! layers (illegal state transitions, hop-enabled assembly, impossible timer
//! arithmetic) are defects and panic instead of producing a `D7aError`.
use thiserror::Error;

/// Result type alias for D7A operations
pub type Result<T> = std::result::Result<T, D7aError>;

/// D7A protocol error enumeration
///
/// Covers every way a frame can be refused or an operation can fail without
/// corrupting protocol state:
/// - wire format violations on inbound frames
/// - security rejections (replay, authentication)
/// - dialog/transaction filtering
/// - configuration store failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum D7aError {
    /// Frame ended before a mandatory field could be read
    #[error("invalid packet length: expected at least {expected} bytes, received {received}")]
    InvalidPacketLength { expected: usize, received: usize },

    /// Outgoing frame does not fit in a single radio frame
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Origin id type field carries a value this stack does not support
    #[error("invalid addressee id type: {0}")]
    InvalidIdType(u8),

    /// Extension byte carries an undefined NLS method
    #[error("invalid NLS method: {0}")]
    InvalidNlsMethod(u8),

    /// Inbound frame requests multi-hop routing
    #[error("hopping is not supported")]
    UnsupportedHopping,

    /// Secured frame received while network-layer security is not configured
    #[error("secured frame received but network layer security is disabled")]
    SecurityDisabled,

    /// Secured frame without an origin id: no peer identity to authenticate
    #[error("secured frame with broadcast origin cannot be authenticated")]
    UnauthenticatableOrigin,

    /// Frame counter not newer than the last accepted one from this peer
    #[error("replay detected: received frame counter {received}, stored {stored}")]
    ReplayDetected { received: u32, stored: u32 },

    /// Authentication tag mismatch
    #[error("authentication failed")]
    AuthenticationFailed,

    /// No free slot left for a new trusted peer
    #[error("trusted node table full ({capacity} entries)")]
    TrustedNodeTableFull { capacity: usize },

    /// Local frame counter reached the all-ones sentinel
    #[error("frame counter exhausted for key counter {key_counter}")]
    FrameCounterExhausted { key_counter: u8 },

    /// Frame belongs to another dialog than the one in progress
    #[error("dialog id mismatch: expected {expected}, received {received}")]
    DialogMismatch { expected: u8, received: u8 },

    /// Frame belongs to another transaction than the one in progress
    #[error("transaction id mismatch: expected {expected}, received {received}")]
    TransactionMismatch { expected: u8, received: u8 },

    /// Responder discards segments until one with the START flag arrives
    #[error("segment without START flag outside of a dialog")]
    StartFlagMissing,

    /// Responder tried to open a dialog in a way the requester cannot accept
    #[error("dialog start not allowed during a master transaction")]
    UnexpectedDialogStart,

    /// The response period of a request elapsed before it was processed
    #[error("response period already expired")]
    ResponsePeriodExpired,

    /// Foreground frame received while the own access profile only scans background
    #[error("foreground frame received during background scan")]
    ForegroundFrameDuringBackgroundScan,

    /// Configuration store failure
    #[error("configuration store error: {0}")]
    Store(String),

    /// Record could not be archived
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Stored record failed validation
    #[error("deserialization error: {0}")]
    DeserializationError(String),
}

impl D7aError {
    /// Security rejections, as opposed to ordinary filtering
    pub fn is_security_rejection(&self) -> bool {
        matches!(
            self,
            Self::ReplayDetected { .. }
                | Self::AuthenticationFailed
                | Self::UnauthenticatableOrigin
                | Self::SecurityDisabled
        )
    }
}
