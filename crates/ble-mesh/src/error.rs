//! Error types for mesh friendship and provisioning transactions

use crate::wire::WireError;
use thiserror::Error;

/// Result type for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Errors raised while handling friendship and transaction traffic.
///
/// None of these is ever answered on the air: the node logs the error and
/// drops the input. Only exhausted retries lead to a teardown.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeshError {
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhaustion(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Element range 0x{first:04x}+{count} leaves the unicast space")]
    AddressConflict { first: u16, count: u8 },

    #[error("State mismatch: {0}")]
    StateMismatch(String),

    #[error("Malformed PDU: {0}")]
    Wire(#[from] WireError),

    #[error("Packet transmission failed: {0}")]
    TransmissionFailed(String),

    #[error("Unknown subnet 0x{0:03x}")]
    UnknownSubnet(u16),

    #[error("Credential derivation failed: {0}")]
    Credentials(String),

    #[error("Node is shutting down")]
    Shutdown,
}

impl MeshError {
    /// Whether the error only means "this input was ignored".
    pub fn is_silent_drop(&self) -> bool {
        matches!(
            self,
            MeshError::ProtocolViolation(_)
                | MeshError::StateMismatch(_)
                | MeshError::Wire(_)
                | MeshError::AddressConflict { .. }
                | MeshError::ResourceExhaustion(_)
        )
    }
}
