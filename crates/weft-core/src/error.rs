//! Error kinds shared across the weft stack.

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Cross-subsystem error kinds.
///
/// Subsystem-local errors (crypto, storage, DNS codec, ...) convert into
/// these; callers above the subsystem boundary only ever see this enum.
#[derive(Debug, Error)]
pub enum Error {
    /// Peer sent a well-formed message whose contents break expectations
    /// (wrong type, wrong subject, wrong fabric). Not retried.
    #[error("unexpected data: {0}")]
    UnexpectedData(String),

    /// A local invariant was violated. Fatal for the affected subsystem.
    #[error("implementation error: {0}")]
    Implementation(String),

    /// An "impossible" condition, e.g. a cycle in the endpoint tree.
    #[error("internal error: {0}")]
    Internal(String),

    /// A caller-built Read/Write/Subscribe/Invoke is inconsistent.
    /// Rejected before any I/O.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// Interaction-level status carried back to an invoke caller.
    #[error("status response: status {status}, cluster status {cluster_status:?}")]
    StatusResponse {
        status: u8,
        cluster_status: Option<u8>,
    },

    /// Secure-channel StatusReport carrying a non-success status.
    #[error("channel status: general {general_status}, protocol {protocol_status}")]
    ChannelStatusResponse {
        general_status: u16,
        protocol_status: u16,
    },

    /// Retransmission budget exhausted without an answer.
    #[error("retransmission limit reached")]
    RetransmissionLimitReached,

    /// Transport-level failure.
    #[error("network error: {0}")]
    Network(String),

    /// The peer stopped communicating mid-protocol.
    #[error("peer communication error: {0}")]
    PeerCommunication(String),

    /// Certificate parse or verification failure.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// A message arrived that the current protocol state does not allow.
    #[error("matter flow error: {0}")]
    MatterFlow(String),

    /// Cryptographic primitive failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),

    /// Storage backend failure.
    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    /// TLV encode/decode failure.
    #[error("tlv error: {0}")]
    Tlv(#[from] crate::tlv::TlvError),
}

impl Error {
    /// Whether the post-failure StatusReport must be suppressed: transport
    /// failures and aborts never echo a status back to the peer, and a
    /// failure the peer itself reported is never answered with another.
    pub fn suppresses_status_report(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::PeerCommunication(_)
                | Error::RetransmissionLimitReached
                | Error::ChannelStatusResponse { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_report_suppression() {
        assert!(Error::Network("socket closed".into()).suppresses_status_report());
        assert!(Error::RetransmissionLimitReached.suppresses_status_report());
        assert!(!Error::UnexpectedData("bad subject".into()).suppresses_status_report());
        assert!(!Error::Certificate("chain".into()).suppresses_status_report());
    }
}
