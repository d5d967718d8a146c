//! Error types for the mesh core.
//!
//! Each concern has its own enum; [`MeshError`] wraps them so device-level
//! operations can propagate anything with `?`. Routing decisions are not
//! errors: they are reported as [`RouteOutcome`](crate::router::RouteOutcome)
//! values.

use crate::packet::Topic;
use thiserror::Error;

/// Frame parsing and hop-budget errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Buffer too short, or its length disagrees with the payload length field
    #[error("invalid frame length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// Checksum mismatch
    #[error("packet corrupted: checksum {actual:08x} does not match {expected:08x}")]
    PacketCorrupted { expected: u32, actual: u32 },

    /// Payload does not fit in a single frame
    #[error("payload of {0} bytes exceeds frame capacity")]
    PayloadTooLarge(usize),

    /// Topic variant that does not match its own wire byte
    #[error("topic {0:?} does not round-trip through its wire value")]
    InvalidTopic(Topic),

    /// Hop budget exhausted
    #[error("hop budget exhausted: {hop_count} of {limit} hops used")]
    MaxHops { hop_count: u8, limit: u8 },
}

/// Radio transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    /// Transmission did not complete in time
    #[error("radio transmit timeout")]
    TxTimeout,

    /// Receive wait failed (an empty wait is `Ok(None)`, not this)
    #[error("radio receive timeout")]
    RxTimeout,

    /// Any other driver failure
    #[error("radio failure: {0}")]
    Failure(String),
}

/// Persistent storage errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// No value stored under the key
    #[error("storage key not found: {0}")]
    NotFound(String),

    /// Backend read/write failure
    #[error("storage failure: {0}")]
    Failure(String),
}

/// Cryptographic capability errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key material has the wrong length or is absent
    #[error("invalid key material")]
    InvalidKey,

    /// Encryption failed
    #[error("seal failed")]
    SealFailed,

    /// Decryption or authentication failed
    #[error("open failed: payload is not authentic")]
    OpenFailed,

    /// Peer public key is malformed
    #[error("invalid public key")]
    InvalidPublicKey,
}

/// Reasons an inclusion session ends in failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InclusionError {
    /// The next expected message did not arrive before the deadline
    #[error("inclusion timed out")]
    Timeout,

    /// A message arrived that does not match the session's current step
    #[error("unexpected {0:?} for the current handshake step")]
    OutOfSequence(Topic),

    /// Payload malformed or otherwise unacceptable
    #[error("inclusion rejected: {0}")]
    Rejected(String),

    /// Decrypt or authenticity check failed
    #[error("inclusion crypto failure: {0}")]
    Crypto(#[from] CryptoError),

    /// Request arrived while the hub is not accepting new devices
    #[error("not in inclusion mode")]
    NotInInclusionMode,

    /// Too many concurrent sessions
    #[error("inclusion session limit reached")]
    SessionLimit,

    /// Key could not be installed
    #[error("inclusion key install failed: {0}")]
    Key(#[from] KeyError),
}

/// Mesh key lifecycle errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// A key is already installed; use an explicit rekey instead
    #[error("mesh key already installed")]
    AlreadyInstalled,

    /// No mesh key is installed
    #[error("no mesh key installed")]
    Missing,
}

/// Top-level mesh error
#[derive(Error, Debug)]
pub enum MeshError {
    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error(transparent)]
    Radio(#[from] RadioError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Key(#[from] KeyError),

    /// Inclusion ended without admitting the device
    #[error("inclusion failed: {0}")]
    InclusionFailed(#[from] InclusionError),

    /// Device must be included before it can send this topic
    #[error("device is not included in a mesh")]
    NotIncluded,

    /// Operation attempted in a state that forbids it
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Routing snapshot could not be encoded or decoded
    #[error("snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),
}

/// Result type alias for mesh operations
pub type Result<T> = std::result::Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_error_display() {
        let err = PacketError::InvalidLength { expected: 27, actual: 3 };
        assert_eq!(err.to_string(), "invalid frame length: expected 27 bytes, got 3");

        let err = PacketError::MaxHops { hop_count: 7, limit: 7 };
        assert!(err.to_string().contains("7 of 7"));
    }

    #[test]
    fn test_mesh_error_wraps() {
        let err: MeshError = InclusionError::Timeout.into();
        assert_eq!(err.to_string(), "inclusion failed: inclusion timed out");

        let err: MeshError = RadioError::TxTimeout.into();
        assert_eq!(err.to_string(), "radio transmit timeout");
    }

    #[test]
    fn test_crypto_error_into_inclusion() {
        let err: InclusionError = CryptoError::OpenFailed.into();
        assert!(matches!(err, InclusionError::Crypto(CryptoError::OpenFailed)));
    }
}
