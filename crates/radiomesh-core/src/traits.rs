//! Collaborator traits
//!
//! The mesh core never touches hardware. Radios and persistent storage are
//! reached through these traits, with one implementation per target.

use crate::error::{RadioError, StorageError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Coarse link quality bucket derived from RSSI
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SignalIndicator {
    NoSignal,
    VeryPoor,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl SignalIndicator {
    /// Bucket an RSSI reading in dBm
    pub fn from_rssi(rssi_dbm: i16) -> Self {
        match rssi_dbm {
            r if r >= -90 => SignalIndicator::Excellent,
            r if r >= -100 => SignalIndicator::Good,
            r if r >= -110 => SignalIndicator::Fair,
            r if r >= -120 => SignalIndicator::Poor,
            r if r >= -130 => SignalIndicator::VeryPoor,
            _ => SignalIndicator::NoSignal,
        }
    }
}

/// Packet radio transceiver
pub trait Radio {
    /// Transmit one frame
    fn send(&mut self, frame: &[u8]) -> Result<(), RadioError>;

    /// Wait up to `timeout` for one frame; `Ok(None)` when nothing arrived
    fn receive(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, RadioError>;

    /// RSSI of the most recently received frame in dBm
    fn rssi(&self) -> i16;

    /// Signal quality of the most recently received frame
    fn signal_quality(&self) -> SignalIndicator {
        SignalIndicator::from_rssi(self.rssi())
    }
}

/// Persistent key-value byte storage
pub trait ByteStorage {
    /// Read the value under `key`
    fn read(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Write `value` under `key`, replacing any previous value
    fn write(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Remove `key`; removing a missing key is not an error
    fn remove(&mut self, key: &str) -> Result<(), StorageError>;

    /// Read a value, mapping `NotFound` to `None`
    fn read_optional(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match self.read(key) {
            Ok(value) => Ok(Some(value)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_indicator_buckets() {
        assert_eq!(SignalIndicator::from_rssi(-40), SignalIndicator::Excellent);
        assert_eq!(SignalIndicator::from_rssi(-90), SignalIndicator::Excellent);
        assert_eq!(SignalIndicator::from_rssi(-95), SignalIndicator::Good);
        assert_eq!(SignalIndicator::from_rssi(-105), SignalIndicator::Fair);
        assert_eq!(SignalIndicator::from_rssi(-115), SignalIndicator::Poor);
        assert_eq!(SignalIndicator::from_rssi(-125), SignalIndicator::VeryPoor);
        assert_eq!(SignalIndicator::from_rssi(-140), SignalIndicator::NoSignal);
        assert!(SignalIndicator::Good > SignalIndicator::Fair);
    }
}
