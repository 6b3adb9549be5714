//! Error types for the vending link layer.
//!
//! This module defines the crate error type, covering Bluetooth, I/O,
//! configuration and protocol failures, and the coarse [`ErrorKind`]
//! taxonomy that is the only error information handed to applications.

use thiserror::Error;

use crate::vending::protocol::FrameError;

/// Main error type for the vending link layer.
#[derive(Error, Debug)]
pub enum VendError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Radio unavailable")]
   RadioUnavailable,

   #[error("Link timed out")]
   LinkTimeout,

   #[error("Link dropped: {0}")]
   LinkDropped(String),

   #[error("Protocol anomaly: {0}")]
   ProtocolAnomaly(#[from] FrameError),

   #[error("Invalid configuration: {0}")]
   InvalidConfiguration(&'static str),

   #[error("Device not connected")]
   NotConnected,

   #[error("Session busy: a message is still being written")]
   SessionBusy,

   #[error("Already connecting to device")]
   AlreadyConnecting,

   #[error("Manager has been shut down")]
   ManagerShutdown,

   #[error("Task aborted: {0}")]
   TaskAborted(#[from] tokio::task::JoinError),

   #[error("Adapter not found")]
   AdapterNotFound,

   #[error("Characteristic not found: {0}")]
   CharacteristicNotFound(uuid::Uuid),

   #[error("Invalid device identifier: {0}")]
   InvalidDeviceId(String),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

/// Application-facing error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
pub enum ErrorKind {
   /// Radio powered off or missing; fatal until resolved externally.
   RadioUnavailable,
   /// Connect or keepalive did not complete in time.
   LinkTimeout,
   /// Peer disconnected or the transport failed.
   LinkDropped,
   /// Unattributable or malformed packet.
   ProtocolAnomaly,
   /// Rejected configuration or call made in the wrong state.
   InvalidConfiguration,
}

impl VendError {
   /// Maps this error onto the taxonomy exposed to applications.
   pub fn kind(&self) -> ErrorKind {
      match self {
         Self::RadioUnavailable | Self::AdapterNotFound => ErrorKind::RadioUnavailable,
         Self::LinkTimeout => ErrorKind::LinkTimeout,
         Self::ProtocolAnomaly(_) => ErrorKind::ProtocolAnomaly,
         Self::InvalidConfiguration(_)
         | Self::NotConnected
         | Self::SessionBusy
         | Self::AlreadyConnecting
         | Self::InvalidDeviceId(_)
         | Self::ConfigDirNotFound
         | Self::TomlParse(_)
         | Self::TomlSerialize(_) => ErrorKind::InvalidConfiguration,
         Self::Bluetooth(_)
         | Self::Io(_)
         | Self::LinkDropped(_)
         | Self::ManagerShutdown
         | Self::TaskAborted(_)
         | Self::CharacteristicNotFound(_) => ErrorKind::LinkDropped,
      }
   }
}

/// Convenience type alias for Results with `VendError`.
pub type Result<T> = std::result::Result<T, VendError>;

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_kind_mapping() {
      assert_eq!(VendError::RadioUnavailable.kind(), ErrorKind::RadioUnavailable);
      assert_eq!(VendError::LinkTimeout.kind(), ErrorKind::LinkTimeout);
      assert_eq!(
         VendError::LinkDropped("peer went away".into()).kind(),
         ErrorKind::LinkDropped
      );
      assert_eq!(
         VendError::from(FrameError::TooShort { actual: 1 }).kind(),
         ErrorKind::ProtocolAnomaly
      );
      assert_eq!(
         VendError::InvalidConfiguration("packet_size must be > 0").kind(),
         ErrorKind::InvalidConfiguration
      );
   }

   #[test]
   fn test_kind_display() {
      assert_eq!(ErrorKind::LinkTimeout.to_string(), "LinkTimeout");
   }
}
