//! Discovered vending peripherals and the payloads exchanged with them.
//!
//! A [`DeviceHandle`] is created when an advertisement is observed during a
//! scan and handed to the connection manager to open a session.

use std::{
   fmt,
   sync::{
      Arc,
      atomic::{AtomicU32, Ordering},
   },
};

use serde::{Deserialize, Serialize};
use serde_json::json;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::vending::protocol::sig_uuid;

/// Standard Device Information characteristics read during enrichment.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::Display,
   strum::FromRepr,
)]
#[repr(u16)]
pub enum DeviceInfoField {
   #[strum(serialize = "manufacturer")]
   Manufacturer = 0x2A29,
   #[strum(serialize = "model")]
   Model = 0x2A24,
   #[strum(serialize = "serial")]
   Serial = 0x2A25,
   #[strum(serialize = "hardware_revision")]
   HardwareRevision = 0x2A27,
   #[strum(serialize = "firmware_revision")]
   FirmwareRevision = 0x2A26,
   #[strum(serialize = "software_revision")]
   SoftwareRevision = 0x2A28,
}

impl DeviceInfoField {
   pub const ALL: [Self; 6] = [
      Self::Manufacturer,
      Self::Model,
      Self::Serial,
      Self::HardwareRevision,
      Self::FirmwareRevision,
      Self::SoftwareRevision,
   ];

   pub const fn uuid(self) -> Uuid {
      sig_uuid(self as u16)
   }
}

/// Metadata read from the Device Information service.
///
/// Every field stays `None` unless it was read successfully.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
   pub manufacturer: Option<SmolStr>,
   pub model: Option<SmolStr>,
   pub serial: Option<SmolStr>,
   pub hardware_revision: Option<SmolStr>,
   pub firmware_revision: Option<SmolStr>,
   pub software_revision: Option<SmolStr>,
}

impl DeviceInfo {
   pub fn get(&self, field: DeviceInfoField) -> Option<&SmolStr> {
      match field {
         DeviceInfoField::Manufacturer => self.manufacturer.as_ref(),
         DeviceInfoField::Model => self.model.as_ref(),
         DeviceInfoField::Serial => self.serial.as_ref(),
         DeviceInfoField::HardwareRevision => self.hardware_revision.as_ref(),
         DeviceInfoField::FirmwareRevision => self.firmware_revision.as_ref(),
         DeviceInfoField::SoftwareRevision => self.software_revision.as_ref(),
      }
   }

   pub fn set(&mut self, field: DeviceInfoField, value: impl Into<SmolStr>) {
      let slot = match field {
         DeviceInfoField::Manufacturer => &mut self.manufacturer,
         DeviceInfoField::Model => &mut self.model,
         DeviceInfoField::Serial => &mut self.serial,
         DeviceInfoField::HardwareRevision => &mut self.hardware_revision,
         DeviceInfoField::FirmwareRevision => &mut self.firmware_revision,
         DeviceInfoField::SoftwareRevision => &mut self.software_revision,
      };
      *slot = Some(value.into());
   }

   pub fn is_empty(&self) -> bool {
      DeviceInfoField::ALL.iter().all(|f| self.get(*f).is_none())
   }
}

/// Shared connection-attempt counter.
///
/// Clones share the same count so the manager can update the handle the
/// caller keeps.
#[derive(Debug, Clone, Default)]
pub struct AttemptCounter(Arc<AtomicU32>);

impl AttemptCounter {
   pub fn get(&self) -> u32 {
      self.0.load(Ordering::Relaxed)
   }

   pub fn increment(&self) -> u32 {
      self.0.fetch_add(1, Ordering::Relaxed) + 1
   }

   pub fn reset(&self) {
      self.0.store(0, Ordering::Relaxed);
   }
}

/// A discoverable vending peripheral.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
   id: SmolStr,
   name: SmolStr,
   rssi: i16,
   info: Option<DeviceInfo>,
   attempts: AttemptCounter,
}

impl DeviceHandle {
   pub fn new(id: impl Into<SmolStr>, name: impl Into<SmolStr>, rssi: i16) -> Self {
      Self {
         id: id.into(),
         name: name.into(),
         rssi,
         info: None,
         attempts: AttemptCounter::default(),
      }
   }

   /// Stable identifier (the peripheral address on BlueZ).
   pub fn id(&self) -> &SmolStr {
      &self.id
   }

   pub fn name(&self) -> &SmolStr {
      &self.name
   }

   pub fn rssi(&self) -> i16 {
      self.rssi
   }

   pub fn info(&self) -> Option<&DeviceInfo> {
      self.info.as_ref()
   }

   pub fn set_info(&mut self, info: DeviceInfo) {
      self.info = Some(info);
   }

   /// Refreshes advertisement data after the same peripheral was seen again.
   pub fn observe(&mut self, name: Option<SmolStr>, rssi: i16) {
      if let Some(name) = name {
         self.name = name;
      }
      self.rssi = rssi;
   }

   pub fn connection_attempts(&self) -> u32 {
      self.attempts.get()
   }

   pub fn attempts(&self) -> &AttemptCounter {
      &self.attempts
   }

   pub fn to_json(&self) -> serde_json::Value {
      let mut value = json!({
          "id": self.id.as_str(),
          "name": self.name.as_str(),
          "rssi": self.rssi,
          "connection_attempts": self.connection_attempts(),
      });
      if let Some(info) = &self.info {
         value["info"] = json!(info);
      }
      value
   }
}

impl fmt::Display for DeviceHandle {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{} ({})", self.name, self.id)
   }
}

/// Application-level payload sent or received as one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Message(Vec<u8>);

impl Message {
   pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
      Self(bytes.into())
   }

   pub fn as_bytes(&self) -> &[u8] {
      &self.0
   }

   pub fn into_bytes(self) -> Vec<u8> {
      self.0
   }

   pub fn len(&self) -> usize {
      self.0.len()
   }

   pub fn is_empty(&self) -> bool {
      self.0.is_empty()
   }

   /// Returns the payload as text when it is valid UTF-8.
   pub fn as_str(&self) -> Option<&str> {
      std::str::from_utf8(&self.0).ok()
   }
}

impl From<Vec<u8>> for Message {
   fn from(bytes: Vec<u8>) -> Self {
      Self(bytes)
   }
}

impl From<&[u8]> for Message {
   fn from(bytes: &[u8]) -> Self {
      Self(bytes.to_vec())
   }
}

impl From<&str> for Message {
   fn from(text: &str) -> Self {
      Self(text.as_bytes().to_vec())
   }
}

impl From<String> for Message {
   fn from(text: String) -> Self {
      Self(text.into_bytes())
   }
}
