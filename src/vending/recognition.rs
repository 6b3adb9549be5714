//! Candidate selection for discovered vending machines.
//!
//! A machine is usually looked up by the model and serial number printed on
//! it, which are only known after the Device Information service was read.
//! Candidates without that metadata can still be matched by name.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::vending::device::DeviceHandle;

/// Criteria a candidate must satisfy. Empty criteria match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateFilter {
   #[serde(default)]
   pub model: Option<SmolStr>,
   #[serde(default)]
   pub serial: Option<SmolStr>,
   /// Case-insensitive substring of the advertised name.
   #[serde(default)]
   pub name: Option<SmolStr>,
}

impl CandidateFilter {
   pub fn is_empty(&self) -> bool {
      self.model.is_none() && self.serial.is_none() && self.name.is_none()
   }

   /// Whether the filter needs Device Information to decide.
   pub fn needs_device_info(&self) -> bool {
      self.model.is_some() || self.serial.is_some()
   }

   pub fn matches(&self, device: &DeviceHandle) -> bool {
      if let Some(pattern) = &self.name
         && !device
            .name()
            .to_ascii_lowercase()
            .contains(&pattern.to_ascii_lowercase())
      {
         return false;
      }

      if !self.needs_device_info() {
         return true;
      }

      let Some(info) = device.info() else {
         log::debug!("{device}: no device info, cannot match model/serial");
         return false;
      };
      field_matches(self.model.as_ref(), info.model.as_ref())
         && field_matches(self.serial.as_ref(), info.serial.as_ref())
   }
}

fn field_matches(wanted: Option<&SmolStr>, actual: Option<&SmolStr>) -> bool {
   match (wanted, actual) {
      (None, _) => true,
      (Some(w), Some(a)) => w.trim().eq_ignore_ascii_case(a.trim()),
      (Some(_), None) => false,
   }
}

/// Keeps matching candidates, strongest signal first.
pub fn rank_candidates(candidates: &[DeviceHandle], filter: &CandidateFilter) -> Vec<DeviceHandle> {
   let mut ranked: Vec<_> = candidates
      .iter()
      .filter(|d| filter.matches(d))
      .cloned()
      .collect();
   ranked.sort_by(|a, b| b.rssi().cmp(&a.rssi()).then_with(|| a.id().cmp(b.id())));
   ranked
}
