//! Configuration management for the vending link.
//!
//! This module handles loading and saving configuration from disk and
//! validating the session parameters before a scan or connection starts.

use std::{
   env, fs,
   num::{NonZeroU32, NonZeroUsize},
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
   error::{Result, VendError},
   vending::{
      protocol::{VENDING_NOTIFY_UUID, VENDING_SERVICE_UUID, VENDING_WRITE_UUID},
      recognition::CandidateFilter,
   },
};

/// How a `send` issued while another message is being written is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendPolicy {
   /// Wait behind the message in flight.
   #[default]
   Queue,
   /// Fail with `SessionBusy`.
   Reject,
}

/// Main configuration structure.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
   /// Payload bytes per packet.
   #[serde(default = "default_packet_size")]
   pub packet_size: usize,

   #[serde(default = "default_scan_timeout")]
   pub scan_timeout_ms: u64,

   #[serde(default)]
   pub with_device_info: bool,

   #[serde(default = "default_keepalive_interval")]
   pub keepalive_interval_ms: u64,

   #[serde(default = "default_keepalive_miss_threshold")]
   pub keepalive_miss_threshold: u32,

   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_ms: u64,

   /// Consecutive protocol anomalies tolerated before the session is dropped.
   #[serde(default = "default_anomaly_threshold")]
   pub anomaly_threshold: u32,

   #[serde(default)]
   pub send_policy: SendPolicy,

   #[serde(default = "default_service_uuid")]
   pub service_uuid: Uuid,

   #[serde(default = "default_write_uuid")]
   pub write_uuid: Uuid,

   #[serde(default = "default_notify_uuid")]
   pub notify_uuid: Uuid,

   /// Reconnect attempts made by the daemon before giving up.
   #[serde(default = "default_max_retries")]
   pub max_retries: u32,

   #[serde(default)]
   pub filter: CandidateFilter,
}

const fn default_packet_size() -> usize {
   20
}

const fn default_scan_timeout() -> u64 {
   5_000
}

const fn default_keepalive_interval() -> u64 {
   2_000
}

const fn default_keepalive_miss_threshold() -> u32 {
   3
}

const fn default_connect_timeout() -> u64 {
   10_000
}

const fn default_anomaly_threshold() -> u32 {
   5
}

const fn default_service_uuid() -> Uuid {
   VENDING_SERVICE_UUID
}

const fn default_write_uuid() -> Uuid {
   VENDING_WRITE_UUID
}

const fn default_notify_uuid() -> Uuid {
   VENDING_NOTIFY_UUID
}

const fn default_max_retries() -> u32 {
   3
}

impl Default for Config {
   fn default() -> Self {
      Self {
         packet_size: default_packet_size(),
         scan_timeout_ms: default_scan_timeout(),
         with_device_info: false,
         keepalive_interval_ms: default_keepalive_interval(),
         keepalive_miss_threshold: default_keepalive_miss_threshold(),
         connect_timeout_ms: default_connect_timeout(),
         anomaly_threshold: default_anomaly_threshold(),
         send_policy: SendPolicy::default(),
         service_uuid: default_service_uuid(),
         write_uuid: default_write_uuid(),
         notify_uuid: default_notify_uuid(),
         max_retries: default_max_retries(),
         filter: CandidateFilter::default(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   /// Loads configuration from `path`, writing the defaults there if missing.
   pub fn load_from(path: &Path) -> Result<Self> {
      let config = if path.exists() {
         let contents = fs::read_to_string(path)?;
         toml::from_str::<Self>(&contents)?
      } else {
         let config = Self::default();
         config.save_to(path)?;
         config
      };
      config.validate()?;
      Ok(config)
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("VENDLINK_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(VendError::ConfigDirNotFound);
      };

      Ok(config_dir.join("vendlink").join("config.toml"))
   }

   /// Rejects values no session can start with.
   pub fn validate(&self) -> Result<()> {
      if self.packet_size == 0 {
         return Err(VendError::InvalidConfiguration("packet_size must be > 0"));
      }
      if self.keepalive_miss_threshold == 0 {
         return Err(VendError::InvalidConfiguration(
            "keepalive_miss_threshold must be > 0",
         ));
      }
      if self.keepalive_interval_ms == 0 {
         return Err(VendError::InvalidConfiguration(
            "keepalive_interval_ms must be > 0",
         ));
      }
      if self.connect_timeout_ms == 0 {
         return Err(VendError::InvalidConfiguration("connect_timeout_ms must be > 0"));
      }
      if self.scan_timeout_ms == 0 {
         return Err(VendError::InvalidConfiguration("scan_timeout_ms must be > 0"));
      }
      if self.write_uuid == self.notify_uuid {
         return Err(VendError::InvalidConfiguration(
            "write_uuid and notify_uuid must differ",
         ));
      }
      Ok(())
   }

   pub fn packet_size(&self) -> Result<NonZeroUsize> {
      NonZeroUsize::new(self.packet_size)
         .ok_or(VendError::InvalidConfiguration("packet_size must be > 0"))
   }

   pub fn keepalive_miss_threshold(&self) -> Result<NonZeroU32> {
      NonZeroU32::new(self.keepalive_miss_threshold).ok_or(VendError::InvalidConfiguration(
         "keepalive_miss_threshold must be > 0",
      ))
   }

   pub const fn scan_timeout(&self) -> Duration {
      Duration::from_millis(self.scan_timeout_ms)
   }

   pub const fn keepalive_interval(&self) -> Duration {
      Duration::from_millis(self.keepalive_interval_ms)
   }

   pub const fn connect_timeout(&self) -> Duration {
      Duration::from_millis(self.connect_timeout_ms)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_defaults_are_valid() {
      let config = Config::default();
      config.validate().unwrap();
      assert_eq!(config.packet_size().unwrap().get(), 20);
      assert_eq!(config.keepalive_interval(), Duration::from_secs(2));
      assert_eq!(config.send_policy, SendPolicy::Queue);
   }

   #[test]
   fn test_zero_packet_size_rejected() {
      let config = Config {
         packet_size: 0,
         ..Default::default()
      };
      assert!(matches!(
         config.validate(),
         Err(VendError::InvalidConfiguration(_))
      ));
      assert!(config.packet_size().is_err());
   }

   #[test]
   fn test_zero_miss_threshold_rejected() {
      let config = Config {
         keepalive_miss_threshold: 0,
         ..Default::default()
      };
      assert!(config.validate().is_err());
   }

   #[test]
   fn test_partial_toml_uses_defaults() {
      let config: Config = toml::from_str(
         r#"
         packet_size = 128
         send_policy = "reject"

         [filter]
         serial = "SN-0042"
         "#,
      )
      .unwrap();
      assert_eq!(config.packet_size, 128);
      assert_eq!(config.send_policy, SendPolicy::Reject);
      assert_eq!(config.filter.serial.as_deref(), Some("SN-0042"));
      assert_eq!(config.keepalive_miss_threshold, 3);
      assert_eq!(config.service_uuid, VENDING_SERVICE_UUID);
   }

   #[test]
   fn test_load_creates_default_file() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("vendlink").join("config.toml");

      let config = Config::load_from(&path).unwrap();
      assert!(path.exists());
      assert_eq!(config, Config::default());

      let modified = Config {
         with_device_info: true,
         connect_timeout_ms: 2_500,
         ..config
      };
      modified.save_to(&path).unwrap();
      assert_eq!(Config::load_from(&path).unwrap(), modified);
   }

   #[test]
   fn test_load_rejects_invalid_file() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(&path, "packet_size = 0\n").unwrap();
      assert!(matches!(
         Config::load_from(&path),
         Err(VendError::InvalidConfiguration(_))
      ));
   }
}
