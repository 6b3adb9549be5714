//! BLE link layer for vending-machine controllers.
//!
//! Discovery of machines advertising the vending service, lossless message
//! framing over a fixed packet size, keepalive supervision and the
//! connection lifecycle of one session at a time.

pub mod bluetooth;
pub mod config;
pub mod error;
pub mod event;
pub mod vending;

pub use bluetooth::{
   link::Link,
   manager::{ConnectionManager, ConnectionState},
   radio::Radio,
   scanner::Scanner,
};
pub use config::Config;
pub use error::{ErrorKind, Result, VendError};
pub use event::{ScanEvent, SessionEvent, SessionId};
pub use vending::device::{DeviceHandle, Message};
