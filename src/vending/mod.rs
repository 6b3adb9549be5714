//! Vending link protocol and device model.
//!
//! This module contains the transport-independent parts of the link layer:
//! the wire format, fragmentation and reassembly, keepalive bookkeeping and
//! the discovered-device model.

pub mod device;
pub mod keepalive;
pub mod packetizer;
pub mod protocol;
pub mod recognition;
