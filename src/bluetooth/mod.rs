//! Bluetooth layer for vending peripherals.
//!
//! This module provides the link and radio capabilities (BlueZ and
//! in-memory implementations), discovery and the connection manager.

pub mod gatt;
pub mod link;
pub mod manager;
pub mod mock;
pub mod radio;
pub mod scanner;
