//! KibbleT5 firmware library.
//!
//! Core control logic of the multi-tank kibble dispenser: tank registry
//! and EEPROM codec, dispensing engine, scale sampler, safety
//! supervisor, device-state hub, and recipe store. All ESP-IDF-specific
//! code is guarded by `#[cfg(target_os = "espidf")]` within each
//! module, so the whole crate builds and tests on the host.

#![deny(unused_must_use)]

pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod fec;
pub mod hub;
pub mod ports;
pub mod safety;
pub mod scale;
pub mod store;
pub mod tank;

pub mod pins;

pub mod adapters;
pub mod drivers;
