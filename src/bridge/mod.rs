//! UART link to the 1-Wire bridge MCU.

pub mod client;
pub mod frame;

pub use client::{BridgeClient, BridgePort, PresenceReport, RollCallUids};
