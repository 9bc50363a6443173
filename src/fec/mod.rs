//! Forward error correction for the on-tank EEPROM records.

pub mod gf256;
pub mod rs;

pub use rs::{ReedSolomon, Uncorrectable};
