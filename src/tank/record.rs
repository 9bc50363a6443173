//! On-tank EEPROM record codec.
//!
//! Fixed 128-byte little-endian layout:
//!
//! ```text
//! ┌────────┬──────┬──────────────────────────────────────────┐
//! │ Offset │ Size │ Field                                    │
//! ├────────┼──────┼──────────────────────────────────────────┤
//! │ 0      │ 6    │ last_base_mac                            │
//! │ 6      │ 1    │ last_bus_index (0..5, 0xFF never placed) │
//! │ 7      │ 1    │ name_length (incl. terminator, ≤ 80)     │
//! │ 8      │ 2    │ capacity_ml                              │
//! │ 10     │ 2    │ density_g_per_l                          │
//! │ 12     │ 2    │ servo_idle_us                            │
//! │ 14     │ 2    │ remaining_grams                          │
//! │ 16     │ 80   │ name (UTF-8, NUL-terminated)             │
//! │ 96     │ 32   │ Reed–Solomon parity over bytes 0..96     │
//! └────────┴──────┴──────────────────────────────────────────┘
//! ```
//!
//! Serialization is explicit byte-by-byte; the record is never punned
//! from a struct layout. Every write recomputes the parity over the
//! full data section.

use crate::error::RecordError;
use crate::fec::ReedSolomon;

pub const RECORD_SIZE: usize = 128;
pub const RECORD_DATA_SIZE: usize = 96;
pub const RECORD_ECC_SIZE: usize = 32;
pub const NAME_FIELD_SIZE: usize = 80;

/// Bus index value meaning "this tank was never placed on a bus".
pub const BUS_INDEX_NEVER_PLACED: u8 = 0xFF;

/// Servo pulse bounds accepted as structurally sane.
pub const SERVO_IDLE_MIN_US: u16 = 500;
pub const SERVO_IDLE_MAX_US: u16 = 2500;

/// Codec instance for the record geometry.
pub type RecordFec = ReedSolomon<RECORD_DATA_SIZE, RECORD_ECC_SIZE>;

/// Decoded tank record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TankRecord {
    pub last_base_mac: [u8; 6],
    pub last_bus_index: u8,
    pub capacity_ml: u16,
    pub density_g_per_l: u16,
    pub servo_idle_us: u16,
    pub remaining_grams: u16,
    /// Stored NUL-terminated; at most 79 bytes of content.
    pub name: String,
}

impl TankRecord {
    /// The record written when an EEPROM is blank or fails integrity.
    pub fn factory_default() -> Self {
        Self {
            last_base_mac: [0; 6],
            last_bus_index: BUS_INDEX_NEVER_PLACED,
            capacity_ml: 0,
            density_g_per_l: 0,
            servo_idle_us: 1500,
            remaining_grams: 0,
            name: "New Tank".to_string(),
        }
    }

    /// Serialize to the wire image, recomputing parity.
    pub fn to_bytes(&self, fec: &RecordFec) -> [u8; RECORD_SIZE] {
        let mut data = [0u8; RECORD_DATA_SIZE];
        data[0..6].copy_from_slice(&self.last_base_mac);
        data[6] = self.last_bus_index;

        let name_bytes = self.name.as_bytes();
        let content_len = name_bytes.len().min(NAME_FIELD_SIZE - 1);
        data[7] = (content_len + 1) as u8; // content + terminator
        data[8..10].copy_from_slice(&self.capacity_ml.to_le_bytes());
        data[10..12].copy_from_slice(&self.density_g_per_l.to_le_bytes());
        data[12..14].copy_from_slice(&self.servo_idle_us.to_le_bytes());
        data[14..16].copy_from_slice(&self.remaining_grams.to_le_bytes());
        data[16..16 + content_len].copy_from_slice(&name_bytes[..content_len]);
        // data[16 + content_len] is already the NUL terminator.

        let ecc = fec.encode(&data);
        let mut out = [0u8; RECORD_SIZE];
        out[..RECORD_DATA_SIZE].copy_from_slice(&data);
        out[RECORD_DATA_SIZE..].copy_from_slice(&ecc);
        out
    }

    /// Decode and validate a wire image.
    ///
    /// Runs the record integrity procedure: FEC decode over bytes 0..96,
    /// then structural bounds. Returns the corrected-byte count alongside
    /// the record. The input is never mutated.
    pub fn from_bytes(
        bytes: &[u8; RECORD_SIZE],
        fec: &RecordFec,
    ) -> Result<(Self, usize), RecordError> {
        let mut data = [0u8; RECORD_DATA_SIZE];
        data.copy_from_slice(&bytes[..RECORD_DATA_SIZE]);
        let mut ecc = [0u8; RECORD_ECC_SIZE];
        ecc.copy_from_slice(&bytes[RECORD_DATA_SIZE..]);

        let corrected = fec
            .decode(&mut data, &mut ecc)
            .map_err(|_| RecordError::UncorrectableEcc)?;

        let name_length = data[7] as usize;
        let last_bus_index = data[6];
        let servo_idle_us = u16::from_le_bytes([data[12], data[13]]);

        if name_length > NAME_FIELD_SIZE {
            return Err(RecordError::OutOfBoundsField);
        }
        if last_bus_index > 6 && last_bus_index != BUS_INDEX_NEVER_PLACED {
            return Err(RecordError::OutOfBoundsField);
        }
        if !(SERVO_IDLE_MIN_US..=SERVO_IDLE_MAX_US).contains(&servo_idle_us) {
            return Err(RecordError::OutOfBoundsField);
        }

        // Name content stops at the first NUL within its stated length
        // (the stated length includes the terminator).
        let content_len = name_length.saturating_sub(1);
        let name_area = &data[16..16 + content_len];
        let content = match name_area.iter().position(|&b| b == 0) {
            Some(nul) => &name_area[..nul],
            None => name_area,
        };
        let name = String::from_utf8_lossy(content).into_owned();

        let mut last_base_mac = [0u8; 6];
        last_base_mac.copy_from_slice(&data[0..6]);

        Ok((
            Self {
                last_base_mac,
                last_bus_index,
                capacity_ml: u16::from_le_bytes([data[8], data[9]]),
                density_g_per_l: u16::from_le_bytes([data[10], data[11]]),
                servo_idle_us,
                remaining_grams: u16::from_le_bytes([data[14], data[15]]),
                name,
            },
            corrected,
        ))
    }
}
