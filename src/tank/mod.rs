//! Tank identity, records, and the registry.
//!
//! A *tank* is a hot-swappable food container carrying a 1-Wire EEPROM
//! with a factory 64-bit UID. The registry reconciles what the bridge
//! reports on the six buses with the logical set of known tanks.

pub mod record;
pub mod registry;

pub use record::{RecordFec, TankRecord};
pub use registry::TankRegistry;

use core::fmt;

use record::BUS_INDEX_NEVER_PLACED;

/// In-memory view of one tank.
///
/// `full_info == false` marks a mere presence witness: only `uid` and
/// `bus_index` are meaningful until the EEPROM has been read.
///
/// Units differ from the wire: capacity in litres (EEPROM stores mL) and
/// density in kg/L (EEPROM stores g/L). The conversion happens here and
/// nowhere else.
#[derive(Debug, Clone, PartialEq)]
pub struct TankInfo {
    pub uid: u64,
    /// Bus the tank currently sits on, or -1 while detached.
    pub bus_index: i8,
    pub name: String,
    pub capacity_l: f32,
    pub density_kg_per_l: f32,
    pub remaining_weight_g: f32,
    pub servo_idle_us: u16,
    pub last_base_mac: [u8; 6],
    pub full_info: bool,
}

impl TankInfo {
    /// A presence witness: the tank was seen on a bus but its record has
    /// not been read yet.
    pub fn presence_witness(uid: u64, bus_index: u8) -> Self {
        Self {
            uid,
            bus_index: bus_index as i8,
            name: String::new(),
            capacity_l: 0.0,
            density_kg_per_l: 0.0,
            remaining_weight_g: 0.0,
            servo_idle_us: 1500,
            last_base_mac: [0; 6],
            full_info: false,
        }
    }

    /// Populate from a validated EEPROM record (unit conversions applied).
    pub fn fill_from_record(&mut self, record: &TankRecord) {
        self.name = record.name.clone();
        self.capacity_l = record.capacity_ml as f32 / 1000.0;
        self.density_kg_per_l = record.density_g_per_l as f32 / 1000.0;
        self.remaining_weight_g = record.remaining_grams as f32;
        self.servo_idle_us = record.servo_idle_us;
        self.last_base_mac = record.last_base_mac;
        self.full_info = true;
    }

    fn capacity_ml(&self) -> u16 {
        (self.capacity_l * 1000.0).round().clamp(0.0, u16::MAX as f32) as u16
    }

    fn density_g_per_l(&self) -> u16 {
        (self.density_kg_per_l * 1000.0)
            .round()
            .clamp(0.0, u16::MAX as f32) as u16
    }

    fn remaining_grams(&self) -> u16 {
        self.remaining_weight_g
            .round()
            .clamp(0.0, u16::MAX as f32) as u16
    }

    /// Overlay this tank's fields onto `record`, returning which fields
    /// actually differed. Comparison happens in the record's own integer
    /// domain so float jitter cannot fabricate discrepancies.
    pub fn overlay_record(&self, record: &mut TankRecord) -> Discrepancies {
        let mut changed = Discrepancies::NONE;

        if record.name != self.name {
            changed |= Discrepancies::NAME;
            record.name = self.name.clone();
        }

        let bus = if self.bus_index >= 0 {
            self.bus_index as u8
        } else {
            BUS_INDEX_NEVER_PLACED
        };
        if record.last_bus_index != bus {
            changed |= Discrepancies::BUS_INDEX;
            record.last_bus_index = bus;
        }

        if record.last_base_mac != self.last_base_mac {
            changed |= Discrepancies::MAC;
            record.last_base_mac = self.last_base_mac;
        }

        let capacity = self.capacity_ml();
        let density = self.density_g_per_l();
        if record.servo_idle_us != self.servo_idle_us
            || record.capacity_ml != capacity
            || record.density_g_per_l != density
        {
            changed |= Discrepancies::SPECS;
            record.servo_idle_us = self.servo_idle_us;
            record.capacity_ml = capacity;
            record.density_g_per_l = density;
        }

        let remaining = self.remaining_grams();
        if record.remaining_grams != remaining {
            changed |= Discrepancies::REMAINING;
            record.remaining_grams = remaining;
        }

        changed
    }
}

/// Which record fields a commit actually rewrote. Informational only —
/// callers log it but never branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Discrepancies(u8);

impl Discrepancies {
    pub const NONE: Self = Self(0);
    pub const NAME: Self = Self(1);
    pub const SPECS: Self = Self(2);
    pub const MAC: Self = Self(4);
    pub const BUS_INDEX: Self = Self(8);
    pub const REMAINING: Self = Self(16);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl core::ops::BitOr for Discrepancies {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for Discrepancies {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Discrepancies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let mut first = true;
        for (bit, label) in [
            (Self::NAME, "name"),
            (Self::SPECS, "specs"),
            (Self::MAC, "mac"),
            (Self::BUS_INDEX, "bus"),
            (Self::REMAINING, "remaining"),
        ] {
            if self.contains(bit) {
                if !first {
                    write!(f, "+")?;
                }
                write!(f, "{label}")?;
                first = false;
            }
        }
        Ok(())
    }
}
