//! Port traits — the seams between the dispensing core and its
//! collaborators.
//!
//! ```text
//!   Engine / Safety ──▶ Port trait ──▶ Registry / Scale / Settings
//! ```
//!
//! The dispensing engine and the safety supervisor consume the tank
//! registry and the scale sampler exclusively through these traits, so
//! both are testable against mock implementations with a simulated
//! clock.

use crate::error::Result;

// ───────────────────────────────────────────────────────────────
// Servo control (engine / safety → registry → PWM driver)
// ───────────────────────────────────────────────────────────────

/// Write-side servo port. Implemented by the tank registry, which owns
/// the PWM driver and the servo/bus-power mode discipline.
pub trait ServoPort {
    /// Switch servo power (and the PWM expander role) on or off.
    fn set_servo_power(&mut self, on: bool);

    /// Continuous-rotation speed in [-1, 1]; |speed| < 0.01 maps to the
    /// stop pulse.
    fn set_continuous_servo(&mut self, channel: u8, speed: f32);

    /// Raw pulse command on one channel.
    fn set_servo_us(&mut self, channel: u8, us: u16);

    /// Drive the hopper gate to its calibrated open pulse.
    fn open_hopper(&mut self);

    /// Drive the hopper gate to its calibrated closed pulse.
    fn close_hopper(&mut self);

    /// Command every servo to neutral, wait for motion to cease, then
    /// cut servo power.
    fn stop_all_servos(&mut self);
}

// ───────────────────────────────────────────────────────────────
// Tank lookup (engine → registry)
// ───────────────────────────────────────────────────────────────

/// Read/update access to the known-tank set.
pub trait TankLookupPort {
    /// Bus index of the tank with `uid`, refreshing presence first.
    /// `None` if the tank is absent (or the registry is in servo mode).
    fn bus_of_tank(&mut self, uid: u64) -> Option<u8>;

    /// Kibble density in g/L from the cached record; `None` if unknown.
    fn density_g_per_l(&self, uid: u64) -> Option<f32>;

    /// Last-known remaining mass in grams.
    fn remaining_grams(&self, uid: u64) -> Option<f32>;

    /// Persist a new remaining-mass figure to the tank's EEPROM.
    fn update_remaining_grams(&mut self, uid: u64, grams: f32) -> Result<()>;
}

// ───────────────────────────────────────────────────────────────
// Scale (engine / safety → sampler)
// ───────────────────────────────────────────────────────────────

/// Read-side scale port: the most recent published average.
pub trait ScalePort {
    /// Last published weight in grams. NaN when the scale stopped
    /// responding.
    fn weight(&self) -> f32;

    /// Last published raw average.
    fn raw(&self) -> i32;

    /// Whether the last averaging window produced any sample.
    fn is_responding(&self) -> bool;

    /// Blocking tare (fixed sample count). A reader sees a post-tare
    /// average only after the next sampling window completes.
    fn tare(&mut self) -> Result<()>;
}

// ───────────────────────────────────────────────────────────────
// Calibration persistence (scale / registry → settings collaborator)
// ───────────────────────────────────────────────────────────────

/// Persistent calibration storage (the external settings collaborator).
pub trait CalibrationStore {
    fn load_scale_calibration(&self) -> Option<(f32, i32)>;
    fn save_scale_calibration(&mut self, factor: f32, offset: i32);

    fn load_hopper_calibration(&self) -> Option<(u16, u16)>;
    fn save_hopper_calibration(&mut self, closed_us: u16, open_us: u16);
}

// ───────────────────────────────────────────────────────────────
// Configuration (system config ↔ persistent settings)
// ───────────────────────────────────────────────────────────────

/// Errors from [`ConfigPort`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// No config found in storage (first boot).
    NotFound,
    /// Stored config failed deserialization.
    Corrupted,
    /// A field failed range validation; the message names it.
    ValidationFailed(&'static str),
    /// Generic I/O error from the storage backend.
    IoError,
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotFound => write!(f, "config not found"),
            Self::Corrupted => write!(f, "config corrupted"),
            Self::ValidationFailed(msg) => write!(f, "validation failed: {msg}"),
            Self::IoError => write!(f, "I/O error"),
        }
    }
}

/// Loads and persists the system configuration.
///
/// Implementations validate before persisting; invalid ranges are
/// rejected with [`ConfigError::ValidationFailed`], never silently
/// clamped.
pub trait ConfigPort {
    /// Load configuration, or defaults if none is stored.
    fn load(&self) -> core::result::Result<crate::config::SystemConfig, ConfigError>;

    /// Validate and persist configuration.
    fn save(&mut self, config: &crate::config::SystemConfig)
        -> core::result::Result<(), ConfigError>;
}

// ───────────────────────────────────────────────────────────────
// Key-value storage (recipe store → NVS)
// ───────────────────────────────────────────────────────────────

/// Errors from [`StoragePort`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    NotFound,
    Full,
    IoError,
}

impl core::fmt::Display for StorageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotFound => write!(f, "key not found"),
            Self::Full => write!(f, "storage full"),
            Self::IoError => write!(f, "I/O error"),
        }
    }
}

/// Namespaced key-value blobs in the non-volatile area. The recipe
/// store uses this only for its legacy-format migration.
pub trait StoragePort {
    /// Read a value. Returns the number of bytes written into `buf`.
    fn read(&self, namespace: &str, key: &str, buf: &mut [u8])
        -> core::result::Result<usize, StorageError>;

    /// Write a value atomically.
    fn write(&mut self, namespace: &str, key: &str, data: &[u8])
        -> core::result::Result<(), StorageError>;

    /// Delete a key. `Ok(())` even if the key did not exist.
    fn delete(&mut self, namespace: &str, key: &str) -> core::result::Result<(), StorageError>;

    /// Check whether a key exists without reading it.
    fn exists(&self, namespace: &str, key: &str) -> bool;
}
