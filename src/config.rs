//! System configuration parameters
//!
//! All tunable parameters for the KibbleT5 dispenser. Values can be
//! overridden via NVS; everything else in this crate reads them from a
//! [`SystemConfig`] snapshot rather than private constants.

use serde::{Deserialize, Serialize};

/// Core system configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    // --- Scale ---
    /// Load cell calibration factor (raw counts per gram).
    pub scale_calibration_factor: f32,
    /// Load cell zero offset (raw counts at empty bowl).
    pub scale_zero_offset: i32,
    /// Fixed number of samples for a blocking weight average.
    pub scale_samples_count: u8,

    // --- Hopper servo ---
    /// Pulse width that fully opens the hopper gate (µs).
    pub hopper_open_us: u16,
    /// Pulse width that fully closes the hopper gate (µs).
    pub hopper_closed_us: u16,

    // --- Dispensing ---
    /// Minimum weight delta (g) that counts as dispensing progress.
    pub dispense_weight_change_threshold_g: f32,
    /// How long without progress before an auger is declared stalled (ms).
    pub dispense_no_change_timeout_ms: u32,

    // --- Safety ---
    /// Bowl weight (g) above which the overfill rule trips.
    pub overfill_limit_g: f32,
    /// Weight delta (g) that resets the feeding stall watchdog.
    pub stall_reset_delta_g: f32,
    /// Stall watchdog timeout (ms).
    pub stall_timeout_ms: u32,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            // Scale
            scale_calibration_factor: 400.0,
            scale_zero_offset: 0,
            scale_samples_count: 10,

            // Hopper
            hopper_open_us: 2000,
            hopper_closed_us: 1000,

            // Dispensing
            dispense_weight_change_threshold_g: 3.0,
            dispense_no_change_timeout_ms: 10_000,

            // Safety
            overfill_limit_g: 500.0,
            stall_reset_delta_g: 0.2,
            stall_timeout_ms: 5_000,
        }
    }
}
