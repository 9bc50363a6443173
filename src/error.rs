//! Unified error types for the KibbleT5 firmware.
//!
//! One enum per subsystem, each funneling into the crate-wide [`Error`]
//! so the control loop's error handling stays uniform.  Variants are
//! `Copy` wherever possible so they pass cheaply through the dispatcher
//! and safety supervisor without allocation.

use core::fmt;

// ---------------------------------------------------------------------------
// Top-level firmware error
// ---------------------------------------------------------------------------

/// Every fallible operation in the firmware funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A bus-bridge transaction failed.
    Bridge(BridgeError),
    /// An on-tank EEPROM record failed its integrity checks.
    Record(RecordError),
    /// The load cell failed or produced unusable data.
    Scale(ScaleError),
    /// A dispensing cycle failed.
    Dispense(DispenseError),
    /// Recipe storage failed.
    Store(StoreError),
    /// The device-state hub lock could not be acquired within its budget.
    /// Surfaced to the API boundary as "service unavailable".
    LockTimeout,
    /// A bus operation was requested while the PWM expander is in servo
    /// role (the EEPROM pull-ups are unpowered).
    ServoModeActive,
    /// The referenced tank is not present on any bus.
    TankNotFound,
    /// Configuration is invalid or could not be loaded.
    Config(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bridge(e) => write!(f, "bridge: {e}"),
            Self::Record(e) => write!(f, "record: {e}"),
            Self::Scale(e) => write!(f, "scale: {e}"),
            Self::Dispense(e) => write!(f, "dispense: {e}"),
            Self::Store(e) => write!(f, "store: {e}"),
            Self::LockTimeout => write!(f, "service unavailable (lock timeout)"),
            Self::ServoModeActive => write!(f, "bus unavailable while in servo mode"),
            Self::TankNotFound => write!(f, "tank not found"),
            Self::Config(msg) => write!(f, "config: {msg}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Bus-bridge transport errors
// ---------------------------------------------------------------------------

/// Failures on the UART link to the 1-Wire bridge MCU.
///
/// The bridge reports its own internal 1-Wire layer failures through a
/// Nack frame carrying a raw code; those pass through as [`Self::Nack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeError {
    /// No acknowledgement to a wake request within the retry budget.
    Silent,
    /// The frame decoder rejected the byte stream.
    Framing,
    /// A frame decoded but its shape or length was unexpected.
    InvalidPayload,
    /// A read response echoed a mismatched header or oversized length.
    ReadResp,
    /// Requested bus index is outside 0..=5.
    BusIndexOutOfRange,
    /// No complete response within the operation's timeout.
    Timeout,
    /// The bridge refused the request; carries its internal error code.
    Nack(u8),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Silent => write!(f, "bridge silent"),
            Self::Framing => write!(f, "framing error"),
            Self::InvalidPayload => write!(f, "invalid payload"),
            Self::ReadResp => write!(f, "read response header mismatch"),
            Self::BusIndexOutOfRange => write!(f, "bus index out of range"),
            Self::Timeout => write!(f, "timed out"),
            Self::Nack(code) => write!(f, "bridge nack (code {code})"),
        }
    }
}

impl From<BridgeError> for Error {
    fn from(e: BridgeError) -> Self {
        Self::Bridge(e)
    }
}

// ---------------------------------------------------------------------------
// EEPROM record integrity errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordError {
    /// The Reed–Solomon decoder declared the block uncorrectable.
    UncorrectableEcc,
    /// A structural bound was violated (name length, bus index, servo pulse).
    OutOfBoundsField,
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UncorrectableEcc => write!(f, "uncorrectable ECC"),
            Self::OutOfBoundsField => write!(f, "field out of bounds"),
        }
    }
}

impl From<RecordError> for Error {
    fn from(e: RecordError) -> Self {
        Self::Record(e)
    }
}

// ---------------------------------------------------------------------------
// Scale errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleError {
    /// Every conversion attempt in an averaging window failed.
    Unresponsive,
    /// A weight read came back NaN (post-tare check failed).
    NotANumber,
}

impl fmt::Display for ScaleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unresponsive => write!(f, "unresponsive"),
            Self::NotANumber => write!(f, "NaN reading"),
        }
    }
}

impl From<ScaleError> for Error {
    fn from(e: ScaleError) -> Self {
        Self::Scale(e)
    }
}

// ---------------------------------------------------------------------------
// Dispensing errors
// ---------------------------------------------------------------------------

/// Failure reasons for a dispensing cycle.
///
/// `CloseDetectionMissed` is recoverable (the engine falls back to the
/// configured closed pulse); `TankEmpty` is contained to one ingredient.
/// The remaining variants terminate the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispenseError {
    #[default]
    None,
    /// No weight spike observed while closing; fell back to configured pulse.
    CloseDetectionMissed,
    /// An ingredient's tank ran dry mid-dispense.
    TankEmpty,
    /// The scale went NaN or unresponsive during close/tare.
    ScaleUnresponsive,
    /// A servo operation never completed.
    ServoTimeout,
    /// The user commanded an emergency stop.
    EmergencyStop,
    /// Every remaining ingredient stalled; no further progress possible.
    DispenseTimeout,
    /// The requested tank is not present on any bus.
    TankNotFound,
    /// The requested recipe uid does not exist.
    RecipeNotFound,
}

impl fmt::Display for DispenseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "no error"),
            Self::CloseDetectionMissed => write!(f, "close detection missed"),
            Self::TankEmpty => write!(f, "tank empty"),
            Self::ScaleUnresponsive => write!(f, "scale unresponsive"),
            Self::ServoTimeout => write!(f, "servo timeout"),
            Self::EmergencyStop => write!(f, "emergency stop"),
            Self::DispenseTimeout => write!(f, "dispense timed out"),
            Self::TankNotFound => write!(f, "tank not found"),
            Self::RecipeNotFound => write!(f, "recipe not found"),
        }
    }
}

impl From<DispenseError> for Error {
    fn from(e: DispenseError) -> Self {
        Self::Dispense(e)
    }
}

// ---------------------------------------------------------------------------
// Recipe storage errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// A file's recomputed CRC did not match its envelope.
    CrcMismatch,
    /// No replica could be written.
    WriteFailed,
    /// Ingredient percentages do not sum to 100 ± 0.1.
    PercentageSum,
    /// The referenced recipe uid does not exist.
    NotFound,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CrcMismatch => write!(f, "CRC mismatch"),
            Self::WriteFailed => write!(f, "write failed on all replicas"),
            Self::PercentageSum => write!(f, "percentages do not sum to 100"),
            Self::NotFound => write!(f, "recipe not found"),
        }
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Firmware-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
