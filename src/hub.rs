//! Device-state hub.
//!
//! The single shared observable state of the dispenser, guarded by one
//! lock with a hard 2-second acquisition budget. A failed acquisition is
//! reported as [`Error::LockTimeout`] ("service unavailable") — never a
//! silent skip of a write.
//!
//! The hub also hosts the feed-command inbox: a single mailbox slot with
//! a `processed` flag, consumed by the feed dispatcher. While safety
//! mode is engaged the inbox rejects every non-stop command.
//!
//! Locking discipline (hub > bridge > scale): tasks never hold the hub
//! lock while starting a bus-bridge operation — they copy out what they
//! need, release, act, then re-acquire to publish.

use core::fmt;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::tank::TankInfo;

/// Hard budget for acquiring the hub lock.
pub const HUB_LOCK_TIMEOUT: Duration = Duration::from_millis(2000);

/// Bounded feeding-history length; oldest entries fall off.
const HISTORY_CAP: usize = 32;

// ---------------------------------------------------------------------------
// State model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationState {
    #[default]
    Idle,
    Feeding,
    Error,
    Calibrating,
}

/// Externally visible feeding status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedingStatus {
    #[default]
    Idle,
    Processing,
    Error,
}

impl FeedingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Processing => "Processing...",
            Self::Error => "Error",
        }
    }

    /// Feeding is "active" for the safety supervisor's stall rule.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Processing)
    }
}

/// Notable device-level events, mirrored into `last_event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceEvent {
    #[default]
    None,
    MotorStall,
    BowlOverfill,
    UserStopped,
    TankEmpty,
    ScaleUnresponsive,
}

impl DeviceEvent {
    /// Stable code string used on the event bus.
    pub fn code(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::MotorStall => "motor_stall",
            Self::BowlOverfill => "bowl_overfill",
            Self::UserStopped => "user_stopped",
            Self::TankEmpty => "tank_empty",
            Self::ScaleUnresponsive => "scale_unresponsive",
        }
    }
}

// ---------------------------------------------------------------------------
// Feed commands
// ---------------------------------------------------------------------------

/// Commands the outside world can drop into the inbox.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum FeedCommand {
    #[default]
    None,
    Immediate {
        tank_uid: u64,
        grams: f32,
    },
    Recipe {
        recipe_uid: u32,
        servings: u16,
    },
    EmergencyStop,
    TareScale,
}

impl FeedCommand {
    pub fn is_stop(self) -> bool {
        matches!(self, Self::EmergencyStop)
    }
}

/// The single mailbox slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedInbox {
    pub command: FeedCommand,
    pub processed: bool,
}

/// Why a command submission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// An unprocessed command is already pending.
    Busy,
    /// Safety mode is engaged; only EmergencyStop is accepted.
    SafetyEngaged,
    /// The hub lock could not be acquired ("service unavailable").
    LockTimeout,
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "a command is already pending"),
            Self::SafetyEngaged => write!(f, "safety mode engaged"),
            Self::LockTimeout => write!(f, "service unavailable"),
        }
    }
}

/// One line of the feeding log.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedingHistoryEntry {
    /// Uptime milliseconds at completion.
    pub timestamp_ms: u64,
    /// "recipe" or "immediate".
    pub kind: &'static str,
    pub recipe_uid: u32,
    pub success: bool,
    pub grams: f32,
    pub description: String,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Everything behind the hub lock.
#[derive(Debug, Clone, Default)]
pub struct DeviceStateData {
    pub operation_state: OperationState,
    pub last_error: String,
    pub safety_mode_engaged: bool,
    pub last_event: DeviceEvent,

    // Scale
    pub current_weight: f32,
    pub current_raw: i32,
    pub is_weight_stable: bool,
    pub is_scale_responding: bool,

    // Tanks (mirror; the registry is the sole writer)
    pub connected_tanks: Vec<TankInfo>,

    // Feeding
    pub inbox: FeedInbox,
    pub feeding_status: FeedingStatus,
    pub feeding_history: Vec<FeedingHistoryEntry>,
    pub last_feed_time_ms: u64,
    pub last_recipe_uid: u32,

    pub servo_power: bool,
}

/// The hub itself. Cheap to share by reference across tasks.
#[derive(Default)]
pub struct DeviceHub {
    state: Mutex<DeviceStateData>,
}

impl DeviceHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` under the hub lock. Fails with [`Error::LockTimeout`] if
    /// the lock cannot be acquired within the 2-second budget.
    pub fn with_state<T>(&self, f: impl FnOnce(&mut DeviceStateData) -> T) -> Result<T> {
        match self.state.try_lock_for(HUB_LOCK_TIMEOUT) {
            Some(mut guard) => Ok(f(&mut guard)),
            None => {
                log::error!("hub: state lock acquisition timed out");
                Err(Error::LockTimeout)
            }
        }
    }

    /// Place a command in the inbox.
    ///
    /// A pending unprocessed command refuses new submissions (`Busy`),
    /// except `EmergencyStop` which always overwrites. While safety mode
    /// is engaged every non-stop command is refused.
    pub fn submit_command(&self, command: FeedCommand) -> core::result::Result<(), SubmitError> {
        let outcome = self.with_state(|state| {
            if state.safety_mode_engaged && !command.is_stop() {
                return Err(SubmitError::SafetyEngaged);
            }
            if !state.inbox.processed && !command.is_stop() {
                return Err(SubmitError::Busy);
            }
            state.inbox = FeedInbox {
                command,
                processed: false,
            };
            Ok(())
        });
        match outcome {
            Ok(inner) => inner,
            Err(_) => Err(SubmitError::LockTimeout),
        }
    }

    /// Consume the pending command, if any, marking it processed.
    pub fn take_command(&self) -> Result<Option<FeedCommand>> {
        self.with_state(|state| {
            if state.inbox.processed {
                None
            } else {
                state.inbox.processed = true;
                Some(state.inbox.command)
            }
        })
    }

    /// Append a history entry, keeping the log bounded.
    pub fn push_history(&self, entry: FeedingHistoryEntry) -> Result<()> {
        self.with_state(|state| {
            if state.feeding_history.len() >= HISTORY_CAP {
                state.feeding_history.remove(0);
            }
            state.feeding_history.push(entry);
        })
    }

    /// Clear the sticky safety flag (explicit user action).
    pub fn clear_safety(&self) -> Result<()> {
        self.with_state(|state| {
            state.safety_mode_engaged = false;
            state.last_event = DeviceEvent::None;
            if state.feeding_status == FeedingStatus::Error {
                state.feeding_status = FeedingStatus::Idle;
            }
        })
    }
}
