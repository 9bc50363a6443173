//! Dispensing state: phases and the per-feed context.

use heapless::Vec;

use crate::error::DispenseError;

/// Most ingredients a single feed can mix (one per bus).
pub const MAX_INGREDIENTS: usize = 6;

/// Phases of the three-phase dispensing cycle.
///
/// ```text
/// Idle → PurgeOpen → PurgeWiggle → PurgeSettle → CloseMoving ⇄ CloseDetectSpike
///          ▲                                          │              │
///          │                                          ▼              ▼
///          │                                     CloseBackoff ──▶ Tare
///          │                                                        │
///          └── DispenseSettle ◀── DispenseAuger ◀───────────────────┘
///                    │
///                    └──▶ (final purge) ──▶ Complete | Error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispensePhase {
    #[default]
    Idle,
    PurgeOpen,
    PurgeWiggle,
    PurgeSettle,
    CloseMoving,
    CloseDetectSpike,
    CloseBackoff,
    Tare,
    DispenseAuger,
    DispenseSettle,
    Complete,
    Error,
}

impl DispensePhase {
    /// Phases during which servo power must be on.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Idle | Self::Complete | Self::Error)
    }
}

/// One ingredient's live dispensing state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IngredientState {
    pub tank_uid: u64,
    /// Share of the total target, 0..=100.
    pub percentage: f32,
    /// Auger servo channel (equals the tank's bus index).
    pub channel: u8,
    /// Kibble density in g/L (default applied when the tank record
    /// carries none).
    pub density_g_per_l: f32,
    /// Grams still owed to the bowl by this ingredient.
    pub remaining_g: f32,
    /// Grams actually delivered so far.
    pub consumed_g: f32,
    /// Set when this ingredient's auger stalled out; it is skipped for
    /// the rest of the feed.
    pub stalled: bool,
}

/// All state for one feed operation. Created per feed, reset between
/// phases, discarded at cycle end.
#[derive(Debug, Clone, Default)]
pub struct DispensingContext {
    /// Recipe uid, or 0 for an immediate feed.
    pub recipe_uid: u32,
    pub servings: u16,
    pub ingredients: Vec<IngredientState, MAX_INGREDIENTS>,

    pub total_target_g: f32,
    pub dispensed_g: f32,

    pub batch_target_g: f32,
    pub batch_dispensed_g: f32,

    /// Learned hopper-closed pulse from spike detection.
    pub learned_close_us: u16,
    pub close_calibrated: bool,

    pub phase: DispensePhase,
    pub error: DispenseError,
    /// Uptime ms at which the current phase was entered.
    pub phase_started_ms: u64,

    pub wiggle_count: u8,
    pub close_attempts: u8,
    pub pre_close_weight: f32,
}

impl DispensingContext {
    /// Grams still owed overall.
    pub fn total_remaining_g(&self) -> f32 {
        (self.total_target_g - self.dispensed_g).max(0.0)
    }

    /// Every ingredient that still owes a meaningful amount has stalled.
    pub fn no_progress_possible(&self, min_portion_g: f32) -> bool {
        self.ingredients
            .iter()
            .filter(|i| i.remaining_g > min_portion_g)
            .all(|i| i.stalled)
    }
}
