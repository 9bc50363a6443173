//! Dispensing engine — the three-phase feed cycle.

pub mod context;
pub mod dispenser;

pub use context::{DispensePhase, DispensingContext, IngredientState};
pub use dispenser::{DispensingEngine, EngineStatus};
