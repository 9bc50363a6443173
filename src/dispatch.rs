//! Feed dispatcher — the single consumer of the command inbox.
//!
//! Polls the inbox, routes commands to the dispensing engine (or the
//! scale for tare), and publishes the outcome: `feeding_complete` on the
//! event bus, a feeding-history entry, `last_feed_time`, and — after a
//! successful feed — each tank's updated remaining-mass record.
//!
//! Non-stop commands are rejected at submit time while safety mode is
//! engaged; the dispatcher re-checks before routing anyway, since the
//! flag can flip between submission and consumption.

use std::sync::Arc;

use log::{info, warn};

use crate::adapters::time::Clock;
use crate::engine::{DispensingEngine, EngineStatus};
use crate::error::DispenseError;
use crate::events::{EventBroker, EventPayload};
use crate::hub::{
    DeviceEvent, DeviceHub, FeedCommand, FeedingHistoryEntry, FeedingStatus, OperationState,
};
use crate::ports::{ScalePort, ServoPort, StoragePort, TankLookupPort};
use crate::store::RecipeStore;

/// Inbox poll period while no feed is running.
const POLL_PERIOD_MS: u64 = 200;

/// What the dispatcher is currently executing.
#[derive(Debug, Clone)]
struct ActiveFeed {
    kind: &'static str,
    recipe_uid: u32,
    description: String,
}

pub struct FeedDispatcher<C: Clock, S: StoragePort> {
    clock: C,
    hub: Arc<DeviceHub>,
    broker: Arc<EventBroker>,
    engine: DispensingEngine<C>,
    store: RecipeStore<S>,
    next_poll_ms: u64,
    active: Option<ActiveFeed>,
}

impl<C: Clock, S: StoragePort> FeedDispatcher<C, S> {
    pub fn new(
        clock: C,
        hub: Arc<DeviceHub>,
        broker: Arc<EventBroker>,
        engine: DispensingEngine<C>,
        store: RecipeStore<S>,
    ) -> Self {
        Self {
            clock,
            hub,
            broker,
            engine,
            store,
            next_poll_ms: 0,
            active: None,
        }
    }

    pub fn store(&self) -> &RecipeStore<S> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut RecipeStore<S> {
        &mut self.store
    }

    pub fn is_feeding(&self) -> bool {
        self.engine.is_active()
    }

    /// Drive the dispatcher: advance an active feed, or poll the inbox.
    pub fn tick(
        &mut self,
        hw: &mut (impl ServoPort + TankLookupPort),
        scale: &mut impl ScalePort,
    ) {
        if self.engine.is_active() {
            match self.engine.tick(hw, scale) {
                EngineStatus::Running | EngineStatus::Idle => {}
                EngineStatus::Complete { dispensed_g } => {
                    self.finalize(hw, true, dispensed_g, DispenseError::None);
                }
                EngineStatus::Failed { error, dispensed_g } => {
                    self.finalize(hw, false, dispensed_g, error);
                }
            }
            return;
        }

        let now = self.clock.now_ms();
        if now < self.next_poll_ms {
            return;
        }
        self.next_poll_ms = now + POLL_PERIOD_MS;

        let Ok(Some(command)) = self.hub.take_command() else {
            return;
        };
        self.route(command, hw, scale);
    }

    // ── Routing ───────────────────────────────────────────────

    fn route(
        &mut self,
        command: FeedCommand,
        hw: &mut (impl ServoPort + TankLookupPort),
        scale: &mut impl ScalePort,
    ) {
        // The flag can engage between submission and consumption.
        let engaged = self
            .hub
            .with_state(|s| s.safety_mode_engaged)
            .unwrap_or(true);
        if engaged && !command.is_stop() {
            warn!("dispatch: dropping {command:?} — safety engaged");
            return;
        }

        info!("dispatch: processing {command:?}");
        match command {
            FeedCommand::None => {}

            FeedCommand::EmergencyStop => {
                // The engine is idle here; just make the world safe.
                hw.stop_all_servos();
                let _ = self.hub.with_state(|s| {
                    s.last_event = DeviceEvent::UserStopped;
                    s.feeding_status = FeedingStatus::Idle;
                });
            }

            FeedCommand::TareScale => {
                self.set_status(FeedingStatus::Processing);
                let ok = scale.tare().is_ok();
                if !ok {
                    warn!("dispatch: tare failed");
                    let _ = self.hub.with_state(|s| {
                        s.last_error = "Scale tare failed.".to_string();
                    });
                }
                self.set_status(if ok {
                    FeedingStatus::Idle
                } else {
                    FeedingStatus::Error
                });
            }

            FeedCommand::Immediate { tank_uid, grams } => {
                self.set_status(FeedingStatus::Processing);
                self.active = Some(ActiveFeed {
                    kind: "immediate",
                    recipe_uid: 0,
                    description: "Immediate Feed".to_string(),
                });
                if let Err(error) = self.engine.start_immediate(tank_uid, grams, hw) {
                    self.finalize(hw, false, 0.0, error);
                }
            }

            FeedCommand::Recipe {
                recipe_uid,
                servings,
            } => {
                self.set_status(FeedingStatus::Processing);
                let Some(recipe) = self.store.recipe_by_uid(recipe_uid).cloned() else {
                    warn!("dispatch: recipe {recipe_uid} not found");
                    self.active = Some(ActiveFeed {
                        kind: "recipe",
                        recipe_uid,
                        description: "Unknown Recipe".to_string(),
                    });
                    self.finalize(hw, false, 0.0, DispenseError::RecipeNotFound);
                    return;
                };
                self.active = Some(ActiveFeed {
                    kind: "recipe",
                    recipe_uid,
                    description: recipe.name.clone(),
                });
                if let Err(error) = self.engine.start_recipe(&recipe, servings, hw) {
                    self.finalize(hw, false, 0.0, error);
                }
            }
        }
    }

    // ── Outcome ───────────────────────────────────────────────

    fn finalize(
        &mut self,
        hw: &mut (impl ServoPort + TankLookupPort),
        success: bool,
        dispensed_g: f32,
        error: DispenseError,
    ) {
        let now_ms = self.clock.now_ms();
        let active = self.active.take().unwrap_or(ActiveFeed {
            kind: "immediate",
            recipe_uid: 0,
            description: "Immediate Feed".to_string(),
        });

        if success {
            // Stamp the recipe and debit the tanks' remaining mass.
            if active.recipe_uid != 0 {
                let _ = self
                    .store
                    .mark_used(active.recipe_uid, (now_ms / 1000) as i64);
            }
            for ingredient in self.engine.context().ingredients.iter() {
                if ingredient.consumed_g <= 0.0 {
                    continue;
                }
                if let Some(stock) = hw.remaining_grams(ingredient.tank_uid) {
                    let left = (stock - ingredient.consumed_g).max(0.0);
                    if let Err(e) = hw.update_remaining_grams(ingredient.tank_uid, left) {
                        warn!(
                            "dispatch: remaining-mass update failed for {:#018x} ({e})",
                            ingredient.tank_uid
                        );
                    }
                }
            }
        }

        let error_message = if success {
            String::new()
        } else {
            error.to_string()
        };
        let recipe_uid = active.recipe_uid;
        let _ = self.hub.with_state(|state| {
            state.feeding_status = if success {
                FeedingStatus::Idle
            } else {
                FeedingStatus::Error
            };
            state.operation_state = if success {
                OperationState::Idle
            } else {
                OperationState::Error
            };
            if success {
                state.last_error.clear();
                state.last_feed_time_ms = now_ms;
                state.last_recipe_uid = recipe_uid;
            } else {
                state.last_error = error_message.clone();
            }
        });

        // Cycle-level errors go on the error topic; the engine already
        // announced user stops and per-tank empties itself.
        if !success
            && !matches!(
                error,
                DispenseError::EmergencyStop | DispenseError::TankEmpty
            )
        {
            self.broker.publish(EventPayload::Error {
                code: error_code(error),
                message: error_message,
            });
        }

        let _ = self.hub.push_history(FeedingHistoryEntry {
            timestamp_ms: now_ms,
            kind: active.kind,
            recipe_uid: active.recipe_uid,
            success,
            grams: dispensed_g,
            description: active.description,
        });

        self.broker.publish(EventPayload::FeedingComplete {
            success,
            dispensed: dispensed_g,
        });
        self.broker.publish(EventPayload::StatusChanged {
            state: if success { "Idle" } else { "Error" },
        });

        info!(
            "dispatch: feed finished (success={success}, dispensed {dispensed_g:.1} g)"
        );
        self.engine.reset();
    }

    fn set_status(&self, status: FeedingStatus) {
        let _ = self.hub.with_state(|s| {
            s.feeding_status = status;
            s.operation_state = match status {
                FeedingStatus::Idle => OperationState::Idle,
                FeedingStatus::Processing => OperationState::Feeding,
                FeedingStatus::Error => OperationState::Error,
            };
        });
        self.broker.publish(EventPayload::StatusChanged {
            state: status.as_str(),
        });
    }
}

/// Stable code strings for the error topic.
fn error_code(error: DispenseError) -> &'static str {
    match error {
        DispenseError::None => "none",
        DispenseError::CloseDetectionMissed => "close_detection_missed",
        DispenseError::TankEmpty => "tank_empty",
        DispenseError::ScaleUnresponsive => "scale_unresponsive",
        DispenseError::ServoTimeout => "servo_timeout",
        DispenseError::EmergencyStop => "user_stopped",
        DispenseError::DispenseTimeout => "dispense_timeout",
        DispenseError::TankNotFound => "tank_not_found",
        DispenseError::RecipeNotFound => "recipe_not_found",
    }
}
