//! Three-phase dispensing engine.
//!
//! A feed (recipe or immediate) runs as one or more cycles of:
//!
//! 1. **Purge** — open the hopper gate, wiggle to dislodge stuck
//!    kibbles, settle. Releases the previous batch into the bowl.
//! 2. **Close & tare** — step the gate toward closed while watching the
//!    scale for the pinch spike that reveals the true closed position;
//!    fall back to the configured pulse after 60 steps. Then tare.
//! 3. **Dispense** — run each ingredient's auger in recipe order,
//!    filling the hopper up to the batch bound
//!    `min(total_remaining, hopper_volume × min_density)`.
//!
//! The engine is a tick-driven state machine: every wait is a timed
//! comparison against [`Clock::now_ms`], never a spin. The emergency
//! flag and inbox are consulted at the start of every tick.
//!
//! Failure containment: a missed close spike is recoverable, a stalled
//! auger is contained to its ingredient, and the cumulative loop only
//! errors once no ingredient can make progress. Scale loss during
//! close/tare kills the cycle.

use std::sync::Arc;

use log::{error, info, warn};

use crate::adapters::time::Clock;
use crate::error::DispenseError;
use crate::events::{EventBroker, EventPayload};
use crate::hub::{DeviceEvent, DeviceHub, FeedCommand};
use crate::ports::{ScalePort, ServoPort, TankLookupPort};
use crate::store::Recipe;

use super::context::{DispensePhase, DispensingContext, IngredientState, MAX_INGREDIENTS};

// ── Purge ─────────────────────────────────────────────────────
const PURGE_OPEN_WAIT_MS: u64 = 100;
const WIGGLE_AMPLITUDE_US: u16 = 150;
const WIGGLE_HALF_PERIOD_MS: u64 = 200;
const WIGGLE_CYCLE_COUNT: u8 = 4;
const PURGE_SETTLE_MS: u64 = 2000;

// ── Close detection ───────────────────────────────────────────
const CLOSE_STEP_US: u16 = 25;
const CLOSE_STEP_WAIT_MS: u64 = 100;
const CLOSE_SPIKE_G: f32 = 3.0;
const CLOSE_BACKOFF_US: u16 = 50;
const CLOSE_MAX_STEPS: u8 = 60;
const CLOSE_BACKOFF_WAIT_MS: u64 = 100;

// ── Tare ──────────────────────────────────────────────────────
const TARE_SETTLE_MS: u64 = 300;

// ── Dispense ──────────────────────────────────────────────────
const DISPENSE_PERIOD_MS: u64 = 250;
const DISPENSE_SETTLE_MS: u64 = 500;
const AUGER_SLOW_THRESHOLD_G: f32 = 2.0;
const AUGER_FULL_SPEED: f32 = 1.0;
const AUGER_SLOW_SPEED: f32 = 0.2;

/// Hopper volume bound on a single batch.
const MAX_HOPPER_VOLUME_L: f32 = 0.01;
/// Density assumed for tanks whose record carries none.
const DEFAULT_DENSITY_G_PER_L: f32 = 500.0;
/// Portions below this are not worth a cycle.
const MIN_PORTION_G: f32 = 0.5;
/// The feed completes within this distance of the target.
const COMPLETE_TOLERANCE_G: f32 = 0.5;

/// Engine status after a tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EngineStatus {
    Idle,
    Running,
    Complete { dispensed_g: f32 },
    Failed { error: DispenseError, dispensed_g: f32 },
}

pub struct DispensingEngine<C: Clock> {
    clock: C,
    hub: Arc<DeviceHub>,
    broker: Arc<EventBroker>,

    // Knobs (snapshot of the settings collaborator at feed start).
    hopper_open_us: u16,
    hopper_closed_us: u16,
    weight_change_threshold_g: f32,
    no_change_timeout_ms: u64,

    ctx: DispensingContext,

    // Phase scratch (reset on every feed).
    finishing: bool,
    close_current_us: u16,
    tare_issued: bool,
    ingredient_index: usize,
    ingredient_target_g: f32,
    ingredient_start_weight: f32,
    ingredient_running: bool,
    last_auger_ms: u64,
    last_progress_ms: u64,
    last_progress_weight: f32,
    slow_approach: bool,
}

impl<C: Clock> DispensingEngine<C> {
    pub fn new(
        clock: C,
        hub: Arc<DeviceHub>,
        broker: Arc<EventBroker>,
        hopper_closed_us: u16,
        hopper_open_us: u16,
        weight_change_threshold_g: f32,
        no_change_timeout_ms: u32,
    ) -> Self {
        Self {
            clock,
            hub,
            broker,
            hopper_open_us,
            hopper_closed_us,
            weight_change_threshold_g,
            no_change_timeout_ms: no_change_timeout_ms as u64,
            ctx: DispensingContext::default(),
            finishing: false,
            close_current_us: 0,
            tare_issued: false,
            ingredient_index: 0,
            ingredient_target_g: 0.0,
            ingredient_start_weight: 0.0,
            ingredient_running: false,
            last_auger_ms: 0,
            last_progress_ms: 0,
            last_progress_weight: 0.0,
            slow_approach: false,
        }
    }

    pub fn context(&self) -> &DispensingContext {
        &self.ctx
    }

    pub fn is_active(&self) -> bool {
        self.ctx.phase.is_active()
    }

    /// Discard the finished feed's context and return to idle.
    pub fn reset(&mut self) {
        self.ctx = DispensingContext::default();
    }

    // ── Feed entry points ─────────────────────────────────────

    /// Begin a recipe feed of `servings` servings.
    ///
    /// Buses are resolved before servo power comes up — the EEPROM
    /// pull-ups die the moment the expander switches roles.
    pub fn start_recipe(
        &mut self,
        recipe: &Recipe,
        servings: u16,
        hw: &mut (impl ServoPort + TankLookupPort),
    ) -> Result<(), DispenseError> {
        if recipe.servings == 0 {
            error!("engine: recipe '{}' has zero servings", recipe.name);
            return Err(DispenseError::RecipeNotFound);
        }
        let servings = servings.max(1);
        let total = recipe.daily_weight_g / recipe.servings as f32 * servings as f32;

        let mut ingredients: heapless::Vec<IngredientState, MAX_INGREDIENTS> =
            heapless::Vec::new();
        for ingredient in recipe.ingredients.iter().take(MAX_INGREDIENTS) {
            let Some(channel) = hw.bus_of_tank(ingredient.tank_uid) else {
                error!(
                    "engine: tank {:#018x} not found for recipe '{}'",
                    ingredient.tank_uid, recipe.name
                );
                return Err(DispenseError::TankNotFound);
            };
            let density = hw
                .density_g_per_l(ingredient.tank_uid)
                .filter(|d| *d > 0.0)
                .unwrap_or(DEFAULT_DENSITY_G_PER_L);
            let state = IngredientState {
                tank_uid: ingredient.tank_uid,
                percentage: ingredient.percentage,
                channel,
                density_g_per_l: density,
                remaining_g: total * ingredient.percentage / 100.0,
                consumed_g: 0.0,
                stalled: false,
            };
            ingredients.push(state).ok();
        }
        if ingredients.is_empty() {
            return Err(DispenseError::RecipeNotFound);
        }

        info!(
            "engine: recipe '{}' × {servings} serving(s), target {total:.1} g",
            recipe.name
        );
        self.begin_feed(recipe.uid, servings, ingredients, total, hw);
        Ok(())
    }

    /// Begin an immediate single-tank feed.
    pub fn start_immediate(
        &mut self,
        tank_uid: u64,
        grams: f32,
        hw: &mut (impl ServoPort + TankLookupPort),
    ) -> Result<(), DispenseError> {
        if tank_uid == 0 {
            error!("engine: immediate feed without a tank uid");
            return Err(DispenseError::TankNotFound);
        }
        let Some(channel) = hw.bus_of_tank(tank_uid) else {
            error!("engine: tank {tank_uid:#018x} not found for immediate feed");
            return Err(DispenseError::TankNotFound);
        };
        let density = hw
            .density_g_per_l(tank_uid)
            .filter(|d| *d > 0.0)
            .unwrap_or(DEFAULT_DENSITY_G_PER_L);

        let mut ingredients: heapless::Vec<IngredientState, MAX_INGREDIENTS> =
            heapless::Vec::new();
        ingredients
            .push(IngredientState {
                tank_uid,
                percentage: 100.0,
                channel,
                density_g_per_l: density,
                remaining_g: grams,
                consumed_g: 0.0,
                stalled: false,
            })
            .ok();

        info!("engine: immediate feed of {grams:.1} g from tank {tank_uid:#018x}");
        self.begin_feed(0, 1, ingredients, grams, hw);
        Ok(())
    }

    fn begin_feed(
        &mut self,
        recipe_uid: u32,
        servings: u16,
        ingredients: heapless::Vec<IngredientState, MAX_INGREDIENTS>,
        total_g: f32,
        servo: &mut impl ServoPort,
    ) {
        self.ctx = DispensingContext {
            recipe_uid,
            servings,
            ingredients,
            total_target_g: total_g,
            ..Default::default()
        };
        self.finishing = false;
        self.tare_issued = false;
        self.ingredient_running = false;
        self.slow_approach = false;

        servo.set_servo_power(true);
        self.enter_purge(servo);
    }

    // ── Tick ──────────────────────────────────────────────────

    /// Advance the feed. Call at any rate; waits are internal.
    pub fn tick(
        &mut self,
        servo: &mut impl ServoPort,
        scale: &mut impl ScalePort,
    ) -> EngineStatus {
        match self.ctx.phase {
            DispensePhase::Idle => return EngineStatus::Idle,
            DispensePhase::Complete => {
                return EngineStatus::Complete {
                    dispensed_g: self.ctx.dispensed_g,
                }
            }
            DispensePhase::Error => {
                return EngineStatus::Failed {
                    error: self.ctx.error,
                    dispensed_g: self.ctx.dispensed_g,
                }
            }
            _ => {}
        }

        // Stop conditions come before any phase work.
        if let Some(status) = self.check_stop_requests(servo) {
            return status;
        }

        let now = self.clock.now_ms();
        let elapsed = now.saturating_sub(self.ctx.phase_started_ms);

        match self.ctx.phase {
            DispensePhase::PurgeOpen => {
                if elapsed >= PURGE_OPEN_WAIT_MS {
                    self.ctx.wiggle_count = 0;
                    self.transition(DispensePhase::PurgeWiggle);
                }
            }

            DispensePhase::PurgeWiggle => {
                // Half-periods alternate above/below the open pulse;
                // two half-periods per wiggle cycle.
                if elapsed >= WIGGLE_HALF_PERIOD_MS {
                    self.ctx.wiggle_count += 1;
                    if self.ctx.wiggle_count >= WIGGLE_CYCLE_COUNT * 2 {
                        servo.set_servo_us(self.hopper_channel(), self.hopper_open_us);
                        self.transition(DispensePhase::PurgeSettle);
                    } else {
                        let offset = if self.ctx.wiggle_count % 2 == 0 {
                            self.hopper_open_us + WIGGLE_AMPLITUDE_US
                        } else {
                            self.hopper_open_us - WIGGLE_AMPLITUDE_US
                        };
                        servo.set_servo_us(self.hopper_channel(), offset);
                        self.ctx.phase_started_ms = now;
                    }
                }
            }

            DispensePhase::PurgeSettle => {
                if elapsed >= PURGE_SETTLE_MS {
                    if self.finishing {
                        return self.complete(servo);
                    }
                    let weight = scale.weight();
                    if weight.is_nan() {
                        return self.fail(servo, DispenseError::ScaleUnresponsive);
                    }
                    self.ctx.pre_close_weight = weight;
                    self.ctx.close_attempts = 0;
                    self.close_current_us = self.hopper_open_us;
                    self.transition(DispensePhase::CloseMoving);
                }
            }

            DispensePhase::CloseMoving => {
                let dir = self.close_direction();
                let next = (self.close_current_us as i32 + (CLOSE_STEP_US as i32) * dir) as u16;
                self.close_current_us = self.clamp_toward_closed(next);
                servo.set_servo_us(self.hopper_channel(), self.close_current_us);
                self.transition(DispensePhase::CloseDetectSpike);
            }

            DispensePhase::CloseDetectSpike => {
                if elapsed < CLOSE_STEP_WAIT_MS {
                    return EngineStatus::Running;
                }
                let weight = scale.weight();
                if weight.is_nan() {
                    return self.fail(servo, DispenseError::ScaleUnresponsive);
                }
                if weight - self.ctx.pre_close_weight >= CLOSE_SPIKE_G {
                    // A kibble is pinched: back off past it and remember
                    // the learned closed position.
                    let dir = self.close_direction();
                    let backed =
                        (self.close_current_us as i32 - (CLOSE_BACKOFF_US as i32) * dir) as u16;
                    servo.set_servo_us(self.hopper_channel(), backed);
                    self.ctx.learned_close_us = backed;
                    self.ctx.close_calibrated = true;
                    info!("engine: close spike at {} µs, learned {} µs", self.close_current_us, backed);
                    self.transition(DispensePhase::CloseBackoff);
                } else {
                    self.ctx.close_attempts += 1;
                    if self.ctx.close_attempts >= CLOSE_MAX_STEPS {
                        // Recoverable: no spike seen, trust the
                        // configured closed pulse.
                        warn!("engine: no close spike within {CLOSE_MAX_STEPS} steps, using configured pulse");
                        self.ctx.close_calibrated = false;
                        self.ctx.error = DispenseError::CloseDetectionMissed;
                        servo.set_servo_us(self.hopper_channel(), self.hopper_closed_us);
                        self.tare_issued = false;
                        self.transition(DispensePhase::Tare);
                    } else {
                        self.transition(DispensePhase::CloseMoving);
                    }
                }
            }

            DispensePhase::CloseBackoff => {
                if elapsed >= CLOSE_BACKOFF_WAIT_MS {
                    self.tare_issued = false;
                    self.transition(DispensePhase::Tare);
                }
            }

            DispensePhase::Tare => {
                if elapsed < TARE_SETTLE_MS {
                    return EngineStatus::Running;
                }
                if !self.tare_issued {
                    if scale.tare().is_err() {
                        return self.fail(servo, DispenseError::ScaleUnresponsive);
                    }
                    self.tare_issued = true;
                    self.ctx.phase_started_ms = now;
                } else {
                    // Post-tare settle elapsed; confirm the scale lives.
                    if !scale.is_responding() || scale.weight().is_nan() {
                        return self.fail(servo, DispenseError::ScaleUnresponsive);
                    }
                    self.begin_batch(servo);
                }
            }

            DispensePhase::DispenseAuger => {
                return self.tick_auger(servo, scale, now);
            }

            DispensePhase::DispenseSettle => {
                if elapsed >= DISPENSE_SETTLE_MS {
                    if self.ctx.total_remaining_g() <= COMPLETE_TOLERANCE_G {
                        // Target met: one final purge releases the last
                        // batch, then the gate closes for good.
                        self.finishing = true;
                        self.enter_purge(servo);
                    } else if self.ctx.no_progress_possible(MIN_PORTION_G) {
                        error!("engine: every remaining ingredient has stalled");
                        return self.fail(servo, DispenseError::DispenseTimeout);
                    } else {
                        self.enter_purge(servo);
                    }
                }
            }

            DispensePhase::Idle | DispensePhase::Complete | DispensePhase::Error => {}
        }

        EngineStatus::Running
    }

    // ── Phase helpers ─────────────────────────────────────────

    fn hopper_channel(&self) -> u8 {
        crate::pins::HOPPER_SERVO_CHANNEL
    }

    fn close_direction(&self) -> i32 {
        if self.hopper_closed_us >= self.hopper_open_us {
            1
        } else {
            -1
        }
    }

    fn clamp_toward_closed(&self, us: u16) -> u16 {
        if self.close_direction() > 0 {
            us.min(self.hopper_closed_us)
        } else {
            us.max(self.hopper_closed_us)
        }
    }

    fn enter_purge(&mut self, servo: &mut impl ServoPort) {
        servo.open_hopper();
        self.transition(DispensePhase::PurgeOpen);
    }

    fn transition(&mut self, phase: DispensePhase) {
        self.ctx.phase = phase;
        self.ctx.phase_started_ms = self.clock.now_ms();
    }

    /// Consume an emergency stop from the inbox, or honor a safety
    /// supervisor preemption.
    fn check_stop_requests(&mut self, servo: &mut impl ServoPort) -> Option<EngineStatus> {
        let (safety, user_stop) = self
            .hub
            .with_state(|state| {
                let user_stop = !state.inbox.processed
                    && state.inbox.command == FeedCommand::EmergencyStop;
                if user_stop {
                    state.inbox.processed = true;
                    state.last_event = DeviceEvent::UserStopped;
                }
                (state.safety_mode_engaged, user_stop)
            })
            .unwrap_or((true, false)); // unreachable hub reads as unsafe

        if user_stop {
            warn!("engine: emergency stop commanded");
            servo.stop_all_servos();
            self.broker.publish(EventPayload::Error {
                code: DeviceEvent::UserStopped.code(),
                message: "Feeding stopped by user.".to_string(),
            });
            self.ctx.error = DispenseError::EmergencyStop;
            self.transition(DispensePhase::Error);
            return Some(EngineStatus::Failed {
                error: DispenseError::EmergencyStop,
                dispensed_g: self.ctx.dispensed_g,
            });
        }
        if safety {
            warn!("engine: safety supervisor preempted the feed");
            self.ctx.error = DispenseError::EmergencyStop;
            self.transition(DispensePhase::Error);
            return Some(EngineStatus::Failed {
                error: DispenseError::EmergencyStop,
                dispensed_g: self.ctx.dispensed_g,
            });
        }
        None
    }

    fn fail(&mut self, servo: &mut impl ServoPort, error: DispenseError) -> EngineStatus {
        error!("engine: cycle failed ({error})");
        servo.stop_all_servos();
        self.ctx.error = error;
        self.transition(DispensePhase::Error);
        EngineStatus::Failed {
            error,
            dispensed_g: self.ctx.dispensed_g,
        }
    }

    fn complete(&mut self, servo: &mut impl ServoPort) -> EngineStatus {
        // Idle closed pulse: the learned position when calibration
        // succeeded, the configured one otherwise.
        let closed = if self.ctx.close_calibrated {
            self.ctx.learned_close_us
        } else {
            self.hopper_closed_us
        };
        servo.set_servo_us(self.hopper_channel(), closed);
        servo.stop_all_servos();
        info!(
            "engine: feed complete, dispensed {:.1} g of {:.1} g",
            self.ctx.dispensed_g, self.ctx.total_target_g
        );
        self.transition(DispensePhase::Complete);
        EngineStatus::Complete {
            dispensed_g: self.ctx.dispensed_g,
        }
    }

    // ── Batch / auger logic ───────────────────────────────────

    /// Compute the batch bound and arm the first ingredient.
    fn begin_batch(&mut self, servo: &mut impl ServoPort) {
        let min_density = self
            .ctx
            .ingredients
            .iter()
            .filter(|i| i.remaining_g > 0.0)
            .map(|i| i.density_g_per_l)
            .fold(f32::INFINITY, f32::min);
        let min_density = if min_density.is_finite() {
            min_density
        } else {
            DEFAULT_DENSITY_G_PER_L
        };

        let batch = self
            .ctx
            .total_remaining_g()
            .min(MAX_HOPPER_VOLUME_L * min_density);

        if batch < MIN_PORTION_G {
            // Nothing meaningful left; release what the hopper holds.
            self.finishing = true;
            self.enter_purge(servo);
            return;
        }

        self.ctx.batch_target_g = batch;
        self.ctx.batch_dispensed_g = 0.0;
        self.ingredient_index = 0;
        self.ingredient_running = false;
        self.last_auger_ms = 0;
        info!("engine: batch target {batch:.2} g");
        self.transition(DispensePhase::DispenseAuger);
    }

    fn tick_auger(
        &mut self,
        servo: &mut impl ServoPort,
        scale: &mut impl ScalePort,
        now: u64,
    ) -> EngineStatus {
        if now.saturating_sub(self.last_auger_ms) < DISPENSE_PERIOD_MS {
            return EngineStatus::Running;
        }
        self.last_auger_ms = now;

        if !self.ingredient_running {
            return self.arm_next_ingredient(servo, scale, now);
        }

        let ingredient = self.ctx.ingredients[self.ingredient_index];
        let weight = scale.weight();

        if !weight.is_nan() {
            let run = (weight - self.ingredient_start_weight).max(0.0);
            self.broker.publish(EventPayload::FeedingProgress {
                weight: self.ctx.dispensed_g + run,
                target: self.ctx.total_target_g,
            });

            // Creep up on the last couple of grams.
            if !self.slow_approach && self.ingredient_target_g - run < AUGER_SLOW_THRESHOLD_G {
                servo.set_continuous_servo(ingredient.channel, AUGER_SLOW_SPEED);
                self.slow_approach = true;
            }

            if run >= self.ingredient_target_g {
                self.finish_ingredient(servo, run, false);
                return EngineStatus::Running;
            }

            if (weight - self.last_progress_weight).abs() >= self.weight_change_threshold_g {
                self.last_progress_ms = now;
                self.last_progress_weight = weight;
            }
        }

        if now.saturating_sub(self.last_progress_ms) > self.no_change_timeout_ms {
            // This tank has run dry (or its auger jammed): contain the
            // failure to the ingredient and keep going with the rest.
            let run = if weight.is_nan() {
                0.0
            } else {
                (weight - self.ingredient_start_weight).max(0.0)
            };
            error!(
                "engine: auger stalled on tank {:#018x} after {run:.1} g",
                ingredient.tank_uid
            );
            let _ = self.hub.with_state(|state| {
                state.last_event = DeviceEvent::TankEmpty;
            });
            self.broker.publish(EventPayload::Error {
                code: DeviceEvent::TankEmpty.code(),
                message: format!("Tank {:#018x} appears empty.", ingredient.tank_uid),
            });
            self.finish_ingredient(servo, run, true);
        }

        EngineStatus::Running
    }

    fn arm_next_ingredient(
        &mut self,
        servo: &mut impl ServoPort,
        scale: &mut impl ScalePort,
        now: u64,
    ) -> EngineStatus {
        while self.ingredient_index < self.ctx.ingredients.len() {
            let ingredient = self.ctx.ingredients[self.ingredient_index];
            if ingredient.stalled || ingredient.remaining_g <= MIN_PORTION_G {
                self.ingredient_index += 1;
                continue;
            }
            let target = (self.ctx.batch_target_g * ingredient.percentage / 100.0)
                .min(ingredient.remaining_g);
            if target < MIN_PORTION_G {
                self.ingredient_index += 1;
                continue;
            }

            let weight = scale.weight();
            if weight.is_nan() {
                // No reference point yet; retry next period and let the
                // phase-level timeout decide.
                if now.saturating_sub(self.ctx.phase_started_ms) > self.no_change_timeout_ms {
                    return self.fail(servo, DispenseError::ScaleUnresponsive);
                }
                return EngineStatus::Running;
            }

            self.ingredient_target_g = target;
            self.ingredient_start_weight = weight;
            self.ingredient_running = true;
            self.slow_approach = false;
            self.last_progress_ms = now;
            self.last_progress_weight = weight;
            servo.set_continuous_servo(ingredient.channel, AUGER_FULL_SPEED);
            info!(
                "engine: dispensing {target:.2} g from tank {:#018x} (channel {})",
                ingredient.tank_uid, ingredient.channel
            );
            return EngineStatus::Running;
        }

        // Batch done for every ingredient.
        self.transition(DispensePhase::DispenseSettle);
        EngineStatus::Running
    }

    /// Stop the active auger and fold its run into the accumulators.
    fn finish_ingredient(&mut self, servo: &mut impl ServoPort, run_g: f32, stalled: bool) {
        let ingredient = &mut self.ctx.ingredients[self.ingredient_index];
        servo.set_continuous_servo(ingredient.channel, 0.0);
        ingredient.remaining_g = (ingredient.remaining_g - run_g).max(0.0);
        ingredient.consumed_g += run_g;
        ingredient.stalled = stalled;
        self.ctx.batch_dispensed_g += run_g;
        self.ctx.dispensed_g += run_g;

        self.ingredient_index += 1;
        self.ingredient_running = false;
    }
}
