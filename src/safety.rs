//! Safety supervisor.
//!
//! Independent 10 Hz monitor over the device state. Two rules:
//!
//! - **Stall** — while feeding is active, a watchdog arms on the first
//!   observation and re-arms whenever the bowl weight moves by more
//!   than the reset delta; five seconds without movement means a motor
//!   is turning against a jam (or nothing at all) and every servo is
//!   forced to neutral and unpowered.
//! - **Overfill** — a bowl heavier than the limit shuts everything
//!   down regardless of feeding state.
//!
//! Both rules latch `safety_mode_engaged`; the flag is sticky until
//! explicitly cleared by the user, and while it is set the inbox
//! rejects every non-stop command.

use std::sync::Arc;

use log::error;

use crate::adapters::time::Clock;
use crate::config::SystemConfig;
use crate::events::{EventBroker, EventPayload};
use crate::hub::{DeviceEvent, DeviceHub, FeedingStatus};
use crate::ports::ServoPort;

/// Supervisor cadence.
const TICK_PERIOD_MS: u64 = 100;

pub struct SafetySupervisor<C: Clock> {
    clock: C,
    hub: Arc<DeviceHub>,
    broker: Arc<EventBroker>,

    overfill_limit_g: f32,
    stall_reset_delta_g: f32,
    stall_timeout_ms: u64,

    next_tick_ms: u64,
    /// `(armed_at_ms, anchor_weight)` while the stall watchdog runs.
    stall_anchor: Option<(u64, f32)>,
}

impl<C: Clock> SafetySupervisor<C> {
    pub fn new(
        clock: C,
        hub: Arc<DeviceHub>,
        broker: Arc<EventBroker>,
        config: &SystemConfig,
    ) -> Self {
        Self {
            clock,
            hub,
            broker,
            overfill_limit_g: config.overfill_limit_g,
            stall_reset_delta_g: config.stall_reset_delta_g,
            stall_timeout_ms: config.stall_timeout_ms as u64,
            next_tick_ms: 0,
            stall_anchor: None,
        }
    }

    /// Run the checks if the 100 ms period has elapsed.
    pub fn tick(&mut self, servo: &mut impl ServoPort) {
        let now = self.clock.now_ms();
        if now < self.next_tick_ms {
            return;
        }
        self.next_tick_ms = now + TICK_PERIOD_MS;

        // Copy out, then act — never hold the hub lock across servo or
        // bridge operations.
        let Ok((is_feeding, weight, engaged)) = self.hub.with_state(|state| {
            (
                state.feeding_status.is_active(),
                state.current_weight,
                state.safety_mode_engaged,
            )
        }) else {
            return;
        };

        if engaged {
            self.stall_anchor = None;
            return;
        }

        // ── Stall ─────────────────────────────────────────────
        if is_feeding && !weight.is_nan() {
            match self.stall_anchor {
                None => self.stall_anchor = Some((now, weight)),
                Some((armed_at, anchor)) => {
                    if (weight - anchor).abs() > self.stall_reset_delta_g {
                        self.stall_anchor = Some((now, weight));
                    } else if now.saturating_sub(armed_at) > self.stall_timeout_ms {
                        error!(
                            "SAFETY: motor stall — no weight change in {} ms",
                            self.stall_timeout_ms
                        );
                        self.engage(servo, DeviceEvent::MotorStall, "Motor stall detected.");
                        return;
                    }
                }
            }
        } else {
            self.stall_anchor = None;
        }

        // ── Overfill ──────────────────────────────────────────
        if weight > self.overfill_limit_g {
            error!("SAFETY: bowl overfill at {weight:.1} g");
            self.engage(servo, DeviceEvent::BowlOverfill, "Bowl overfill detected.");
        }
    }

    fn engage(&mut self, servo: &mut impl ServoPort, event: DeviceEvent, message: &str) {
        servo.stop_all_servos();
        let _ = self.hub.with_state(|state| {
            state.safety_mode_engaged = true;
            state.last_event = event;
            state.feeding_status = FeedingStatus::Error;
            state.last_error = message.to_string();
        });
        self.broker.publish(EventPayload::Error {
            code: event.code(),
            message: message.to_string(),
        });
        self.stall_anchor = None;
    }
}
