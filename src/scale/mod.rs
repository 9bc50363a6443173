//! Scale sampler — cooperative, power-cycled averaging state machine.
//!
//! ```text
//!            19 ticks × 13 ms                195 ms          52 ms
//!   ┌──────────┐  publish   ┌──────────┐  power-up  ┌──────────┐
//!   │ SAMPLING │ ─────────▶ │   IDLE   │ ─────────▶ │ SETTLING │ ─┐
//!   └──────────┘ power-down └──────────┘            └──────────┘  │
//!        ▲                                                        │
//!        └────────────────────────────────────────────────────────┘
//! ```
//!
//! Within SAMPLING the sampler attempts one non-blocking conversion per
//! 13 ms tick; a raw reading of zero counts as a failure. At window end
//! it publishes the average (weight, raw, stability, responsiveness) to
//! the device-state hub and the `weight` topic, powers the chip down
//! and idles. Powering back up requires a settling period before
//! conversions are trusted.
//!
//! Tare and calibration are blocking fixed-count averages bounded by
//! `samples × 13 ms + 150 ms`; both persist through the settings
//! collaborator.

pub mod hx711;

use std::sync::Arc;

use log::{error, info};
use parking_lot::Mutex;

use crate::adapters::time::Clock;
use crate::error::{Error, Result, ScaleError};
use crate::events::{EventBroker, EventPayload};
use crate::hub::DeviceHub;
use crate::ports::{CalibrationStore, ScalePort};
use hx711::LoadCellPort;

/// Sampler pacing: one conversion attempt per tick.
pub const TICK_MS: u64 = 13;
/// Conversion attempts per averaging window (~247 ms).
pub const SAMPLE_TICKS: u8 = 19;
/// Power-down dwell between windows.
pub const IDLE_MS: u64 = 195;
/// Post-power-up settling before conversions are trusted.
pub const SETTLE_MS: u64 = 52;
/// Weight delta below which consecutive averages count as stable.
const STABLE_DELTA_G: f32 = 0.5;
/// Fixed sample count for tare.
const TARE_SAMPLES: u8 = 20;

type Observer = Box<dyn Fn(f32, i32) + Send>;

enum SamplerState {
    Sampling { ticks: u8, sum: i64, samples: u8 },
    Idle { entered_ms: u64 },
    Settling { entered_ms: u64 },
}

/// The sampler. Owns the chip, the calibration fields, and their
/// persistence handle.
pub struct ScaleSampler<L: LoadCellPort, C: Clock, S: CalibrationStore> {
    chip: L,
    clock: C,
    store: S,
    state: SamplerState,
    last_tick_ms: u64,

    calibration_factor: f32,
    zero_offset: i32,

    current_raw: i32,
    current_weight: f32,
    previous_weight: f32,
    weight_stable: bool,
    scale_responding: bool,

    observers: Vec<Observer>,
}

impl<L: LoadCellPort, C: Clock, S: CalibrationStore> ScaleSampler<L, C, S> {
    pub fn new(chip: L, clock: C, store: S) -> Self {
        let (factor, offset) = store.load_scale_calibration().unwrap_or((400.0, 0));
        info!("scale: initialized with factor {factor:.2}, offset {offset}");
        let now = clock.now_ms();
        Self {
            chip,
            clock,
            store,
            state: SamplerState::Settling { entered_ms: now },
            last_tick_ms: 0,
            calibration_factor: factor,
            zero_offset: offset,
            current_raw: 0,
            current_weight: 0.0,
            previous_weight: 0.0,
            weight_stable: false,
            scale_responding: false,
            observers: Vec::new(),
        }
    }

    // ── Published values ──────────────────────────────────────

    pub fn current_weight(&self) -> f32 {
        self.current_weight
    }

    pub fn current_raw(&self) -> i32 {
        self.current_raw
    }

    pub fn is_weight_stable(&self) -> bool {
        self.weight_stable
    }

    pub fn is_responding(&self) -> bool {
        self.scale_responding
    }

    pub fn calibration_factor(&self) -> f32 {
        self.calibration_factor
    }

    pub fn zero_offset(&self) -> i32 {
        self.zero_offset
    }

    /// Register a per-average observer `(weight, raw)`.
    pub fn add_observer(&mut self, callback: impl Fn(f32, i32) + Send + 'static) {
        self.observers.push(Box::new(callback));
    }

    // ── Cooperative tick ──────────────────────────────────────

    /// Advance the sampler. Call from the control loop at any rate; the
    /// sampler paces itself to one conversion attempt per 13 ms.
    pub fn tick(&mut self, hub: &DeviceHub, broker: &EventBroker) {
        let now = self.clock.now_ms();
        if now.saturating_sub(self.last_tick_ms) < TICK_MS {
            return;
        }
        self.last_tick_ms = now;

        // Work out the window result first; the publish step needs the
        // whole sampler mutable again.
        let mut completed_window: Option<(i64, u8)> = None;

        match &mut self.state {
            SamplerState::Sampling { ticks, sum, samples } => {
                if let Some(raw) = self.chip.read_ready() {
                    if raw != 0 {
                        *sum += raw as i64;
                        *samples += 1;
                    }
                }
                *ticks += 1;
                if *ticks >= SAMPLE_TICKS {
                    completed_window = Some((*sum, *samples));
                }
            }
            SamplerState::Idle { entered_ms } => {
                if now.saturating_sub(*entered_ms) >= IDLE_MS {
                    self.chip.power_up();
                    self.state = SamplerState::Settling { entered_ms: now };
                }
            }
            SamplerState::Settling { entered_ms } => {
                if now.saturating_sub(*entered_ms) >= SETTLE_MS {
                    self.state = SamplerState::Sampling {
                        ticks: 0,
                        sum: 0,
                        samples: 0,
                    };
                }
            }
        }

        if let Some((sum, samples)) = completed_window {
            self.publish_window(sum, samples, hub, broker);
            self.chip.power_down();
            self.state = SamplerState::Idle { entered_ms: now };
        }
    }

    fn publish_window(&mut self, sum: i64, samples: u8, hub: &DeviceHub, broker: &EventBroker) {
        if samples == 0 {
            self.scale_responding = false;
            self.weight_stable = false;
            self.current_weight = f32::NAN;
        } else {
            let raw = (sum / samples as i64) as i32;
            let weight = (raw - self.zero_offset) as f32 / self.calibration_factor;
            self.weight_stable = (weight - self.previous_weight).abs() < STABLE_DELTA_G;
            self.previous_weight = weight;
            self.current_raw = raw;
            self.current_weight = weight;
            self.scale_responding = true;
        }

        let (weight, raw) = (self.current_weight, self.current_raw);
        let (stable, responding) = (self.weight_stable, self.scale_responding);
        if hub
            .with_state(|state| {
                state.current_weight = weight;
                state.current_raw = raw;
                state.is_weight_stable = stable;
                state.is_scale_responding = responding;
            })
            .is_err()
        {
            error!("scale: could not publish window to device state");
        }
        if responding {
            broker.publish(EventPayload::Weight { grams: weight, raw });
            for observer in &self.observers {
                observer(weight, raw);
            }
        }
    }

    // ── Blocking calibration paths ────────────────────────────

    /// Fixed-count blocking average; bounded by `samples × 13 ms + 150 ms`.
    fn blocking_average(&mut self, samples: u8) -> core::result::Result<i64, ScaleError> {
        let deadline = self.clock.now_ms() + samples as u64 * TICK_MS + 150;
        self.chip.power_up();

        let mut sum = 0i64;
        let mut collected = 0u16;
        while collected < samples as u16 {
            if self.clock.now_ms() > deadline {
                break;
            }
            if let Some(raw) = self.chip.read_ready() {
                if raw != 0 {
                    sum += raw as i64;
                    collected += 1;
                }
            }
            self.clock.delay_ms(TICK_MS as u32);
        }

        // Resume the cooperative cycle from a settled, powered state.
        self.state = SamplerState::Settling {
            entered_ms: self.clock.now_ms(),
        };

        if collected == 0 {
            Err(ScaleError::Unresponsive)
        } else {
            Ok(sum / collected as i64)
        }
    }

    /// Blocking tare: 20-sample average becomes the new zero offset,
    /// persisted immediately.
    pub fn tare(&mut self) -> Result<()> {
        info!("scale: taring...");
        let average = self.blocking_average(TARE_SAMPLES).map_err(Error::Scale)?;
        self.zero_offset = average as i32;
        self.store
            .save_scale_calibration(self.calibration_factor, self.zero_offset);
        info!("scale: tare complete, new offset {}", self.zero_offset);
        Ok(())
    }

    /// Blocking calibration against a known reference mass.
    /// Returns the new calibration factor.
    pub fn calibrate_with_known_weight(&mut self, known_grams: f32, samples: u8) -> Result<f32> {
        if known_grams <= 0.0 {
            return Err(Error::Config("known weight must be positive"));
        }
        let average = self.blocking_average(samples).map_err(Error::Scale)?;
        let factor = (average as i32 - self.zero_offset) as f32 / known_grams;
        self.calibration_factor = factor;
        self.store
            .save_scale_calibration(self.calibration_factor, self.zero_offset);
        info!("scale: calibrated, new factor {factor:.4}");
        Ok(factor)
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Clonable handle putting the sampler behind the scale lock.
///
/// The sampler task ticks through one clone; the engine and calibration
/// paths read and tare through others. Critical sections are short.
pub struct SharedScale<L: LoadCellPort, C: Clock, S: CalibrationStore> {
    inner: Arc<Mutex<ScaleSampler<L, C, S>>>,
}

impl<L: LoadCellPort, C: Clock, S: CalibrationStore> SharedScale<L, C, S> {
    pub fn new(sampler: ScaleSampler<L, C, S>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(sampler)),
        }
    }

    pub fn tick(&self, hub: &DeviceHub, broker: &EventBroker) {
        self.inner.lock().tick(hub, broker);
    }

    pub fn with_sampler<T>(&self, f: impl FnOnce(&mut ScaleSampler<L, C, S>) -> T) -> T {
        f(&mut self.inner.lock())
    }
}

impl<L: LoadCellPort, C: Clock, S: CalibrationStore> Clone for SharedScale<L, C, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<L: LoadCellPort, C: Clock, S: CalibrationStore> ScalePort for SharedScale<L, C, S> {
    fn weight(&self) -> f32 {
        self.inner.lock().current_weight()
    }

    fn raw(&self) -> i32 {
        self.inner.lock().current_raw()
    }

    fn is_responding(&self) -> bool {
        self.inner.lock().is_responding()
    }

    fn tare(&mut self) -> Result<()> {
        self.inner.lock().tare()
    }
}
