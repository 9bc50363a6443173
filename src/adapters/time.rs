//! Monotonic time port.
//!
//! Everything in this crate that measures elapsed time or sleeps does so
//! through the [`Clock`] trait, never through wall-clock APIs directly.
//! This keeps every state machine host-testable with a simulated clock.
//!
//! - **`target_os = "espidf"`** — wraps `esp_timer_get_time()` (monotonic,
//!   microsecond precision) and FreeRTOS `vTaskDelay` for yields.
//! - **`not(target_os = "espidf")`** — `std::time::Instant` / thread sleep.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Monotonic clock + cooperative delay.
///
/// `delay_ms` must yield to other tasks on the target (it maps to a
/// FreeRTOS delay); spinning instead of delaying is never acceptable.
pub trait Clock {
    /// Milliseconds since boot (monotonic).
    fn now_ms(&self) -> u64;

    /// Suspend the calling task for at least `ms` milliseconds.
    fn delay_ms(&self, ms: u32);
}

// ---------------------------------------------------------------------------
// Platform clock
// ---------------------------------------------------------------------------

/// The real platform clock.
#[derive(Clone)]
pub struct SystemClock {
    #[cfg(not(target_os = "espidf"))]
    start: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            #[cfg(not(target_os = "espidf"))]
            start: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    #[cfg(target_os = "espidf")]
    fn now_ms(&self) -> u64 {
        // SAFETY: esp_timer_get_time is a monotonic counter read, callable
        // from any task context.
        (unsafe { esp_idf_svc::sys::esp_timer_get_time() }) as u64 / 1_000
    }

    #[cfg(not(target_os = "espidf"))]
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    #[cfg(target_os = "espidf")]
    fn delay_ms(&self, ms: u32) {
        // SAFETY: vTaskDelay suspends the calling FreeRTOS task.
        unsafe {
            esp_idf_svc::sys::vTaskDelay(ms.div_ceil(10).max(1));
        }
    }

    #[cfg(not(target_os = "espidf"))]
    fn delay_ms(&self, ms: u32) {
        std::thread::sleep(std::time::Duration::from_millis(ms as u64));
    }
}

// ---------------------------------------------------------------------------
// Simulated clock
// ---------------------------------------------------------------------------

/// A clock whose time only moves when something delays on it.
///
/// Cloned handles share the same timeline, so a test can hand the same
/// clock to the sampler, the engine, and the supervisor and watch their
/// interleavings deterministically.
#[derive(Clone, Default)]
pub struct SimClock {
    now_ms: Arc<AtomicU64>,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance simulated time without a delay call.
    pub fn advance_ms(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    /// Jump to an absolute timestamp (must be monotonic).
    pub fn set_ms(&self, ms: u64) {
        self.now_ms.store(ms, Ordering::SeqCst);
    }
}

impl Clock for SimClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn delay_ms(&self, ms: u32) {
        self.advance_ms(ms as u64);
    }
}
