//! HX711 load-cell amplifier chip driver.
//!
//! Two-pin interface: DOUT goes low when a 24-bit conversion is ready;
//! 25–27 clock pulses shift it out and select the next gain. Holding
//! the clock high longer than 60 µs powers the chip down; releasing it
//! powers the chip back up, after which conversions need ~50 ms to
//! settle.
//!
//! The driver is deliberately non-blocking: `read_ready` returns `None`
//! unless a conversion is waiting, so the sampler can poll from its
//! 13 ms tick without ever spinning on the pin.

/// Chip-level port consumed by the sampler.
pub trait LoadCellPort {
    fn power_up(&mut self);
    fn power_down(&mut self);

    /// If a conversion is ready, shift it out and return the signed
    /// 24-bit value sign-extended to `i32`. A raw reading of zero is a
    /// failed conversion by convention (an open input reads all-zero).
    fn read_ready(&mut self) -> Option<i32>;
}

#[cfg(target_os = "espidf")]
pub use esp_impl::Hx711Driver;

#[cfg(target_os = "espidf")]
mod esp_impl {
    use super::LoadCellPort;
    use crate::pins;
    use esp_idf_svc::sys::*;

    /// Bit-banged HX711 at gain 128 (channel A).
    pub struct Hx711Driver {
        powered: bool,
    }

    impl Hx711Driver {
        pub fn new() -> Self {
            let mut driver = Self { powered: false };
            driver.power_up();
            driver
        }

        fn clock_pulse(&self) -> bool {
            // SAFETY: both pins were configured in hw_init; the sampler
            // serializes all access behind the scale lock.
            unsafe {
                gpio_set_level(pins::HX711_CLOCK_GPIO, 1);
                esp_rom_delay_us(1);
                gpio_set_level(pins::HX711_CLOCK_GPIO, 0);
                esp_rom_delay_us(1);
                gpio_get_level(pins::HX711_DATA_GPIO) != 0
            }
        }
    }

    impl Default for Hx711Driver {
        fn default() -> Self {
            Self::new()
        }
    }

    impl LoadCellPort for Hx711Driver {
        fn power_up(&mut self) {
            // SAFETY: configured output pin.
            unsafe {
                gpio_set_level(pins::HX711_CLOCK_GPIO, 0);
            }
            self.powered = true;
        }

        fn power_down(&mut self) {
            // Clock held high > 60 µs enters power-down.
            // SAFETY: configured output pin.
            unsafe {
                gpio_set_level(pins::HX711_CLOCK_GPIO, 1);
                esp_rom_delay_us(70);
            }
            self.powered = false;
        }

        fn read_ready(&mut self) -> Option<i32> {
            if !self.powered {
                return None;
            }
            // DOUT high = conversion still in progress.
            // SAFETY: configured input pin.
            if unsafe { gpio_get_level(pins::HX711_DATA_GPIO) } != 0 {
                return None;
            }

            let mut raw: u32 = 0;
            for _ in 0..24 {
                raw = (raw << 1) | (self.clock_pulse() as u32);
            }
            // 25th pulse selects channel A, gain 128 for the next cycle.
            let _ = self.clock_pulse();

            // Sign-extend 24 → 32 bits.
            let value = if raw & 0x0080_0000 != 0 {
                (raw | 0xFF00_0000) as i32
            } else {
                raw as i32
            };
            Some(value)
        }
    }
}

/// Scriptable chip stand-in for host builds and tests.
#[derive(Debug, Default)]
pub struct SimLoadCell {
    pub powered: bool,
    /// Raw value returned while ready; `None` simulates a chip that
    /// never signals readiness.
    pub next_raw: Option<i32>,
    pub reads: usize,
    pub power_cycles: usize,
}

impl SimLoadCell {
    pub fn new(raw: i32) -> Self {
        Self {
            powered: true,
            next_raw: Some(raw),
            reads: 0,
            power_cycles: 0,
        }
    }

    pub fn unresponsive() -> Self {
        Self {
            powered: true,
            next_raw: None,
            reads: 0,
            power_cycles: 0,
        }
    }
}

impl LoadCellPort for SimLoadCell {
    fn power_up(&mut self) {
        if !self.powered {
            self.power_cycles += 1;
        }
        self.powered = true;
    }

    fn power_down(&mut self) {
        self.powered = false;
    }

    fn read_ready(&mut self) -> Option<i32> {
        if !self.powered {
            return None;
        }
        self.reads += 1;
        self.next_raw
    }
}
