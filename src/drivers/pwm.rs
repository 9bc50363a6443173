//! PCA9685 16-channel PWM driver with dual-role operation.
//!
//! The expander plays two mutually exclusive roles:
//!
//! - **Servo mode** — 50 Hz pulses; channels carry RC-servo commands in
//!   microseconds, idle channels sit at their calibrated neutral pulse.
//! - **Bus-power mode** — same 50 Hz base but every channel held fully
//!   on, repurposing the outputs to supply the tank EEPROM pull-ups.
//!
//! A transition mutes all channels for one full 20 ms frame, applies the
//! new role, then waits a 100 ms settling period before bus traffic or
//! servo motion is allowed.
//!
//! The companion power-gate GPIO switches the external 5 V servo supply
//! and is active-low.

use log::info;

use crate::adapters::time::Clock;

/// Full servo frame at 50 Hz.
const SERVO_FRAME_MS: u32 = 20;
/// Post-transition settling time.
const MODE_SETTLE_MS: u32 = 100;
/// PWM base frequency for both roles.
const PWM_FREQ_HZ: u16 = 50;

/// Current role of the expander outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PwmMode {
    Servo,
    BusPower,
}

/// Register-level access to the expander and the power-gate pin.
///
/// `channel: None` addresses the all-channel broadcast register.
pub trait PwmBackend {
    fn set_frequency(&mut self, hz: u16);
    fn set_channel_us(&mut self, channel: u8, us: u16);
    fn set_full(&mut self, channel: Option<u8>, on: bool);
    /// Drive the active-low servo supply gate. `true` = supply on.
    fn set_power_gate(&mut self, on: bool);
}

pub struct PwmDriver<B: PwmBackend, C: Clock> {
    backend: B,
    clock: C,
    mode: PwmMode,
}

impl<B: PwmBackend, C: Clock> PwmDriver<B, C> {
    /// Construct in bus-power role with the supply gate off.
    pub fn new(mut backend: B, clock: C) -> Self {
        backend.set_frequency(PWM_FREQ_HZ);
        backend.set_full(None, false);
        backend.set_power_gate(false);
        Self {
            backend,
            clock,
            mode: PwmMode::BusPower,
        }
    }

    pub fn mode(&self) -> PwmMode {
        self.mode
    }

    /// Switch to servo role and power the servo supply.
    /// `idle_pulses` seeds each listed channel with its neutral pulse so
    /// augers do not twitch when the supply comes up.
    pub fn enter_servo_mode(&mut self, idle_pulses: &[(u8, u16)]) {
        self.backend.set_frequency(PWM_FREQ_HZ);
        self.backend.set_full(None, false);
        self.clock.delay_ms(SERVO_FRAME_MS + 1);

        for &(channel, us) in idle_pulses {
            self.backend.set_channel_us(channel, us);
        }
        self.backend.set_power_gate(true);
        self.mode = PwmMode::Servo;
        self.clock.delay_ms(MODE_SETTLE_MS);
        info!("pwm: servo mode (power on)");
    }

    /// Switch to bus-power role: gate off, every channel fully on to
    /// feed the EEPROM pull-ups.
    pub fn enter_bus_power_mode(&mut self) {
        self.backend.set_power_gate(false);
        self.backend.set_frequency(PWM_FREQ_HZ);
        self.backend.set_full(None, false);
        self.clock.delay_ms(SERVO_FRAME_MS + 1);

        self.backend.set_full(None, true);
        self.mode = PwmMode::BusPower;
        self.clock.delay_ms(MODE_SETTLE_MS);
        info!("pwm: bus-power mode (power gate off)");
    }

    /// Command a channel pulse width. Only meaningful in servo mode.
    pub fn set_microseconds(&mut self, channel: u8, us: u16) {
        self.backend.set_channel_us(channel, us);
    }

    /// Force a channel fully on or off.
    pub fn set_full(&mut self, channel: u8, on: bool) {
        self.backend.set_full(Some(channel), on);
    }

    pub fn set_frequency(&mut self, hz: u16) {
        self.backend.set_frequency(hz);
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

// ---------------------------------------------------------------------------
// In-memory backend (host builds and tests)
// ---------------------------------------------------------------------------

/// Backend that tracks commanded state in memory; the host-side stand-in
/// for the I2C expander and the test observation point.
#[derive(Debug, Clone)]
pub struct MemoryPwmBackend {
    pub frequency_hz: u16,
    /// Last pulse commanded per channel (µs); `None` if never set.
    pub channel_us: [Option<u16>; 16],
    /// Channels currently forced fully on.
    pub full_on: [bool; 16],
    pub power_gate_on: bool,
}

impl Default for MemoryPwmBackend {
    fn default() -> Self {
        Self {
            frequency_hz: 0,
            channel_us: [None; 16],
            full_on: [false; 16],
            power_gate_on: false,
        }
    }
}

impl MemoryPwmBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all_full_on(&self) -> bool {
        self.full_on.iter().all(|&on| on)
    }
}

impl PwmBackend for MemoryPwmBackend {
    fn set_frequency(&mut self, hz: u16) {
        self.frequency_hz = hz;
    }

    fn set_channel_us(&mut self, channel: u8, us: u16) {
        if let Some(slot) = self.channel_us.get_mut(channel as usize) {
            *slot = Some(us);
            self.full_on[channel as usize] = false;
        }
    }

    fn set_full(&mut self, channel: Option<u8>, on: bool) {
        match channel {
            Some(ch) => {
                if let Some(slot) = self.full_on.get_mut(ch as usize) {
                    *slot = on;
                }
            }
            None => self.full_on = [on; 16],
        }
    }

    fn set_power_gate(&mut self, on: bool) {
        self.power_gate_on = on;
    }
}

// ---------------------------------------------------------------------------
// PCA9685 I2C backend (device builds)
// ---------------------------------------------------------------------------

#[cfg(target_os = "espidf")]
pub use esp_impl::Pca9685Backend;

#[cfg(target_os = "espidf")]
mod esp_impl {
    use super::PwmBackend;
    use crate::pins;
    use esp_idf_svc::sys::*;
    use log::warn;

    const REG_MODE1: u8 = 0x00;
    const REG_PRESCALE: u8 = 0xFE;
    const REG_LED0_ON_L: u8 = 0x06;
    const REG_ALL_LED_ON_L: u8 = 0xFA;
    const MODE1_SLEEP: u8 = 0x10;
    const MODE1_AUTO_INC: u8 = 0x20;
    /// Internal oscillator frequency.
    const OSC_HZ: f32 = 25_000_000.0;

    pub struct Pca9685Backend {
        port: i2c_port_t,
        addr: u8,
        frequency_hz: u16,
    }

    impl Pca9685Backend {
        /// The I2C master must already be installed (see `hw_init`).
        pub fn new(port: i2c_port_t) -> Self {
            let mut backend = Self {
                port,
                addr: pins::PCA9685_ADDR,
                frequency_hz: 50,
            };
            backend.write_reg(REG_MODE1, MODE1_AUTO_INC);
            backend
        }

        fn write_reg(&mut self, reg: u8, value: u8) {
            self.write_regs(reg, &[value]);
        }

        fn write_regs(&mut self, reg: u8, values: &[u8]) {
            let mut buf = [0u8; 8];
            buf[0] = reg;
            buf[1..1 + values.len()].copy_from_slice(values);
            // SAFETY: the I2C driver is installed once at boot; register
            // writes are serialized behind the bridge mutex upstream.
            let rc = unsafe {
                i2c_master_write_to_device(
                    self.port,
                    self.addr,
                    buf.as_ptr(),
                    1 + values.len(),
                    100,
                )
            };
            if rc != ESP_OK {
                warn!("pca9685: I2C write to reg {:#04x} failed (rc={})", reg, rc);
            }
        }

        fn write_on_off(&mut self, base_reg: u8, on: u16, off: u16) {
            self.write_regs(
                base_reg,
                &[
                    (on & 0xFF) as u8,
                    (on >> 8) as u8,
                    (off & 0xFF) as u8,
                    (off >> 8) as u8,
                ],
            );
        }
    }

    impl PwmBackend for Pca9685Backend {
        fn set_frequency(&mut self, hz: u16) {
            self.frequency_hz = hz;
            let prescale = (OSC_HZ / (4096.0 * hz as f32) - 1.0 + 0.5) as u8;
            // Prescale is only writable while the oscillator sleeps.
            self.write_reg(REG_MODE1, MODE1_AUTO_INC | MODE1_SLEEP);
            self.write_reg(REG_PRESCALE, prescale);
            self.write_reg(REG_MODE1, MODE1_AUTO_INC);
        }

        fn set_channel_us(&mut self, channel: u8, us: u16) {
            if channel >= 16 {
                return;
            }
            let frame_us = 1_000_000u32 / self.frequency_hz as u32;
            let ticks = (us as u32 * 4096 / frame_us).min(4095) as u16;
            self.write_on_off(REG_LED0_ON_L + channel * 4, 0, ticks);
        }

        fn set_full(&mut self, channel: Option<u8>, on: bool) {
            // Bit 12 of the ON (full-on) / OFF (full-off) registers.
            let (on_val, off_val) = if on { (0x1000, 0) } else { (0, 0x1000) };
            match channel {
                Some(ch) if ch < 16 => {
                    self.write_on_off(REG_LED0_ON_L + ch * 4, on_val, off_val)
                }
                Some(_) => {}
                None => self.write_on_off(REG_ALL_LED_ON_L, on_val, off_val),
            }
        }

        fn set_power_gate(&mut self, on: bool) {
            // Active-low gate: LOW powers the servo rail.
            crate::drivers::hw_init::gpio_write(pins::SERVO_POWER_ENABLE_GPIO, !on);
        }
    }
}
