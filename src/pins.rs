//! GPIO / peripheral pin assignments for the KibbleT5 main board.
//!
//! Single source of truth — every driver references this module rather than
//! hard-coding pin numbers.  Change a pin here and it propagates everywhere.

// ---------------------------------------------------------------------------
// Bus-bridge UART (CH32V003 slave MCU multiplexing six 1-Wire buses)
// ---------------------------------------------------------------------------

/// UART TX towards the bridge MCU.
pub const BRIDGE_TX_GPIO: i32 = 27;
/// UART RX from the bridge MCU.
pub const BRIDGE_RX_GPIO: i32 = 13;
/// UART peripheral number used for the bridge link.
pub const BRIDGE_UART_NUM: u32 = 2;
/// Bridge link baud rate (8N1).
pub const BRIDGE_BAUD: u32 = 57_600;

// ---------------------------------------------------------------------------
// Servo power gate
// ---------------------------------------------------------------------------

/// Digital output gating the external 5 V servo supply.
/// Active-low: LOW = servos powered, HIGH = supply cut.
pub const SERVO_POWER_ENABLE_GPIO: i32 = 33;

// ---------------------------------------------------------------------------
// Load cell amplifier (HX711)
// ---------------------------------------------------------------------------

/// HX711 serial data output (DOUT). Also doubles as the ready flag:
/// the chip pulls it low when a conversion is available.
pub const HX711_DATA_GPIO: i32 = 15;
/// HX711 serial clock (PD_SCK). Holding it high > 60 µs powers the chip down.
pub const HX711_CLOCK_GPIO: i32 = 14;

// ---------------------------------------------------------------------------
// PWM expander (PCA9685, default I2C pinout)
// ---------------------------------------------------------------------------

pub const I2C_SDA_GPIO: i32 = 21;
pub const I2C_SCL_GPIO: i32 = 22;
/// 7-bit I2C address of the PCA9685.
pub const PCA9685_ADDR: u8 = 0x40;

// ---------------------------------------------------------------------------
// Channel map on the PCA9685
// ---------------------------------------------------------------------------

/// Tank auger servos occupy channels 0..NUMBER_OF_BUSES (one per bus).
pub const NUMBER_OF_BUSES: usize = 6;
/// The hopper gate servo sits on the channel right after the augers.
pub const HOPPER_SERVO_CHANNEL: u8 = NUMBER_OF_BUSES as u8;
/// Channels actually driven (augers + hopper).
pub const TOTAL_SERVO_COUNT: usize = NUMBER_OF_BUSES + 1;
