//! One-shot hardware peripheral initialization.
//!
//! Configures the bridge UART, the I2C master for the PWM expander, the
//! HX711 GPIOs and the servo power gate using raw ESP-IDF sys calls.
//! Called once from `main()` before any task starts.

#[cfg(target_os = "espidf")]
use esp_idf_svc::sys::*;

#[cfg(target_os = "espidf")]
use log::info;

#[cfg(target_os = "espidf")]
use crate::pins;

// ── Error type ────────────────────────────────────────────────

/// Errors during one-shot peripheral initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwInitError {
    UartInitFailed(i32),
    I2cInitFailed(i32),
    GpioConfigFailed(i32),
    StorageMountFailed(i32),
}

impl core::fmt::Display for HwInitError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::UartInitFailed(rc) => write!(f, "UART init failed (rc={rc})"),
            Self::I2cInitFailed(rc) => write!(f, "I2C init failed (rc={rc})"),
            Self::GpioConfigFailed(rc) => write!(f, "GPIO config failed (rc={rc})"),
            Self::StorageMountFailed(rc) => write!(f, "storage mount failed (rc={rc})"),
        }
    }
}

#[cfg(target_os = "espidf")]
pub fn init_peripherals() -> Result<(), HwInitError> {
    // SAFETY: called once from main() before any other task exists.
    unsafe {
        init_bridge_uart()?;
        init_i2c_master()?;
        init_gpio_outputs()?;
        init_hx711_pins()?;
    }
    info!("hw_init: all peripherals configured");
    Ok(())
}

#[cfg(not(target_os = "espidf"))]
pub fn init_peripherals() -> Result<(), HwInitError> {
    log::info!("hw_init(sim): peripheral init skipped");
    Ok(())
}

// ── Bridge UART (57600 8N1) ───────────────────────────────────

#[cfg(target_os = "espidf")]
unsafe fn init_bridge_uart() -> Result<(), HwInitError> {
    let cfg = uart_config_t {
        baud_rate: pins::BRIDGE_BAUD as i32,
        data_bits: uart_word_length_t_UART_DATA_8_BITS,
        parity: uart_parity_t_UART_PARITY_DISABLE,
        stop_bits: uart_stop_bits_t_UART_STOP_BITS_1,
        flow_ctrl: uart_hw_flowcontrol_t_UART_HW_FLOWCTRL_DISABLE,
        ..Default::default()
    };
    let port = pins::BRIDGE_UART_NUM as i32;
    let rc = unsafe { uart_param_config(port, &cfg) };
    if rc != ESP_OK {
        return Err(HwInitError::UartInitFailed(rc));
    }
    let rc = unsafe {
        uart_set_pin(
            port,
            pins::BRIDGE_TX_GPIO,
            pins::BRIDGE_RX_GPIO,
            -1,
            -1,
        )
    };
    if rc != ESP_OK {
        return Err(HwInitError::UartInitFailed(rc));
    }
    let rc = unsafe { uart_driver_install(port, 512, 512, 0, core::ptr::null_mut(), 0) };
    if rc != ESP_OK {
        return Err(HwInitError::UartInitFailed(rc));
    }
    info!("hw_init: bridge UART{} at {} baud", port, pins::BRIDGE_BAUD);
    Ok(())
}

// ── I2C master (PCA9685) ──────────────────────────────────────

#[cfg(target_os = "espidf")]
unsafe fn init_i2c_master() -> Result<(), HwInitError> {
    let cfg = i2c_config_t {
        mode: i2c_mode_t_I2C_MODE_MASTER,
        sda_io_num: pins::I2C_SDA_GPIO,
        scl_io_num: pins::I2C_SCL_GPIO,
        sda_pullup_en: true,
        scl_pullup_en: true,
        __bindgen_anon_1: i2c_config_t__bindgen_ty_1 {
            master: i2c_config_t__bindgen_ty_1__bindgen_ty_1 { clk_speed: 400_000 },
        },
        ..Default::default()
    };
    let rc = unsafe { i2c_param_config(0, &cfg) };
    if rc != ESP_OK {
        return Err(HwInitError::I2cInitFailed(rc));
    }
    let rc = unsafe { i2c_driver_install(0, i2c_mode_t_I2C_MODE_MASTER, 0, 0, 0) };
    if rc != ESP_OK {
        return Err(HwInitError::I2cInitFailed(rc));
    }
    info!("hw_init: I2C master configured (SDA={}, SCL={})", pins::I2C_SDA_GPIO, pins::I2C_SCL_GPIO);
    Ok(())
}

// ── GPIO outputs ──────────────────────────────────────────────

#[cfg(target_os = "espidf")]
unsafe fn init_gpio_outputs() -> Result<(), HwInitError> {
    let cfg = gpio_config_t {
        pin_bit_mask: 1u64 << pins::SERVO_POWER_ENABLE_GPIO,
        mode: gpio_mode_t_GPIO_MODE_OUTPUT,
        pull_up_en: gpio_pullup_t_GPIO_PULLUP_DISABLE,
        pull_down_en: gpio_pulldown_t_GPIO_PULLDOWN_DISABLE,
        intr_type: gpio_int_type_t_GPIO_INTR_DISABLE,
    };
    let rc = unsafe { gpio_config(&cfg) };
    if rc != ESP_OK {
        return Err(HwInitError::GpioConfigFailed(rc));
    }
    // Active-low gate: start with the servo supply cut.
    unsafe { gpio_set_level(pins::SERVO_POWER_ENABLE_GPIO, 1) };
    Ok(())
}

// ── HX711 pins ────────────────────────────────────────────────

#[cfg(target_os = "espidf")]
unsafe fn init_hx711_pins() -> Result<(), HwInitError> {
    let out_cfg = gpio_config_t {
        pin_bit_mask: 1u64 << pins::HX711_CLOCK_GPIO,
        mode: gpio_mode_t_GPIO_MODE_OUTPUT,
        pull_up_en: gpio_pullup_t_GPIO_PULLUP_DISABLE,
        pull_down_en: gpio_pulldown_t_GPIO_PULLDOWN_DISABLE,
        intr_type: gpio_int_type_t_GPIO_INTR_DISABLE,
    };
    let rc = unsafe { gpio_config(&out_cfg) };
    if rc != ESP_OK {
        return Err(HwInitError::GpioConfigFailed(rc));
    }

    let in_cfg = gpio_config_t {
        pin_bit_mask: 1u64 << pins::HX711_DATA_GPIO,
        mode: gpio_mode_t_GPIO_MODE_INPUT,
        pull_up_en: gpio_pullup_t_GPIO_PULLUP_ENABLE,
        pull_down_en: gpio_pulldown_t_GPIO_PULLDOWN_DISABLE,
        intr_type: gpio_int_type_t_GPIO_INTR_DISABLE,
    };
    let rc = unsafe { gpio_config(&in_cfg) };
    if rc != ESP_OK {
        return Err(HwInitError::GpioConfigFailed(rc));
    }
    Ok(())
}

// ── Storage filesystem ────────────────────────────────────────

/// Mount the SPIFFS partition at /spiffs (recipe replicas live there).
#[cfg(target_os = "espidf")]
pub fn mount_storage() -> Result<(), HwInitError> {
    let base_path = b"/spiffs\0";
    let cfg = esp_vfs_spiffs_conf_t {
        base_path: base_path.as_ptr() as *const _,
        partition_label: core::ptr::null(),
        max_files: 8,
        format_if_mount_failed: true,
    };
    // SAFETY: called once at boot; cfg strings outlive the call.
    let rc = unsafe { esp_vfs_spiffs_register(&cfg) };
    if rc != ESP_OK {
        return Err(HwInitError::StorageMountFailed(rc));
    }
    info!("hw_init: SPIFFS mounted at /spiffs");
    Ok(())
}

#[cfg(not(target_os = "espidf"))]
pub fn mount_storage() -> Result<(), HwInitError> {
    Ok(())
}

// ── GPIO helpers ──────────────────────────────────────────────

#[cfg(target_os = "espidf")]
pub fn gpio_write(pin: i32, high: bool) {
    // SAFETY: writes to an already-configured output pin.
    unsafe {
        gpio_set_level(pin, if high { 1 } else { 0 });
    }
}

#[cfg(not(target_os = "espidf"))]
pub fn gpio_write(_pin: i32, _high: bool) {}

#[cfg(target_os = "espidf")]
pub fn gpio_read(pin: i32) -> bool {
    // SAFETY: read-only register access on a configured input pin.
    (unsafe { gpio_get_level(pin) }) != 0
}

#[cfg(not(target_os = "espidf"))]
pub fn gpio_read(_pin: i32) -> bool {
    true
}
