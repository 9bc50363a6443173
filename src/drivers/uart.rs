//! Bridge UART port.
//!
//! Implements [`BridgePort`] over the ESP-IDF UART driver on device; the
//! host build gets a dead-air port (the integration tests wire their own
//! scripted ports instead).

use crate::bridge::BridgePort;

#[cfg(target_os = "espidf")]
pub use esp_impl::UartBridgePort;

#[cfg(target_os = "espidf")]
mod esp_impl {
    use super::BridgePort;
    use crate::pins;
    use esp_idf_svc::sys::*;

    /// Byte stream over the already-installed bridge UART.
    pub struct UartBridgePort {
        port: i32,
    }

    impl UartBridgePort {
        pub fn new() -> Self {
            Self {
                port: pins::BRIDGE_UART_NUM as i32,
            }
        }
    }

    impl Default for UartBridgePort {
        fn default() -> Self {
            Self::new()
        }
    }

    impl BridgePort for UartBridgePort {
        fn write_all(&mut self, bytes: &[u8]) {
            // SAFETY: the UART driver was installed in hw_init before any
            // task could reach this port.
            unsafe {
                uart_write_bytes(self.port, bytes.as_ptr() as *const _, bytes.len());
            }
        }

        fn read_byte(&mut self) -> Option<u8> {
            let mut byte = 0u8;
            // SAFETY: zero-timeout read of the driver's RX ring buffer.
            let n = unsafe { uart_read_bytes(self.port, (&mut byte) as *mut u8 as *mut _, 1, 0) };
            (n == 1).then_some(byte)
        }

        fn clear_rx(&mut self) {
            // SAFETY: flushes the driver's RX FIFO and ring buffer.
            unsafe {
                uart_flush_input(self.port);
            }
        }
    }
}

/// Port that never receives anything — host-build placeholder.
#[derive(Default)]
pub struct SilentBridgePort;

impl BridgePort for SilentBridgePort {
    fn write_all(&mut self, _bytes: &[u8]) {}

    fn read_byte(&mut self) -> Option<u8> {
        None
    }

    fn clear_rx(&mut self) {}
}
