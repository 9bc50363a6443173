//! Device identity.
//!
//! The base's factory 48-bit MAC identifies the host that last wrote a
//! tank record. Read once at boot.

/// Read the base MAC from eFuse (fixed placeholder on host builds).
#[cfg(target_os = "espidf")]
pub fn read_base_mac() -> [u8; 6] {
    let mut mac = [0u8; 6];
    // SAFETY: esp_efuse_mac_get_default only writes the 6-byte buffer.
    let ret = unsafe { esp_idf_svc::sys::esp_efuse_mac_get_default(mac.as_mut_ptr()) };
    if ret != esp_idf_svc::sys::ESP_OK {
        log::warn!("device_id: eFuse MAC read failed (rc={ret})");
    }
    mac
}

#[cfg(not(target_os = "espidf"))]
pub fn read_base_mac() -> [u8; 6] {
    [0x02, 0x4B, 0x42, 0x4C, 0x54, 0x35]
}
