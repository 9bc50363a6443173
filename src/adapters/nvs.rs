//! NVS (Non-Volatile Storage) adapter.
//!
//! Implements [`ConfigPort`], [`StoragePort`] and [`CalibrationStore`].
//! Config blobs are `postcard`-encoded; calibration lives inside the
//! config blob, so a calibration save is a read-modify-write of the
//! whole record (NVS commits are atomic).
//!
//! On ESP-IDF the backend is the raw `nvs_*` sys API; host builds use an
//! in-memory map so everything above this module is testable unchanged.

use log::{info, warn};

use crate::config::SystemConfig;
use crate::ports::{CalibrationStore, ConfigError, ConfigPort, StorageError, StoragePort};

#[cfg(not(target_os = "espidf"))]
use std::cell::RefCell;
#[cfg(not(target_os = "espidf"))]
use std::collections::HashMap;

#[cfg(target_os = "espidf")]
use esp_idf_svc::sys::*;

const CONFIG_NAMESPACE: &str = "kibblet";
const CONFIG_KEY: &str = "syscfg";
#[allow(dead_code)]
const MAX_BLOB_SIZE: usize = 4000;

pub struct NvsAdapter {
    #[cfg(not(target_os = "espidf"))]
    store: RefCell<HashMap<String, Vec<u8>>>,
}

impl NvsAdapter {
    /// Create the adapter and initialise NVS flash. On a version
    /// mismatch or exhausted free pages the partition is erased and
    /// re-initialised.
    pub fn new() -> Result<Self, ConfigError> {
        #[cfg(target_os = "espidf")]
        {
            // SAFETY: nvs_flash_init/erase run from the single main-task
            // context before any concurrent NVS access exists.
            let ret = unsafe { nvs_flash_init() };
            if ret == ESP_ERR_NVS_NO_FREE_PAGES || ret == ESP_ERR_NVS_NEW_VERSION_FOUND {
                warn!("nvs: erasing and re-initialising flash partition");
                if unsafe { nvs_flash_erase() } != ESP_OK {
                    return Err(ConfigError::IoError);
                }
                if unsafe { nvs_flash_init() } != ESP_OK {
                    return Err(ConfigError::IoError);
                }
            } else if ret != ESP_OK {
                return Err(ConfigError::IoError);
            }
            info!("nvs: ESP-IDF backend initialised");
        }

        #[cfg(not(target_os = "espidf"))]
        info!("nvs: simulation backend");

        Ok(Self {
            #[cfg(not(target_os = "espidf"))]
            store: RefCell::new(HashMap::new()),
        })
    }

    #[cfg(not(target_os = "espidf"))]
    fn composite_key(namespace: &str, key: &str) -> String {
        format!("{namespace}::{key}")
    }

    /// Open an NVS namespace, run a closure with the handle, close.
    #[cfg(target_os = "espidf")]
    fn with_nvs_handle<F, T>(namespace: &str, write: bool, f: F) -> Result<T, i32>
    where
        F: FnOnce(nvs_handle_t) -> Result<T, i32>,
    {
        let mut ns_buf = [0u8; 16];
        let ns_bytes = namespace.as_bytes();
        let len = ns_bytes.len().min(15);
        ns_buf[..len].copy_from_slice(&ns_bytes[..len]);

        let mut handle: nvs_handle_t = 0;
        let mode = if write {
            nvs_open_mode_t_NVS_READWRITE
        } else {
            nvs_open_mode_t_NVS_READONLY
        };

        // SAFETY: ns_buf is a NUL-terminated buffer; the handle is
        // closed on every path.
        let ret = unsafe { nvs_open(ns_buf.as_ptr() as *const _, mode, &mut handle) };
        if ret != ESP_OK {
            return Err(ret);
        }
        let result = f(handle);
        unsafe {
            nvs_close(handle);
        }
        result
    }

    #[cfg(target_os = "espidf")]
    fn key_buf(key: &str) -> [u8; 16] {
        let mut buf = [0u8; 16];
        let bytes = key.as_bytes();
        let len = bytes.len().min(15);
        buf[..len].copy_from_slice(&bytes[..len]);
        buf
    }
}

fn validate_config(cfg: &SystemConfig) -> Result<(), ConfigError> {
    if !(500..=2500).contains(&cfg.hopper_open_us) {
        return Err(ConfigError::ValidationFailed("hopper_open_us must be 500–2500"));
    }
    if !(500..=2500).contains(&cfg.hopper_closed_us) {
        return Err(ConfigError::ValidationFailed(
            "hopper_closed_us must be 500–2500",
        ));
    }
    if !(0.1..=50.0).contains(&cfg.dispense_weight_change_threshold_g) {
        return Err(ConfigError::ValidationFailed(
            "dispense_weight_change_threshold_g must be 0.1–50.0",
        ));
    }
    if !(1_000..=120_000).contains(&cfg.dispense_no_change_timeout_ms) {
        return Err(ConfigError::ValidationFailed(
            "dispense_no_change_timeout_ms must be 1000–120000",
        ));
    }
    if !(1..=50).contains(&cfg.scale_samples_count) {
        return Err(ConfigError::ValidationFailed(
            "scale_samples_count must be 1–50",
        ));
    }
    if cfg.scale_calibration_factor == 0.0 {
        return Err(ConfigError::ValidationFailed(
            "scale_calibration_factor must be non-zero",
        ));
    }
    if !(100.0..=2_000.0).contains(&cfg.overfill_limit_g) {
        return Err(ConfigError::ValidationFailed(
            "overfill_limit_g must be 100–2000",
        ));
    }
    if !(1_000..=60_000).contains(&cfg.stall_timeout_ms) {
        return Err(ConfigError::ValidationFailed(
            "stall_timeout_ms must be 1000–60000",
        ));
    }
    Ok(())
}

impl ConfigPort for NvsAdapter {
    fn load(&self) -> Result<SystemConfig, ConfigError> {
        let mut buf = [0u8; 512];
        match self.read(CONFIG_NAMESPACE, CONFIG_KEY, &mut buf) {
            Ok(len) => {
                let cfg: SystemConfig =
                    postcard::from_bytes(&buf[..len]).map_err(|_| ConfigError::Corrupted)?;
                info!("nvs: loaded config ({len} bytes)");
                Ok(cfg)
            }
            Err(StorageError::NotFound) => {
                info!("nvs: no stored config, using defaults");
                Ok(SystemConfig::default())
            }
            Err(_) => {
                warn!("nvs: config read error, using defaults");
                Ok(SystemConfig::default())
            }
        }
    }

    fn save(&mut self, config: &SystemConfig) -> Result<(), ConfigError> {
        validate_config(config)?;
        let bytes = postcard::to_allocvec(config).map_err(|_| ConfigError::IoError)?;
        self.write(CONFIG_NAMESPACE, CONFIG_KEY, &bytes)
            .map_err(|_| ConfigError::IoError)?;
        info!("nvs: config saved ({} bytes)", bytes.len());
        Ok(())
    }
}

impl StoragePort for NvsAdapter {
    fn read(&self, namespace: &str, key: &str, buf: &mut [u8]) -> Result<usize, StorageError> {
        #[cfg(not(target_os = "espidf"))]
        {
            let composite = Self::composite_key(namespace, key);
            match self.store.borrow().get(&composite) {
                Some(data) => {
                    let len = data.len().min(buf.len());
                    buf[..len].copy_from_slice(&data[..len]);
                    Ok(len)
                }
                None => Err(StorageError::NotFound),
            }
        }

        #[cfg(target_os = "espidf")]
        {
            let result = Self::with_nvs_handle(namespace, false, |handle| {
                let key_buf = Self::key_buf(key);
                let mut size = buf.len();
                // SAFETY: buf outlives the call; size is in/out.
                let ret = unsafe {
                    nvs_get_blob(
                        handle,
                        key_buf.as_ptr() as *const _,
                        buf.as_mut_ptr() as *mut _,
                        &mut size,
                    )
                };
                if ret != ESP_OK {
                    return Err(ret);
                }
                Ok(size)
            });
            match result {
                Ok(size) => Ok(size),
                Err(e) if e == ESP_ERR_NVS_NOT_FOUND => Err(StorageError::NotFound),
                Err(_) => Err(StorageError::IoError),
            }
        }
    }

    fn write(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError> {
        #[cfg(not(target_os = "espidf"))]
        {
            let composite = Self::composite_key(namespace, key);
            self.store.borrow_mut().insert(composite, data.to_vec());
            Ok(())
        }

        #[cfg(target_os = "espidf")]
        {
            let result = Self::with_nvs_handle(namespace, true, |handle| {
                let key_buf = Self::key_buf(key);
                // SAFETY: data outlives the call.
                let ret = unsafe {
                    nvs_set_blob(
                        handle,
                        key_buf.as_ptr() as *const _,
                        data.as_ptr() as *const _,
                        data.len(),
                    )
                };
                if ret != ESP_OK {
                    return Err(ret);
                }
                let ret = unsafe { nvs_commit(handle) };
                if ret != ESP_OK {
                    return Err(ret);
                }
                Ok(())
            });
            result.map_err(|_| StorageError::IoError)
        }
    }

    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StorageError> {
        #[cfg(not(target_os = "espidf"))]
        {
            let composite = Self::composite_key(namespace, key);
            self.store.borrow_mut().remove(&composite);
            Ok(())
        }

        #[cfg(target_os = "espidf")]
        {
            let result = Self::with_nvs_handle(namespace, true, |handle| {
                let key_buf = Self::key_buf(key);
                // SAFETY: erasing a possibly-absent key is tolerated.
                let ret = unsafe { nvs_erase_key(handle, key_buf.as_ptr() as *const _) };
                if ret != ESP_OK && ret != ESP_ERR_NVS_NOT_FOUND {
                    return Err(ret);
                }
                let ret = unsafe { nvs_commit(handle) };
                if ret != ESP_OK {
                    return Err(ret);
                }
                Ok(())
            });
            result.map_err(|_| StorageError::IoError)
        }
    }

    fn exists(&self, namespace: &str, key: &str) -> bool {
        #[cfg(not(target_os = "espidf"))]
        {
            let composite = Self::composite_key(namespace, key);
            self.store.borrow().contains_key(&composite)
        }

        #[cfg(target_os = "espidf")]
        {
            let result = Self::with_nvs_handle(namespace, false, |handle| {
                let key_buf = Self::key_buf(key);
                // SAFETY: existence probe only.
                let ret = unsafe {
                    nvs_find_key(handle, key_buf.as_ptr() as *const _, core::ptr::null_mut())
                };
                Ok(ret == ESP_OK)
            });
            result.unwrap_or(false)
        }
    }
}

impl CalibrationStore for NvsAdapter {
    fn load_scale_calibration(&self) -> Option<(f32, i32)> {
        let cfg = ConfigPort::load(self).ok()?;
        Some((cfg.scale_calibration_factor, cfg.scale_zero_offset))
    }

    fn save_scale_calibration(&mut self, factor: f32, offset: i32) {
        let mut cfg = ConfigPort::load(self).unwrap_or_default();
        cfg.scale_calibration_factor = factor;
        cfg.scale_zero_offset = offset;
        if let Err(e) = self.save(&cfg) {
            warn!("nvs: scale calibration save failed ({e})");
        }
    }

    fn load_hopper_calibration(&self) -> Option<(u16, u16)> {
        let cfg = ConfigPort::load(self).ok()?;
        Some((cfg.hopper_closed_us, cfg.hopper_open_us))
    }

    fn save_hopper_calibration(&mut self, closed_us: u16, open_us: u16) {
        let mut cfg = ConfigPort::load(self).unwrap_or_default();
        cfg.hopper_closed_us = closed_us;
        cfg.hopper_open_us = open_us;
        if let Err(e) = self.save(&cfg) {
            warn!("nvs: hopper calibration save failed ({e})");
        }
    }
}

impl Default for NvsAdapter {
    fn default() -> Self {
        Self::new().unwrap_or_else(|_| Self {
            #[cfg(not(target_os = "espidf"))]
            store: RefCell::new(HashMap::new()),
        })
    }
}
