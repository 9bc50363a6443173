//! Driven adapters: persistence, identity, and time.

pub mod device_id;
pub mod nvs;
pub mod time;
