//! KibbleT5 Firmware — Main Entry Point
//!
//! Bootstraps the hardware, wires the subsystems, and runs the
//! cooperative control loop:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                    Control loop (tick-driven)             │
//! │                                                           │
//! │  ScaleSampler      13 ms pacing, power-cycled averaging   │
//! │  SafetySupervisor  100 ms, stall + overfill rules         │
//! │  FeedDispatcher    inbox → DispensingEngine phase FSM     │
//! │  TankRegistry      1 s scanner, presence reconciliation   │
//! │                                                           │
//! │  shared: DeviceHub (state + inbox) · EventBroker (push)   │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! External collaborators (HTTP surface, Wi-Fi, display, OTA, NTP,
//! battery) attach through the hub and the event broker; none of them
//! live in this crate.

#![deny(unused_must_use)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use log::{info, warn};

use kibblet::adapters::device_id;
use kibblet::adapters::nvs::NvsAdapter;
use kibblet::adapters::time::{Clock, SystemClock};
use kibblet::bridge::{BridgeClient, BridgePort};
use kibblet::config::SystemConfig;
use kibblet::dispatch::FeedDispatcher;
use kibblet::drivers::hw_init;
use kibblet::drivers::pwm::{PwmBackend, PwmDriver};
use kibblet::engine::DispensingEngine;
use kibblet::events::{EventBroker, EventPayload, Topic};
use kibblet::hub::DeviceHub;
use kibblet::ports::ConfigPort;
use kibblet::safety::SafetySupervisor;
use kibblet::scale::hx711::LoadCellPort;
use kibblet::scale::{ScaleSampler, SharedScale};
use kibblet::store::RecipeStore;
use kibblet::tank::registry::SharedRegistry;
use kibblet::tank::TankRegistry;

fn main() -> Result<()> {
    // ── 1. Platform bootstrap ─────────────────────────────────
    #[cfg(target_os = "espidf")]
    {
        esp_idf_svc::sys::link_patches();
        esp_idf_svc::log::EspLogger::initialize_default();
    }

    info!("╔══════════════════════════════════════╗");
    info!("║  KibbleT5 v{}                     ║", env!("CARGO_PKG_VERSION"));
    info!("╚══════════════════════════════════════╝");

    if let Err(e) = hw_init::init_peripherals() {
        // Peripheral init failure is critical — log and halt; the
        // hardware watchdog resets us after its timeout.
        log::error!("HAL init failed: {e} — halting");
        #[allow(clippy::empty_loop)]
        loop {}
    }
    if let Err(e) = hw_init::mount_storage() {
        warn!("storage mount failed: {e} — recipes will not persist");
    }

    // ── 2. Settings ───────────────────────────────────────────
    let nvs = match NvsAdapter::new() {
        Ok(nvs) => nvs,
        Err(e) => {
            warn!("NVS init failed ({e}), running with defaults and no persistence");
            NvsAdapter::default()
        }
    };
    let config = match ConfigPort::load(&nvs) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!("config load failed ({e}), using defaults");
            SystemConfig::default()
        }
    };

    // ── 3. Shared state ───────────────────────────────────────
    let hub = Arc::new(DeviceHub::new());
    let broker = Arc::new(EventBroker::new());
    install_log_sink(&broker);

    let clock = SystemClock::new();
    let base_mac = device_id::read_base_mac();
    info!(
        "base MAC {:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        base_mac[0], base_mac[1], base_mac[2], base_mac[3], base_mac[4], base_mac[5]
    );

    // ── 4. Hardware ports ─────────────────────────────────────
    #[cfg(target_os = "espidf")]
    let (bridge_port, pwm_backend, load_cell) = (
        kibblet::drivers::uart::UartBridgePort::new(),
        kibblet::drivers::pwm::Pca9685Backend::new(0),
        kibblet::scale::hx711::Hx711Driver::new(),
    );

    #[cfg(not(target_os = "espidf"))]
    let (bridge_port, pwm_backend, load_cell) = (
        kibblet::drivers::uart::SilentBridgePort,
        kibblet::drivers::pwm::MemoryPwmBackend::new(),
        kibblet::scale::hx711::SimLoadCell::unresponsive(),
    );

    run(
        bridge_port,
        pwm_backend,
        load_cell,
        nvs,
        config,
        hub,
        broker,
        clock,
        base_mac,
    )
}

/// Construct the subsystems and spin the control loop forever.
#[allow(clippy::too_many_arguments)]
fn run<P, B, L>(
    bridge_port: P,
    pwm_backend: B,
    load_cell: L,
    nvs: NvsAdapter,
    config: SystemConfig,
    hub: Arc<DeviceHub>,
    broker: Arc<EventBroker>,
    clock: SystemClock,
    base_mac: [u8; 6],
) -> Result<()>
where
    P: BridgePort,
    B: PwmBackend,
    L: LoadCellPort,
{
    // ── 5. Tank registry ──────────────────────────────────────
    let client = BridgeClient::new(bridge_port, clock.clone());
    let pwm = PwmDriver::new(pwm_backend, clock.clone());
    let mut registry = TankRegistry::new(
        client,
        pwm,
        clock.clone(),
        hub.clone(),
        broker.clone(),
        base_mac,
        config.hopper_closed_us,
        config.hopper_open_us,
    );
    registry.begin();
    let registry = SharedRegistry::new(registry);

    // ── 6. Scale sampler ──────────────────────────────────────
    let sampler = ScaleSampler::new(load_cell, clock.clone(), NvsAdapter::default());
    let scale = SharedScale::new(sampler);

    // ── 7. Recipes, engine, dispatcher, safety ────────────────
    let mut store = RecipeStore::new(recipe_paths(), nvs);
    let loaded = store.load();
    info!("loaded {loaded} recipe(s)");

    let engine = DispensingEngine::new(
        clock.clone(),
        hub.clone(),
        broker.clone(),
        config.hopper_closed_us,
        config.hopper_open_us,
        config.dispense_weight_change_threshold_g,
        config.dispense_no_change_timeout_ms,
    );
    let mut dispatcher = FeedDispatcher::new(
        clock.clone(),
        hub.clone(),
        broker.clone(),
        engine,
        store,
    );
    let mut safety = SafetySupervisor::new(clock.clone(), hub.clone(), broker.clone(), &config);

    let mut safety_servo = registry.clone();
    let mut feed_hw = registry.clone();
    let mut feed_scale = scale.clone();

    info!("System ready. Entering control loop.");

    // ── 8. Control loop ───────────────────────────────────────
    loop {
        scale.tick(&hub, &broker);
        safety.tick(&mut safety_servo);
        dispatcher.tick(&mut feed_hw, &mut feed_scale);
        registry.scanner_tick();
        clock.delay_ms(5);
    }
}

/// Recipe replica locations.
fn recipe_paths() -> [PathBuf; 3] {
    #[cfg(target_os = "espidf")]
    let base = PathBuf::from("/spiffs");
    #[cfg(not(target_os = "espidf"))]
    let base = std::env::temp_dir().join("kibblet");
    #[cfg(not(target_os = "espidf"))]
    let _ = std::fs::create_dir_all(&base);

    [
        base.join("recipes.json"),
        base.join("recipes.bak1.json"),
        base.join("recipes.bak2.json"),
    ]
}

/// Mirror every push topic onto the serial log until the network
/// collaborators subscribe for real.
fn install_log_sink(broker: &EventBroker) {
    for topic in [
        Topic::TanksChanged,
        Topic::StatusChanged,
        Topic::FeedingProgress,
        Topic::FeedingComplete,
        Topic::Error,
    ] {
        broker.subscribe(topic, move |payload: &EventPayload| {
            log::debug!("event [{}]: {payload:?}", topic.as_str());
        });
    }
}
