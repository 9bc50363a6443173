//! Registry reconciliation against the simulated bridge MCU.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use kibblet::adapters::time::SimClock;
use kibblet::bridge::BridgeClient;
use kibblet::drivers::pwm::{MemoryPwmBackend, PwmDriver};
use kibblet::error::Error;
use kibblet::events::{EventBroker, Topic};
use kibblet::hub::DeviceHub;
use kibblet::tank::record::{TankRecord, RECORD_DATA_SIZE, RECORD_SIZE};
use kibblet::tank::{RecordFec, TankInfo, TankRegistry};

use crate::mock_hw::{BridgeSim, BridgeSimHandle};

const BASE_MAC: [u8; 6] = [0x10, 0x20, 0x30, 0x40, 0x50, 0x60];
const UID_A: u64 = 0x00A1_B2C3_D4E5_F6F7;
const UID_B: u64 = 0x0011_2233_4455_6677;

struct Rig {
    registry: TankRegistry<BridgeSim, MemoryPwmBackend, SimClock>,
    bridge: BridgeSimHandle,
    hub: Arc<DeviceHub>,
    clock: SimClock,
    tanks_changed: Arc<AtomicUsize>,
}

fn rig() -> Rig {
    let clock = SimClock::new();
    let (port, bridge) = BridgeSim::new();
    let hub = Arc::new(DeviceHub::new());
    let broker = Arc::new(EventBroker::new());

    let tanks_changed = Arc::new(AtomicUsize::new(0));
    let counter = tanks_changed.clone();
    broker.subscribe(Topic::TanksChanged, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let client = BridgeClient::new(port, clock.clone());
    let pwm = PwmDriver::new(MemoryPwmBackend::new(), clock.clone());
    let registry = TankRegistry::new(
        client,
        pwm,
        clock.clone(),
        hub.clone(),
        broker,
        BASE_MAC,
        1000,
        2000,
    );
    Rig {
        registry,
        bridge,
        hub,
        clock,
        tanks_changed,
    }
}

fn valid_record(name: &str) -> [u8; RECORD_SIZE] {
    let record = TankRecord {
        last_base_mac: [0; 6],
        last_bus_index: 0xFF,
        capacity_ml: 2000,
        density_g_per_l: 500,
        servo_idle_us: 1500,
        remaining_grams: 750,
        name: name.to_string(),
    };
    record.to_bytes(&RecordFec::new())
}

/// A record whose FEC decodes cleanly but whose name_length field is
/// structurally absurd.
fn out_of_bounds_record() -> [u8; RECORD_SIZE] {
    let mut bytes = valid_record("Ghost");
    let mut data = [0u8; RECORD_DATA_SIZE];
    data.copy_from_slice(&bytes[..RECORD_DATA_SIZE]);
    data[7] = 0xFF; // name_length
    let ecc = RecordFec::new().encode(&data);
    bytes[..RECORD_DATA_SIZE].copy_from_slice(&data);
    bytes[RECORD_DATA_SIZE..].copy_from_slice(&ecc);
    bytes
}

fn let_scanner_run(rig: &mut Rig) {
    rig.clock.advance_ms(1100);
    rig.registry.scanner_tick();
}

// ── Cold boot ─────────────────────────────────────────────────

#[test]
fn cold_boot_with_empty_bus() {
    let mut rig = rig();
    rig.registry.begin();

    assert!(rig.registry.known_tanks().is_empty());
    rig.hub
        .with_state(|s| assert!(s.connected_tanks.is_empty()))
        .unwrap();

    // No delta versus the initial empty snapshot — no event.
    let_scanner_run(&mut rig);
    assert_eq!(rig.tanks_changed.load(Ordering::SeqCst), 0);
}

// ── Hot plug ──────────────────────────────────────────────────

#[test]
fn hot_plug_reads_record_and_fires_event() {
    let mut rig = rig();
    rig.registry.begin();

    rig.bridge
        .lock()
        .place_tank(2, UID_A, valid_record("Salmon"));
    let_scanner_run(&mut rig);

    assert_eq!(rig.tanks_changed.load(Ordering::SeqCst), 1);
    let tanks = rig.registry.known_tanks();
    assert_eq!(tanks.len(), 1);
    assert_eq!(tanks[0].uid, UID_A);
    assert_eq!(tanks[0].bus_index, 2);
    assert_eq!(tanks[0].name, "Salmon");
    assert!(tanks[0].full_info);
    assert_eq!(tanks[0].capacity_l, 2.0);
    assert_eq!(tanks[0].density_kg_per_l, 0.5);
    assert_eq!(tanks[0].remaining_weight_g, 750.0);

    rig.hub
        .with_state(|s| assert_eq!(s.connected_tanks.len(), 1))
        .unwrap();
}

#[test]
fn hot_plug_with_out_of_bounds_record_formats_default() {
    let mut rig = rig();
    rig.registry.begin();

    rig.bridge.lock().place_tank(3, UID_A, out_of_bounds_record());
    let_scanner_run(&mut rig);

    assert_eq!(rig.tanks_changed.load(Ordering::SeqCst), 1);
    let tanks = rig.registry.known_tanks();
    assert_eq!(tanks.len(), 1);
    assert_eq!(tanks[0].name, "New Tank");
    assert_eq!(tanks[0].servo_idle_us, 1500);
    assert_eq!(tanks[0].capacity_l, 0.0);
    assert_eq!(tanks[0].density_kg_per_l, 0.0);
    assert_eq!(tanks[0].remaining_weight_g, 0.0);

    // The EEPROM itself must have been rewritten with a valid default.
    let eeprom = rig.bridge.lock().eeprom(3).unwrap();
    let (record, corrected) = TankRecord::from_bytes(&eeprom, &RecordFec::new()).unwrap();
    assert_eq!(corrected, 0);
    assert_eq!(record.name, "New Tank");
}

#[test]
fn hot_plug_with_shredded_record_formats_default() {
    let mut rig = rig();
    rig.registry.begin();

    let mut garbage = [0u8; RECORD_SIZE];
    for (i, b) in garbage.iter_mut().enumerate() {
        *b = (i as u8).wrapping_mul(101).wrapping_add(13);
    }
    rig.bridge.lock().place_tank(0, UID_A, garbage);
    let_scanner_run(&mut rig);

    let tanks = rig.registry.known_tanks();
    assert_eq!(tanks.len(), 1);
    assert_eq!(tanks[0].name, "New Tank");
}

#[test]
fn failed_default_rewrite_keeps_tank_visible() {
    let mut rig = rig();
    rig.registry.begin();

    {
        let mut bridge = rig.bridge.lock();
        bridge.place_tank(1, UID_A, out_of_bounds_record());
        bridge.fail_writes = true;
    }
    let_scanner_run(&mut rig);

    // The rewrite timed out, but the user must still see the tank.
    let tanks = rig.registry.known_tanks();
    assert_eq!(tanks.len(), 1);
    assert_eq!(tanks[0].name, "New Tank");
}

// ── Detach ────────────────────────────────────────────────────

#[test]
fn unplugged_tank_is_removed() {
    let mut rig = rig();
    rig.bridge.lock().place_tank(4, UID_A, valid_record("Tuna"));
    rig.registry.begin();
    assert_eq!(rig.registry.known_tanks().len(), 1);

    rig.bridge.lock().remove_tank(4);
    let_scanner_run(&mut rig);

    assert!(rig.registry.known_tanks().is_empty());
    assert_eq!(rig.tanks_changed.load(Ordering::SeqCst), 1);
    rig.hub
        .with_state(|s| assert!(s.connected_tanks.is_empty()))
        .unwrap();
}

#[test]
fn tank_moving_between_buses_keeps_one_entry() {
    let mut rig = rig();
    rig.bridge.lock().place_tank(0, UID_A, valid_record("Tuna"));
    rig.registry.begin();

    {
        let mut bridge = rig.bridge.lock();
        let record = bridge.eeprom(0).unwrap();
        bridge.remove_tank(0);
        bridge.place_tank(5, UID_A, record);
    }
    let_scanner_run(&mut rig);

    let tanks = rig.registry.known_tanks();
    assert_eq!(tanks.len(), 1);
    assert_eq!(tanks[0].bus_index, 5);
}

// ── Uniqueness (per uid and per bus) ──────────────────────────

#[test]
fn registry_never_duplicates_uids_or_buses() {
    let mut rig = rig();
    {
        let mut bridge = rig.bridge.lock();
        bridge.place_tank(0, UID_A, valid_record("Alpha"));
        bridge.place_tank(1, UID_B, valid_record("Bravo"));
        // A cloned UID showing up on a second bus must not create a
        // second logical tank.
        bridge.place_tank(2, UID_A, valid_record("Alpha"));
    }
    rig.registry.begin();

    let tanks = rig.registry.known_tanks();
    let mut uids: Vec<u64> = tanks.iter().map(|t| t.uid).collect();
    uids.sort_unstable();
    uids.dedup();
    assert_eq!(uids.len(), tanks.len(), "duplicate uid in registry");

    let mut buses: Vec<i8> = tanks.iter().filter(|t| t.bus_index >= 0).map(|t| t.bus_index).collect();
    buses.sort_unstable();
    buses.dedup();
    assert_eq!(buses.len(), tanks.len(), "duplicate bus index in registry");
}

// ── Commit ────────────────────────────────────────────────────

#[test]
fn commit_writes_changed_fields_and_base_mac() {
    let mut rig = rig();
    rig.bridge.lock().place_tank(1, UID_A, valid_record("Old Name"));
    rig.registry.begin();

    let mut tank = rig.registry.known_tanks()[0].clone();
    tank.name = "Chicken Mix".to_string();
    tank.capacity_l = 1.5;
    tank.remaining_weight_g = 300.0;

    let changed = rig.registry.commit(&tank).unwrap();
    assert!(!changed.is_empty());

    let eeprom = rig.bridge.lock().eeprom(1).unwrap();
    let (record, _) = TankRecord::from_bytes(&eeprom, &RecordFec::new()).unwrap();
    assert_eq!(record.name, "Chicken Mix");
    assert_eq!(record.capacity_ml, 1500);
    assert_eq!(record.remaining_grams, 300);
    assert_eq!(record.last_base_mac, BASE_MAC);
    assert_eq!(record.last_bus_index, 1);

    // A second identical commit finds nothing to write.
    let mut again = rig.registry.known_tanks()[0].clone();
    again.last_base_mac = BASE_MAC;
    let second = rig.registry.commit(&again).unwrap();
    assert!(second.is_empty(), "second commit reported {second}");
}

#[test]
fn commit_unknown_tank_fails() {
    let mut rig = rig();
    rig.registry.begin();
    let mut tank = TankInfo::presence_witness(0xDEAD, 0);
    tank.full_info = true;
    assert!(matches!(
        rig.registry.commit(&tank),
        Err(Error::TankNotFound)
    ));
}

// ── Remaining-mass update ─────────────────────────────────────

#[test]
fn update_remaining_grams_rewrites_record() {
    let mut rig = rig();
    rig.bridge.lock().place_tank(2, UID_A, valid_record("Tuna"));
    rig.registry.begin();

    rig.registry.update_remaining_grams(UID_A, 412.4).unwrap();

    assert_eq!(rig.registry.known_tanks()[0].remaining_weight_g, 412.4);
    let eeprom = rig.bridge.lock().eeprom(2).unwrap();
    let (record, _) = TankRecord::from_bytes(&eeprom, &RecordFec::new()).unwrap();
    assert_eq!(record.remaining_grams, 412);
}

// ── Refresh tank info ─────────────────────────────────────────

#[test]
fn refresh_tank_info_rereads_the_record() {
    let mut rig = rig();
    rig.bridge.lock().place_tank(0, UID_A, valid_record("Before"));
    rig.registry.begin();

    // Mutate the EEPROM behind the registry's back.
    rig.bridge.lock().place_tank(0, UID_A, valid_record("After"));

    let mut info = TankInfo::presence_witness(UID_A, 0);
    rig.registry.refresh_tank_info(&mut info).unwrap();
    assert_eq!(info.name, "After");
    assert!(info.full_info);
}

// ── Servo-mode discipline ─────────────────────────────────────

#[test]
fn bus_traffic_is_refused_in_servo_mode() {
    let mut rig = rig();
    rig.bridge.lock().place_tank(0, UID_A, valid_record("Tuna"));
    rig.registry.begin();

    rig.registry.set_servo_power(true);
    assert!(matches!(
        rig.registry.refresh(0x3F),
        Err(Error::ServoModeActive)
    ));
    assert!(rig.registry.bus_of_tank(UID_A).is_none());

    // Back in bus-power mode everything works again.
    rig.registry.set_servo_power(false);
    assert_eq!(rig.registry.bus_of_tank(UID_A), Some(0));
}

#[test]
fn stop_all_servos_lands_in_bus_power_mode() {
    let mut rig = rig();
    rig.registry.begin();
    rig.registry.set_servo_power(true);
    rig.registry.stop_all_servos();

    assert!(!rig.registry.is_servo_mode());
    assert!(!rig.registry.pwm_backend().power_gate_on);
}
