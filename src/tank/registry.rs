//! Tank registry — reconciliation between physical presences and the
//! logical set of known tanks.
//!
//! The registry is the sole owner of the [`TankInfo`] list; the
//! device-state hub holds a value-copied mirror refreshed in a
//! deliberate publish step after every mutation. It also owns the PWM
//! driver and therefore the servo/bus-power mode discipline: EEPROM
//! traffic is only possible in bus-power mode, servo motion only in
//! servo mode.
//!
//! Reconciliation on `refresh`:
//! - **Scan** — roll-call (or per-bus UID reads for a partial mask);
//!   all-ones sentinels are normalized to zero by the bridge client.
//! - **Detach** — a known tank whose scanned bus now reports a
//!   different UID is logically detached (`bus_index = -1`).
//! - **Attach / integrity** — every occupied scanned bus either updates
//!   a known tank's position or creates a presence witness; witnesses
//!   get their record read and validated. A record failing FEC decode
//!   or structural bounds is rewritten with the factory default, and a
//!   failed rewrite still leaves the tank visible as "New Tank".
//! - **Collect** — tanks left detached are dropped.
//! - **Publish** — the hub mirror is replaced under the hub lock.

use std::sync::Arc;

use log::{error, info, warn};
use parking_lot::Mutex;

use crate::adapters::time::Clock;
use crate::bridge::client::{
    GETUID_TIMEOUT_MS, READ_TIMEOUT_MS, ROLLCALL_TIMEOUT_MS, WRITE_TIMEOUT_MS,
};
use crate::bridge::{BridgeClient, BridgePort};
use crate::drivers::pwm::{PwmBackend, PwmDriver, PwmMode};
use crate::error::{Error, Result};
use crate::events::{EventBroker, EventPayload};
use crate::hub::DeviceHub;
use crate::pins::{HOPPER_SERVO_CHANNEL, NUMBER_OF_BUSES, TOTAL_SERVO_COUNT};
use crate::ports::{ServoPort, TankLookupPort};
use crate::tank::record::{TankRecord, RECORD_SIZE};
use crate::tank::{Discrepancies, RecordFec, TankInfo};

/// Continuous-rotation servo pulse map.
pub const SERVO_STOP_US: u16 = 1500;
pub const SERVO_FULL_FWD_US: u16 = 2000;
pub const SERVO_FULL_REV_US: u16 = 1000;

/// Scanner cadence.
const SCAN_INTERVAL_MS: u64 = 1000;
const SCAN_BACKOFF_MS: u64 = 3000;

/// EEPROM read attempts before giving up on a bus.
const READ_RETRIES: usize = 3;

const ALL_BUSES_MASK: u16 = (1 << NUMBER_OF_BUSES) - 1;

/// Map a continuous-rotation speed in [-1, 1] to its pulse width.
/// |speed| < 0.01 is the dead zone and maps to the stop pulse.
pub fn continuous_servo_us(speed: f32) -> u16 {
    let speed = speed.clamp(-1.0, 1.0);
    if speed.abs() < 0.01 {
        SERVO_STOP_US
    } else if speed > 0.0 {
        SERVO_STOP_US + (speed * (SERVO_FULL_FWD_US - SERVO_STOP_US) as f32) as u16
    } else {
        SERVO_STOP_US - ((-speed) * (SERVO_STOP_US - SERVO_FULL_REV_US) as f32) as u16
    }
}

pub struct TankRegistry<P: BridgePort, B: PwmBackend, C: Clock> {
    client: BridgeClient<P, C>,
    pwm: PwmDriver<B, C>,
    clock: C,
    fec: RecordFec,
    hub: Arc<DeviceHub>,
    broker: Arc<EventBroker>,

    known_tanks: Vec<TankInfo>,
    /// This host's 48-bit identifier, stamped on every commit.
    base_mac: [u8; 6],

    hopper_open_us: u16,
    hopper_closed_us: u16,

    // Scanner bookkeeping
    last_seen_uids: [u64; NUMBER_OF_BUSES],
    next_scan_ms: u64,
}

impl<P: BridgePort, B: PwmBackend, C: Clock> TankRegistry<P, B, C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: BridgeClient<P, C>,
        pwm: PwmDriver<B, C>,
        clock: C,
        hub: Arc<DeviceHub>,
        broker: Arc<EventBroker>,
        base_mac: [u8; 6],
        hopper_closed_us: u16,
        hopper_open_us: u16,
    ) -> Self {
        Self {
            client,
            pwm,
            clock,
            fec: RecordFec::new(),
            hub,
            broker,
            known_tanks: Vec::new(),
            base_mac,
            hopper_open_us,
            hopper_closed_us,
            last_seen_uids: [0; NUMBER_OF_BUSES],
            next_scan_ms: 0,
        }
    }

    /// Initial scan; does not fire the tanks-changed event.
    pub fn begin(&mut self) {
        info!("registry: initial scan");
        if let Err(e) = self.refresh(ALL_BUSES_MASK) {
            warn!("registry: initial scan failed ({e})");
        }
        self.last_seen_uids = self.snapshot_uids();
    }

    pub fn is_servo_mode(&self) -> bool {
        self.pwm.mode() == PwmMode::Servo
    }

    pub fn known_tanks(&self) -> &[TankInfo] {
        &self.known_tanks
    }

    pub fn hopper_open_us(&self) -> u16 {
        self.hopper_open_us
    }

    pub fn hopper_closed_us(&self) -> u16 {
        self.hopper_closed_us
    }

    // ── Reconciliation ────────────────────────────────────────

    /// Refresh presence and records on the buses selected by `mask`
    /// (full mask = all buses). Only callable in bus-power mode.
    pub fn refresh(&mut self, mask: u16) -> Result<bool> {
        self.reconcile(mask & ALL_BUSES_MASK, true)
    }

    /// Shared body of `refresh` and the presence-only paths.
    fn reconcile(&mut self, mask: u16, read_records: bool) -> Result<bool> {
        if mask == 0 {
            return Ok(false);
        }
        if self.is_servo_mode() {
            warn!("registry: cannot refresh tank presence while in servo mode");
            return Err(Error::ServoModeActive);
        }

        // Phase A — scan.
        let mut found = [0u64; NUMBER_OF_BUSES];
        if mask == ALL_BUSES_MASK {
            found = self.client.roll_call(ROLLCALL_TIMEOUT_MS)?;
        } else {
            for bus in 0..NUMBER_OF_BUSES {
                if mask & (1 << bus) != 0 {
                    found[bus] = self.client.get_uid(bus as u8, GETUID_TIMEOUT_MS)?;
                }
            }
        }

        // Phase B — detach known tanks whose scanned bus changed hands.
        for tank in self.known_tanks.iter_mut() {
            let bus = tank.bus_index;
            if bus >= 0 && mask & (1 << bus) != 0 && found[bus as usize] != tank.uid {
                info!(
                    "registry: tank {:#018x} no longer on bus {bus}",
                    tank.uid
                );
                tank.bus_index = -1;
            }
        }

        // Phase C — attach, create, and validate records.
        for bus in 0..NUMBER_OF_BUSES {
            if mask & (1 << bus) == 0 || found[bus] == 0 {
                continue;
            }
            let uid = found[bus];

            let index = match self.known_tanks.iter().position(|t| t.uid == uid) {
                Some(i) => {
                    self.known_tanks[i].bus_index = bus as i8;
                    i
                }
                None => {
                    info!("registry: new tank {uid:#018x} detected on bus {bus}");
                    self.known_tanks
                        .push(TankInfo::presence_witness(uid, bus as u8));
                    self.known_tanks.len() - 1
                }
            };

            if read_records && !self.known_tanks[index].full_info {
                match self.read_validated_record(bus as u8) {
                    Ok(record) => self.known_tanks[index].fill_from_record(&record),
                    Err(e) => {
                        error!(
                            "registry: could not read record of tank {uid:#018x} on bus {bus} ({e})"
                        );
                        // An unreadable brand-new tank carries no usable
                        // state; drop the witness and retry next scan.
                        self.known_tanks.remove(index);
                    }
                }
            }
        }

        // Phase D — collect detached tanks.
        self.known_tanks.retain(|t| {
            if t.bus_index < 0 {
                info!("registry: removing tank {:#018x}", t.uid);
                false
            } else {
                true
            }
        });

        // Phase E — publish the mirror.
        let changed = self.publish_tanks()?;
        Ok(changed)
    }

    /// Read a bus's record; on integrity failure rewrite the factory
    /// default and report that instead. A failed rewrite is not fatal —
    /// the tank stays visible as "New Tank" so the user can intervene.
    fn read_validated_record(&mut self, bus: u8) -> Result<TankRecord> {
        let mut bytes = [0u8; RECORD_SIZE];
        let mut last_err = Error::Bridge(crate::error::BridgeError::Timeout);
        for _ in 0..READ_RETRIES {
            match self.client.read(bus, 0, &mut bytes, READ_TIMEOUT_MS) {
                Ok(_) => {
                    return match TankRecord::from_bytes(&bytes, &self.fec) {
                        Ok((record, corrected)) => {
                            if corrected > 0 {
                                warn!(
                                    "registry: corrected {corrected} byte(s) in record on bus {bus}"
                                );
                            }
                            Ok(record)
                        }
                        Err(e) => {
                            warn!(
                                "registry: invalid record on bus {bus} ({e}); formatting"
                            );
                            let default = TankRecord::factory_default();
                            if let Err(write_err) = self.write_record(bus, &default) {
                                error!(
                                    "registry: default-record rewrite failed on bus {bus} ({write_err})"
                                );
                            }
                            Ok(default)
                        }
                    };
                }
                Err(e) => last_err = Error::Bridge(e),
            }
        }
        Err(last_err)
    }

    fn write_record(&mut self, bus: u8, record: &TankRecord) -> Result<()> {
        let bytes = record.to_bytes(&self.fec);
        self.client
            .write(bus, 0, &bytes, WRITE_TIMEOUT_MS)
            .map_err(Error::Bridge)
    }

    /// Replace the hub's connected-tanks mirror. Returns whether the
    /// population (uid/bus pairs) changed.
    fn publish_tanks(&self) -> Result<bool> {
        let tanks = self.known_tanks.clone();
        self.hub.with_state(move |state| {
            let changed = state.connected_tanks.len() != tanks.len()
                || state
                    .connected_tanks
                    .iter()
                    .zip(tanks.iter())
                    .any(|(a, b)| a.uid != b.uid || a.bus_index != b.bus_index);
            state.connected_tanks = tanks;
            changed
        })
    }

    // ── Queries & commits ─────────────────────────────────────

    /// Bus index of `uid`, refreshing presence first.
    pub fn bus_of_tank(&mut self, uid: u64) -> Option<u8> {
        if self.is_servo_mode() {
            error!("registry: bus_of_tank called while in servo mode");
            return None;
        }
        if let Err(e) = self.reconcile(ALL_BUSES_MASK, false) {
            warn!("registry: presence refresh failed ({e})");
            return None;
        }
        self.known_tanks
            .iter()
            .find(|t| t.uid == uid && t.bus_index >= 0)
            .map(|t| t.bus_index as u8)
    }

    /// Commit a tank's fields to its EEPROM. Only fields that differ are
    /// counted; the whole record (with fresh parity and this host's MAC)
    /// is written whenever anything differs.
    pub fn commit(&mut self, tank_info: &TankInfo) -> Result<Discrepancies> {
        if self.is_servo_mode() {
            return Err(Error::ServoModeActive);
        }
        let bus = self.bus_of_tank(tank_info.uid).ok_or(Error::TankNotFound)?;

        let mut bytes = [0u8; RECORD_SIZE];
        self.client
            .read(bus, 0, &mut bytes, READ_TIMEOUT_MS)
            .map_err(Error::Bridge)?;
        let mut record = match TankRecord::from_bytes(&bytes, &self.fec) {
            Ok((record, _)) => record,
            // A corrupt baseline means every field differs anyway.
            Err(_) => TankRecord::factory_default(),
        };

        let mut updated = tank_info.clone();
        updated.bus_index = bus as i8;
        updated.last_base_mac = self.base_mac;
        let changed = updated.overlay_record(&mut record);

        if changed.is_empty() {
            info!("registry: no changes to commit for tank {:#018x}", tank_info.uid);
            return Ok(changed);
        }

        info!(
            "registry: committing [{changed}] to tank {:#018x} on bus {bus}",
            tank_info.uid
        );
        self.write_record(bus, &record)?;

        if let Some(local) = self.known_tanks.iter_mut().find(|t| t.uid == tank_info.uid) {
            local.fill_from_record(&record);
            local.bus_index = bus as i8;
        }
        self.publish_tanks()?;
        Ok(changed)
    }

    /// Re-read a tank's record into `tank_info` (located by uid).
    pub fn refresh_tank_info(&mut self, tank_info: &mut TankInfo) -> Result<()> {
        if self.is_servo_mode() {
            return Err(Error::ServoModeActive);
        }
        if tank_info.uid == 0 {
            return Err(Error::Config("tank uid must be provided"));
        }
        let bus = self.bus_of_tank(tank_info.uid).ok_or(Error::TankNotFound)?;

        let mut bytes = [0u8; RECORD_SIZE];
        self.client
            .read(bus, 0, &mut bytes, READ_TIMEOUT_MS)
            .map_err(Error::Bridge)?;
        let (record, _) =
            TankRecord::from_bytes(&bytes, &self.fec).map_err(Error::Record)?;
        tank_info.fill_from_record(&record);
        tank_info.bus_index = bus as i8;
        Ok(())
    }

    /// Write a fresh remaining-mass figure in one read-modify-write
    /// transaction, recomputing parity over the full record.
    pub fn update_remaining_grams(&mut self, uid: u64, grams: f32) -> Result<()> {
        if self.is_servo_mode() {
            return Err(Error::ServoModeActive);
        }
        let bus = self.bus_of_tank(uid).ok_or(Error::TankNotFound)?;

        if let Some(tank) = self.known_tanks.iter_mut().find(|t| t.uid == uid) {
            tank.remaining_weight_g = grams.max(0.0);
        }

        let mut bytes = [0u8; RECORD_SIZE];
        self.client
            .read(bus, 0, &mut bytes, READ_TIMEOUT_MS)
            .map_err(Error::Bridge)?;
        let mut record = match TankRecord::from_bytes(&bytes, &self.fec) {
            Ok((record, _)) => record,
            Err(_) => TankRecord::factory_default(),
        };
        record.remaining_grams = grams.round().clamp(0.0, u16::MAX as f32) as u16;
        self.write_record(bus, &record)?;
        self.publish_tanks()?;
        info!("registry: remaining mass of {uid:#018x} set to {grams:.0} g");
        Ok(())
    }

    /// Write the factory-default record onto a bus (maintenance path and
    /// corrupted-record repair).
    pub fn format_tank(&mut self, bus: u8) -> Result<()> {
        if self.is_servo_mode() {
            return Err(Error::ServoModeActive);
        }
        self.write_record(bus, &TankRecord::factory_default())
    }

    // ── Background scanner ────────────────────────────────────

    /// Poll for presence deltas. Runs every 1000 ms (3000 ms right
    /// after a change); yields while in servo mode.
    pub fn scanner_tick(&mut self) {
        let now = self.clock.now_ms();
        if now < self.next_scan_ms || self.is_servo_mode() {
            return;
        }
        self.next_scan_ms = now + SCAN_INTERVAL_MS;

        let found = match self.client.roll_call(ROLLCALL_TIMEOUT_MS) {
            Ok(found) => found,
            Err(e) => {
                warn!("registry: scanner roll call failed ({e})");
                return;
            }
        };

        let mut changed_mask = 0u16;
        for bus in 0..NUMBER_OF_BUSES {
            if found[bus] != self.last_seen_uids[bus] {
                changed_mask |= 1 << bus;
            }
        }
        self.last_seen_uids = found;

        if changed_mask != 0 {
            info!("registry: presence delta on mask {changed_mask:#08b}");
            match self.refresh(changed_mask) {
                Ok(_) => self.broker.publish(EventPayload::TanksChanged),
                Err(e) => warn!("registry: delta refresh failed ({e})"),
            }
            self.next_scan_ms = now + SCAN_BACKOFF_MS;
        }
    }

    fn snapshot_uids(&self) -> [u64; NUMBER_OF_BUSES] {
        let mut uids = [0u64; NUMBER_OF_BUSES];
        for tank in &self.known_tanks {
            if tank.bus_index >= 0 {
                uids[tank.bus_index as usize] = tank.uid;
            }
        }
        uids
    }

    // ── Servo control ─────────────────────────────────────────

    /// Switch between servo power (servo role) and bus power.
    pub fn set_servo_power(&mut self, on: bool) {
        if on {
            let idle: Vec<(u8, u16)> = self
                .known_tanks
                .iter()
                .filter(|t| t.bus_index >= 0)
                .map(|t| (t.bus_index as u8, t.servo_idle_us))
                .collect();
            self.pwm.enter_servo_mode(&idle);
        } else {
            self.pwm.enter_bus_power_mode();
        }
        let _ = self.hub.with_state(|state| state.servo_power = on);
        info!("registry: servo power {}", if on { "ON" } else { "OFF" });
    }

    fn ensure_servo_mode(&mut self) {
        if !self.is_servo_mode() {
            info!("registry: switching to servo mode for motion");
            self.set_servo_power(true);
        }
    }

    /// Continuous-rotation mapping with a dead zone at |speed| < 0.01.
    pub fn set_continuous_servo(&mut self, channel: u8, speed: f32) {
        self.ensure_servo_mode();
        self.pwm
            .set_microseconds(channel, continuous_servo_us(speed));
    }

    pub fn set_servo_us(&mut self, channel: u8, us: u16) {
        self.ensure_servo_mode();
        self.pwm.set_microseconds(channel, us);
    }

    pub fn open_hopper(&mut self) {
        let us = self.hopper_open_us;
        self.set_servo_us(HOPPER_SERVO_CHANNEL, us);
    }

    pub fn close_hopper(&mut self) {
        let us = self.hopper_closed_us;
        self.set_servo_us(HOPPER_SERVO_CHANNEL, us);
    }

    /// Neutral on every channel, a beat for motion to cease, then power
    /// off and back to bus mode.
    pub fn stop_all_servos(&mut self) {
        self.ensure_servo_mode();
        for channel in 0..TOTAL_SERVO_COUNT as u8 {
            self.pwm.set_microseconds(channel, SERVO_STOP_US);
        }
        self.clock.delay_ms(100);
        self.set_servo_power(false);
        warn!("registry: all servos stopped and powered off");
    }

    /// Backend access for diagnostics and tests.
    pub fn pwm_backend(&self) -> &B {
        self.pwm.backend()
    }
}

// ---------------------------------------------------------------------------
// Shared handle — the bridge lock
// ---------------------------------------------------------------------------

/// Clonable handle serializing all registry access (bus-bridge traffic
/// and mode switches) behind one lock.
pub struct SharedRegistry<P: BridgePort, B: PwmBackend, C: Clock> {
    inner: Arc<Mutex<TankRegistry<P, B, C>>>,
}

impl<P: BridgePort, B: PwmBackend, C: Clock> SharedRegistry<P, B, C> {
    pub fn new(registry: TankRegistry<P, B, C>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(registry)),
        }
    }

    pub fn with_registry<T>(&self, f: impl FnOnce(&mut TankRegistry<P, B, C>) -> T) -> T {
        f(&mut self.inner.lock())
    }

    pub fn scanner_tick(&self) {
        self.inner.lock().scanner_tick();
    }
}

impl<P: BridgePort, B: PwmBackend, C: Clock> Clone for SharedRegistry<P, B, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: BridgePort, B: PwmBackend, C: Clock> ServoPort for SharedRegistry<P, B, C> {
    fn set_servo_power(&mut self, on: bool) {
        self.inner.lock().set_servo_power(on);
    }

    fn set_continuous_servo(&mut self, channel: u8, speed: f32) {
        self.inner.lock().set_continuous_servo(channel, speed);
    }

    fn set_servo_us(&mut self, channel: u8, us: u16) {
        self.inner.lock().set_servo_us(channel, us);
    }

    fn open_hopper(&mut self) {
        self.inner.lock().open_hopper();
    }

    fn close_hopper(&mut self) {
        self.inner.lock().close_hopper();
    }

    fn stop_all_servos(&mut self) {
        self.inner.lock().stop_all_servos();
    }
}

impl<P: BridgePort, B: PwmBackend, C: Clock> TankLookupPort for SharedRegistry<P, B, C> {
    fn bus_of_tank(&mut self, uid: u64) -> Option<u8> {
        self.inner.lock().bus_of_tank(uid)
    }

    fn density_g_per_l(&self, uid: u64) -> Option<f32> {
        self.inner
            .lock()
            .known_tanks()
            .iter()
            .find(|t| t.uid == uid && t.full_info)
            .map(|t| t.density_kg_per_l * 1000.0)
    }

    fn remaining_grams(&self, uid: u64) -> Option<f32> {
        self.inner
            .lock()
            .known_tanks()
            .iter()
            .find(|t| t.uid == uid && t.full_info)
            .map(|t| t.remaining_weight_g)
    }

    fn update_remaining_grams(&mut self, uid: u64, grams: f32) -> Result<()> {
        self.inner.lock().update_remaining_grams(uid, grams)
    }
}
