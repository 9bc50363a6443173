//! Mock hardware for integration tests.
//!
//! Two layers of fakery:
//!
//! - [`BridgeSim`] — a behavioural model of the 1-Wire bridge MCU. It
//!   decodes real request frames and answers with real response frames,
//!   so registry tests exercise the production frame codec and client.
//! - [`MockFeedHw`] / [`MockScale`] — a shared kinematic model of the
//!   dispenser for engine and dispatcher tests: augers add weight while
//!   spinning, the closing hopper can pinch a kibble, tanks can run
//!   dry.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use kibblet::adapters::time::{Clock, SimClock};
use kibblet::bridge::frame::{encode_frame, FrameDecoder, Opcode, MAX_FRAME_SIZE};
use kibblet::bridge::BridgePort;
use kibblet::error::Result;
use kibblet::ports::{ScalePort, ServoPort, StorageError, StoragePort, TankLookupPort};

pub const NUM_BUSES: usize = 6;

// ═══════════════════════════════════════════════════════════════
//  Bridge MCU simulator
// ═══════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct SimTank {
    pub uid: u64,
    pub eeprom: [u8; 128],
}

#[derive(Default)]
pub struct BridgeSimState {
    pub buses: [Option<SimTank>; NUM_BUSES],
    /// Writes are dropped (no ack) while set.
    pub fail_writes: bool,
    /// The whole bridge goes dark while set.
    pub silent: bool,
    pub write_count: usize,
}

impl BridgeSimState {
    pub fn place_tank(&mut self, bus: usize, uid: u64, eeprom: [u8; 128]) {
        self.buses[bus] = Some(SimTank { uid, eeprom });
    }

    pub fn remove_tank(&mut self, bus: usize) {
        self.buses[bus] = None;
    }

    pub fn eeprom(&self, bus: usize) -> Option<[u8; 128]> {
        self.buses[bus].as_ref().map(|t| t.eeprom)
    }
}

/// Shared handle for mutating the simulated buses mid-test.
pub type BridgeSimHandle = Arc<Mutex<BridgeSimState>>;

/// The [`BridgePort`] face of the simulator.
pub struct BridgeSim {
    state: BridgeSimHandle,
    decoder: FrameDecoder,
    rx: VecDeque<u8>,
}

impl BridgeSim {
    pub fn new() -> (Self, BridgeSimHandle) {
        let state: BridgeSimHandle = Arc::new(Mutex::new(BridgeSimState::default()));
        (
            Self {
                state: state.clone(),
                decoder: FrameDecoder::new(),
                rx: VecDeque::new(),
            },
            state,
        )
    }

    fn respond(&mut self, opcode: Opcode, payload: &[u8]) {
        let mut buf = [0u8; MAX_FRAME_SIZE + 1];
        let n = encode_frame(opcode, payload, &mut buf).unwrap();
        self.rx.extend(&buf[..n]);
    }

    fn ack(&mut self, for_opcode: Opcode) {
        self.respond(Opcode::Ack, &[for_opcode as u8]);
    }

    fn handle_request(&mut self, body: Vec<u8>) {
        if body.len() < 2 || body[0] != !body[1] {
            return;
        }
        let state = self.state.clone();
        match body[0] {
            op if op == Opcode::Wake as u8 => self.ack(Opcode::Wake),
            op if op == Opcode::Sleep as u8 => self.ack(Opcode::Sleep),

            op if op == Opcode::GetPresence as u8 => {
                let guard = state.lock();
                let mut presences = 0u16;
                let mut count = 0u8;
                for (bus, slot) in guard.buses.iter().enumerate() {
                    if slot.is_some() {
                        presences |= 1 << bus;
                        count += 1;
                    }
                }
                drop(guard);
                self.respond(
                    Opcode::GetPresence,
                    &[(presences & 0xFF) as u8, (presences >> 8) as u8, count],
                );
            }

            op if op == Opcode::RollCall as u8 => {
                let guard = state.lock();
                let mut payload = Vec::with_capacity(NUM_BUSES * 8);
                for slot in guard.buses.iter() {
                    // Empty buses answer with the all-ones sentinel, as
                    // the real bridge does.
                    let uid = slot.as_ref().map_or(u64::MAX, |t| t.uid);
                    payload.extend_from_slice(&uid.to_le_bytes());
                }
                drop(guard);
                self.respond(Opcode::RollCall, &payload);
            }

            op if op == Opcode::GetUid as u8 => {
                let bus = body.get(2).copied().unwrap_or(0) as usize % NUM_BUSES;
                let uid = state.lock().buses[bus]
                    .as_ref()
                    .map_or(u64::MAX, |t| t.uid);
                self.respond(Opcode::HaveUid, &uid.to_le_bytes());
            }

            op if op == Opcode::ReadBytes as u8 => {
                if body.len() < 5 {
                    return;
                }
                let (bus, offset, len) = (body[2] as usize, body[3] as usize, body[4] as usize);
                let guard = state.lock();
                let Some(tank) = guard.buses[bus % NUM_BUSES].as_ref() else {
                    drop(guard);
                    self.respond(Opcode::Nack, &[0x03]); // no device
                    return;
                };
                let end = (offset + len).min(tank.eeprom.len());
                let data = tank.eeprom[offset.min(128)..end].to_vec();
                drop(guard);

                let mut payload = vec![body[2], body[3], data.len() as u8];
                payload.extend_from_slice(&data);
                self.respond(Opcode::ReadBytes, &payload);
            }

            op if op == Opcode::WriteBytes as u8 => {
                if body.len() < 5 {
                    return;
                }
                let mut guard = state.lock();
                if guard.fail_writes {
                    return; // no ack — client times out
                }
                let (bus, offset, len) = (body[2] as usize, body[3] as usize, body[4] as usize);
                if let Some(tank) = guard.buses[bus % NUM_BUSES].as_mut() {
                    let data = &body[5..5 + len.min(body.len() - 5)];
                    let end = (offset + data.len()).min(tank.eeprom.len());
                    tank.eeprom[offset..end].copy_from_slice(&data[..end - offset]);
                    guard.write_count += 1;
                    drop(guard);
                    self.ack(Opcode::WriteBytes);
                }
            }

            _ => {}
        }
    }
}

impl BridgePort for BridgeSim {
    fn write_all(&mut self, bytes: &[u8]) {
        if self.state.lock().silent {
            return;
        }
        let mut completed: Vec<Vec<u8>> = Vec::new();
        for &byte in bytes {
            if let Ok(Some(body)) = self.decoder.push(byte) {
                completed.push(body.to_vec());
            }
        }
        for body in completed {
            self.handle_request(body);
        }
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.rx.pop_front()
    }

    fn clear_rx(&mut self) {
        self.rx.clear();
    }
}

// ═══════════════════════════════════════════════════════════════
//  Feeder kinematics (engine / dispatcher tests)
// ═══════════════════════════════════════════════════════════════

pub struct SimTankSpec {
    pub uid: u64,
    pub channel: u8,
    pub density_g_per_l: f32,
    pub stock_g: f32,
}

pub struct FeederState {
    pub auger_speed: [f32; NUM_BUSES],
    pub hopper_us: u16,
    pub servo_power: bool,
    pub stop_all_count: usize,
    pub tare_count: usize,

    /// Bowl weight as the scale sees it (grams since last tare).
    pub weight_g: f32,
    /// Grams added per millisecond by an auger at full speed.
    pub flow_g_per_ms: f32,
    /// Channels whose tanks are dry (no flow).
    pub dry_channels: [bool; NUM_BUSES],
    /// Pulse at which the closing gate pinches a kibble; the pinch adds
    /// a one-shot spike.
    pub close_spike_at_us: Option<u16>,
    spike_fired: bool,
    /// Scale goes NaN while set.
    pub scale_dead: bool,

    pub tanks: Vec<SimTankSpec>,
    pub remaining_updates: Vec<(u64, f32)>,

    last_step_ms: u64,
}

impl FeederState {
    fn step(&mut self, now_ms: u64) {
        let dt = now_ms.saturating_sub(self.last_step_ms) as f32;
        self.last_step_ms = now_ms;
        if !self.servo_power {
            return;
        }
        for (channel, &speed) in self.auger_speed.iter().enumerate() {
            if speed > 0.0 && !self.dry_channels[channel] {
                self.weight_g += speed * self.flow_g_per_ms * dt;
            }
        }
    }
}

/// Build the linked hardware/scale pair around one kinematic state.
pub fn feeder_rig(clock: SimClock, tanks: Vec<SimTankSpec>) -> (MockFeedHw, MockScale) {
    let state = Arc::new(Mutex::new(FeederState {
        auger_speed: [0.0; NUM_BUSES],
        hopper_us: 1500,
        servo_power: false,
        stop_all_count: 0,
        tare_count: 0,
        weight_g: 0.0,
        flow_g_per_ms: 0.002, // 0.5 g per 250 ms period at full speed
        dry_channels: [false; NUM_BUSES],
        close_spike_at_us: None,
        spike_fired: false,
        scale_dead: false,
        tanks,
        remaining_updates: Vec::new(),
        last_step_ms: clock.now_ms(),
    }));
    (
        MockFeedHw {
            state: state.clone(),
            clock: clock.clone(),
        },
        MockScale { state, clock },
    )
}

pub struct MockFeedHw {
    pub state: Arc<Mutex<FeederState>>,
    clock: SimClock,
}

impl ServoPort for MockFeedHw {
    fn set_servo_power(&mut self, on: bool) {
        let mut s = self.state.lock();
        let now = self.clock.now_ms();
        s.step(now);
        s.servo_power = on;
    }

    fn set_continuous_servo(&mut self, channel: u8, speed: f32) {
        let mut s = self.state.lock();
        let now = self.clock.now_ms();
        s.step(now);
        s.auger_speed[channel as usize % NUM_BUSES] = speed.clamp(-1.0, 1.0);
    }

    fn set_servo_us(&mut self, channel: u8, us: u16) {
        let mut s = self.state.lock();
        let now = self.clock.now_ms();
        s.step(now);
        if channel as usize == NUM_BUSES {
            // Hopper channel: check for the pinch spike on the way in.
            if let Some(spike_at) = s.close_spike_at_us {
                let crossed = (s.hopper_us > spike_at && us <= spike_at)
                    || (s.hopper_us < spike_at && us >= spike_at);
                if crossed && !s.spike_fired {
                    s.weight_g += 4.0;
                    s.spike_fired = true;
                }
            }
            s.hopper_us = us;
        }
    }

    fn open_hopper(&mut self) {
        self.set_servo_us(NUM_BUSES as u8, 2000);
        self.state.lock().spike_fired = false;
    }

    fn close_hopper(&mut self) {
        self.set_servo_us(NUM_BUSES as u8, 1000);
    }

    fn stop_all_servos(&mut self) {
        let mut s = self.state.lock();
        let now = self.clock.now_ms();
        s.step(now);
        s.auger_speed = [0.0; NUM_BUSES];
        s.servo_power = false;
        s.stop_all_count += 1;
    }
}

impl TankLookupPort for MockFeedHw {
    fn bus_of_tank(&mut self, uid: u64) -> Option<u8> {
        self.state
            .lock()
            .tanks
            .iter()
            .find(|t| t.uid == uid)
            .map(|t| t.channel)
    }

    fn density_g_per_l(&self, uid: u64) -> Option<f32> {
        self.state
            .lock()
            .tanks
            .iter()
            .find(|t| t.uid == uid)
            .map(|t| t.density_g_per_l)
            .filter(|d| *d > 0.0)
    }

    fn remaining_grams(&self, uid: u64) -> Option<f32> {
        self.state
            .lock()
            .tanks
            .iter()
            .find(|t| t.uid == uid)
            .map(|t| t.stock_g)
    }

    fn update_remaining_grams(&mut self, uid: u64, grams: f32) -> Result<()> {
        let mut s = self.state.lock();
        if let Some(tank) = s.tanks.iter_mut().find(|t| t.uid == uid) {
            tank.stock_g = grams;
        }
        s.remaining_updates.push((uid, grams));
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════
//  In-memory NVS
// ═══════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct MemoryNvs {
    map: std::collections::HashMap<String, Vec<u8>>,
}

impl StoragePort for MemoryNvs {
    fn read(
        &self,
        namespace: &str,
        key: &str,
        buf: &mut [u8],
    ) -> core::result::Result<usize, StorageError> {
        match self.map.get(&format!("{namespace}::{key}")) {
            Some(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            None => Err(StorageError::NotFound),
        }
    }

    fn write(
        &mut self,
        namespace: &str,
        key: &str,
        data: &[u8],
    ) -> core::result::Result<(), StorageError> {
        self.map.insert(format!("{namespace}::{key}"), data.to_vec());
        Ok(())
    }

    fn delete(&mut self, namespace: &str, key: &str) -> core::result::Result<(), StorageError> {
        self.map.remove(&format!("{namespace}::{key}"));
        Ok(())
    }

    fn exists(&self, namespace: &str, key: &str) -> bool {
        self.map.contains_key(&format!("{namespace}::{key}"))
    }
}

pub struct MockScale {
    pub state: Arc<Mutex<FeederState>>,
    clock: SimClock,
}

impl ScalePort for MockScale {
    fn weight(&self) -> f32 {
        let mut s = self.state.lock();
        let now = self.clock.now_ms();
        s.step(now);
        if s.scale_dead {
            f32::NAN
        } else {
            s.weight_g
        }
    }

    fn raw(&self) -> i32 {
        (self.state.lock().weight_g * 100.0) as i32
    }

    fn is_responding(&self) -> bool {
        !self.state.lock().scale_dead
    }

    fn tare(&mut self) -> Result<()> {
        let mut s = self.state.lock();
        if s.scale_dead {
            return Err(kibblet::error::Error::Scale(
                kibblet::error::ScaleError::Unresponsive,
            ));
        }
        let now = self.clock.now_ms();
        s.step(now);
        s.weight_g = 0.0;
        s.tare_count += 1;
        Ok(())
    }
}
