//! Request/response client for the 1-Wire bridge MCU.
//!
//! The bridge multiplexes up to six independent 1-Wire buses, each
//! carrying at most one 128-byte EEPROM, behind a 57600 8N1 UART. Every
//! exchange is a single request frame followed by a single response (or
//! Ack/Nack) frame; see [`frame`](super::frame) for the wire format.
//!
//! The client itself is lock-free; the registry serializes access behind
//! the bridge mutex, and callers may nest primitives under one
//! acquisition.

use log::{error, warn};

use super::frame::{self, encode_frame, FrameDecoder, Opcode, MAX_FRAME_SIZE};
use crate::adapters::time::Clock;
use crate::error::BridgeError;
use crate::pins::NUMBER_OF_BUSES;

/// Byte-stream port to the bridge UART. Non-blocking on the read side;
/// the client paces its own poll loop through the [`Clock`].
pub trait BridgePort {
    fn write_all(&mut self, bytes: &[u8]);
    /// One received byte, or `None` if the RX buffer is empty.
    fn read_byte(&mut self) -> Option<u8>;
    /// Drop everything pending in the RX buffer.
    fn clear_rx(&mut self);
}

/// Presence report: bit `i` of `presences` is set iff a device answered
/// on bus `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PresenceReport {
    pub presences: u16,
    pub bus_count: u8,
}

/// Per-bus UIDs from a roll call; 0 means "no device".
pub type RollCallUids = [u64; NUMBER_OF_BUSES];

// Operation timeouts. Write covers the EEPROM's page-programming time
// for a whole record (17 pages at ~30 ms plus UART transfer).
pub const PRESENCE_TIMEOUT_MS: u32 = 3;
pub const GETUID_TIMEOUT_MS: u32 = 100;
pub const ROLLCALL_TIMEOUT_MS: u32 = 333;
pub const READ_TIMEOUT_MS: u32 = 600;
pub const WRITE_TIMEOUT_MS: u32 = 600;
const WAKE_ACK_TIMEOUT_MS: u32 = 20;
pub const WAKE_RETRIES_DEFAULT: usize = 3;

/// A UID of all ones is the bridge's "nothing on this bus" sentinel.
#[inline]
fn normalize_uid(raw: u64) -> u64 {
    if raw == u64::MAX {
        0
    } else {
        raw
    }
}

pub struct BridgeClient<P: BridgePort, C: Clock> {
    port: P,
    clock: C,
    decoder: FrameDecoder,
    awake: bool,
}

impl<P: BridgePort, C: Clock> BridgeClient<P, C> {
    pub fn new(port: P, clock: C) -> Self {
        Self {
            port,
            clock,
            decoder: FrameDecoder::new(),
            awake: false,
        }
    }

    pub fn is_asleep(&self) -> bool {
        !self.awake
    }

    // ── Link management ───────────────────────────────────────

    /// Emit wake requests until the bridge acknowledges one.
    /// Flushes stale RX bytes before and after.
    pub fn wake(&mut self, retries: usize) -> Result<(), BridgeError> {
        self.port.clear_rx();
        self.decoder.reset();

        let mut attempts = retries.max(1);
        loop {
            self.send(Opcode::Wake, &[]);
            match self.await_ack(Opcode::Wake, WAKE_ACK_TIMEOUT_MS) {
                Ok(()) => break,
                Err(e) => {
                    attempts -= 1;
                    if attempts == 0 {
                        warn!("bridge: no wake ack after {} attempts ({})", retries, e);
                        return Err(BridgeError::Silent);
                    }
                }
            }
        }

        // Let any trailing chatter (e.g. an unsolicited presence report
        // emitted on wake) drain, then discard it.
        self.clock.delay_ms(20);
        self.port.clear_rx();
        self.decoder.reset();
        self.awake = true;
        Ok(())
    }

    /// Command low-power mode.
    pub fn sleep(&mut self) -> Result<(), BridgeError> {
        self.send(Opcode::Sleep, &[]);
        self.awake = false;
        self.await_ack(Opcode::Sleep, WAKE_ACK_TIMEOUT_MS)
    }

    // ── Queries ───────────────────────────────────────────────

    /// Ask which buses currently see a device.
    pub fn poll_presence(&mut self, timeout_ms: u32) -> Result<PresenceReport, BridgeError> {
        self.ensure_awake()?;
        self.port.clear_rx();
        self.send(Opcode::GetPresence, &[]);

        let body = self.await_response(Opcode::GetPresence, timeout_ms)?;
        if body.len() != 5 {
            return Err(BridgeError::InvalidPayload);
        }
        Ok(PresenceReport {
            presences: u16::from_le_bytes([body[2], body[3]]),
            bus_count: body[4],
        })
    }

    /// Per-bus UIDs in one exchange. Missing devices come back as 0.
    pub fn roll_call(&mut self, timeout_ms: u32) -> Result<RollCallUids, BridgeError> {
        self.ensure_awake()?;
        self.send(Opcode::RollCall, &[]);

        let body = self.await_response(Opcode::RollCall, timeout_ms)?;
        if body.len() != 2 + NUMBER_OF_BUSES * 8 {
            return Err(BridgeError::InvalidPayload);
        }
        let mut uids = [0u64; NUMBER_OF_BUSES];
        for (bus, uid) in uids.iter_mut().enumerate() {
            let base = 2 + bus * 8;
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&body[base..base + 8]);
            *uid = normalize_uid(u64::from_le_bytes(bytes));
        }
        Ok(uids)
    }

    /// UID of the device on one bus (0 if the bus is empty).
    pub fn get_uid(&mut self, bus_index: u8, timeout_ms: u32) -> Result<u64, BridgeError> {
        Self::check_bus(bus_index)?;
        self.ensure_awake()?;
        self.send(Opcode::GetUid, &[bus_index]);

        let body = self.await_response(Opcode::HaveUid, timeout_ms)?;
        if body.len() < 10 {
            return Err(BridgeError::InvalidPayload);
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&body[2..10]);
        Ok(normalize_uid(u64::from_le_bytes(bytes)))
    }

    // ── EEPROM access ─────────────────────────────────────────

    /// Read `buf.len()` bytes starting at `offset` from the EEPROM on
    /// `bus_index`. Returns the length the device actually reported.
    pub fn read(
        &mut self,
        bus_index: u8,
        offset: u8,
        buf: &mut [u8],
        timeout_ms: u32,
    ) -> Result<usize, BridgeError> {
        Self::check_bus(bus_index)?;
        let len = buf.len();
        if len == 0 || len > 128 {
            return Err(BridgeError::InvalidPayload);
        }
        self.ensure_awake()?;
        self.send(Opcode::ReadBytes, &[bus_index, offset, len as u8]);

        let body = self.await_response(Opcode::ReadBytes, timeout_ms)?;
        // Response echoes the request header: [op, ~op, bus, offset, n].
        if body.len() < 5 || body[2] != bus_index || body[3] != offset {
            error!("bridge: unexpected values in read response header");
            return Err(BridgeError::ReadResp);
        }
        let reported = body[4] as usize;
        if reported > len {
            error!(
                "bridge: device reported {} bytes for a {}-byte read",
                reported, len
            );
            return Err(BridgeError::ReadResp);
        }
        if body.len() < 5 + reported {
            return Err(BridgeError::Framing);
        }
        buf[..reported].copy_from_slice(&body[5..5 + reported]);
        Ok(reported)
    }

    /// Write `data` starting at `offset` on `bus_index` and await the ack.
    pub fn write(
        &mut self,
        bus_index: u8,
        offset: u8,
        data: &[u8],
        timeout_ms: u32,
    ) -> Result<(), BridgeError> {
        Self::check_bus(bus_index)?;
        if data.is_empty() || data.len() > 128 {
            return Err(BridgeError::InvalidPayload);
        }
        self.ensure_awake()?;

        let mut payload = [0u8; MAX_FRAME_SIZE];
        payload[0] = bus_index;
        payload[1] = offset;
        payload[2] = data.len() as u8;
        payload[3..3 + data.len()].copy_from_slice(data);
        self.send(Opcode::WriteBytes, &payload[..3 + data.len()]);

        self.await_ack(Opcode::WriteBytes, timeout_ms)
    }

    // ── Internal ──────────────────────────────────────────────

    fn check_bus(bus_index: u8) -> Result<(), BridgeError> {
        if (bus_index as usize) < NUMBER_OF_BUSES {
            Ok(())
        } else {
            Err(BridgeError::BusIndexOutOfRange)
        }
    }

    fn ensure_awake(&mut self) -> Result<(), BridgeError> {
        if self.awake {
            Ok(())
        } else {
            self.wake(WAKE_RETRIES_DEFAULT)
        }
    }

    fn send(&mut self, opcode: Opcode, payload: &[u8]) {
        let mut buf = [0u8; MAX_FRAME_SIZE + 1];
        // Payload is always bounded by construction above.
        if let Some(n) = encode_frame(opcode, payload, &mut buf) {
            self.port.write_all(&buf[..n]);
        }
    }

    /// Poll for the next well-formed frame with the expected opcode.
    /// Nack frames abort with the bridge's passthrough code; other
    /// frames (stale responses) are skipped.
    fn await_response(
        &mut self,
        expected: Opcode,
        timeout_ms: u32,
    ) -> Result<heapless::Vec<u8, MAX_FRAME_SIZE>, BridgeError> {
        let deadline = self.clock.now_ms() + timeout_ms as u64;
        loop {
            while let Some(byte) = self.port.read_byte() {
                let completed = match self.decoder.push(byte) {
                    Ok(c) => c.map(|body| {
                        heapless::Vec::<u8, MAX_FRAME_SIZE>::from_slice(body)
                            .unwrap_or_default()
                    }),
                    Err(_) => {
                        warn!("bridge: framing error awaiting {:?}", expected);
                        return Err(BridgeError::Framing);
                    }
                };
                if let Some(body) = completed {
                    if !frame::opcode_pair_valid(&body) {
                        return Err(BridgeError::InvalidPayload);
                    }
                    if body[0] == expected as u8 {
                        self.awake = true;
                        return Ok(body);
                    }
                    if body[0] == Opcode::Nack as u8 {
                        let code = body.get(2).copied().unwrap_or(0);
                        return Err(BridgeError::Nack(code));
                    }
                    // Stale or unrelated frame — keep polling.
                }
            }
            if self.clock.now_ms() > deadline {
                return Err(BridgeError::Timeout);
            }
            // ~5.7 characters arrive per millisecond at 57600 baud.
            self.clock.delay_ms(1);
        }
    }

    fn await_ack(&mut self, for_opcode: Opcode, timeout_ms: u32) -> Result<(), BridgeError> {
        let body = self.await_response(Opcode::Ack, timeout_ms)?;
        if body.len() >= 3 && body[2] == for_opcode as u8 {
            Ok(())
        } else {
            Err(BridgeError::InvalidPayload)
        }
    }
}
