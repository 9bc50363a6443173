//! Length-prefixed frame codec for the bus-bridge UART link.
//!
//! Wire format:
//! ```text
//! ┌─────────────┬────────┬─────────┬──────────────────┐
//! │ Length (1B) │ Opcode │ ~Opcode │ Payload (N bytes)│
//! └─────────────┴────────┴─────────┴──────────────────┘
//! ```
//!
//! `Length` counts everything after itself (opcode + complement +
//! payload), so the smallest legal frame is `[2, op, ~op]`. The opcode
//! complement is the bridge's cheap consistency check; the decoder
//! surfaces the raw frame and leaves the complement check to the
//! client layer, which knows which opcode it expects.

/// Largest frame body we accept: opcode pair + write header + 128 data
/// bytes, rounded up.
pub const MAX_FRAME_SIZE: usize = 160;

/// Opcodes understood by the bridge MCU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Ack = 0x06,
    Nack = 0x15,
    Wake = 0x11,
    Sleep = 0x12,
    GetPresence = 0x21,
    RollCall = 0x22,
    GetUid = 0x23,
    HaveUid = 0x24,
    ReadBytes = 0x31,
    WriteBytes = 0x32,
}

impl Opcode {
    /// The bitwise complement sent alongside every opcode.
    pub const fn complement(self) -> u8 {
        !(self as u8)
    }
}

/// True if `a` and `b` are bitwise complements of each other.
#[inline]
pub const fn are_complements(a: u8, b: u8) -> bool {
    a == !b
}

/// True if the first two payload bytes form a valid opcode pair.
pub fn opcode_pair_valid(payload: &[u8]) -> bool {
    payload.len() >= 2 && are_complements(payload[0], payload[1])
}

// ── Decoder ──────────────────────────────────────────────────

/// Decoder rejection: the length prefix was outside `2..=MAX_FRAME_SIZE`.
/// The decoder resyncs itself; the caller decides whether to escalate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadLength(pub u8);

enum DecoderState {
    ReadingLength,
    ReadingBody { expected: usize, collected: usize },
}

/// Streaming frame decoder.
///
/// Feed bytes one at a time with [`push`](Self::push); a completed frame
/// body (opcode + complement + payload) is returned as a borrowed slice
/// valid until the next push.
pub struct FrameDecoder {
    state: DecoderState,
    body: [u8; MAX_FRAME_SIZE],
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: DecoderState::ReadingLength,
            body: [0; MAX_FRAME_SIZE],
        }
    }

    /// Feed one byte. Returns `Ok(Some(body))` when a frame completes,
    /// `Err(BadLength)` when the length prefix is implausible (decoder
    /// has already resynced to the next length byte).
    pub fn push(&mut self, byte: u8) -> Result<Option<&[u8]>, BadLength> {
        match &mut self.state {
            DecoderState::ReadingLength => {
                let len = byte as usize;
                if !(2..=MAX_FRAME_SIZE).contains(&len) {
                    return Err(BadLength(byte));
                }
                self.state = DecoderState::ReadingBody {
                    expected: len,
                    collected: 0,
                };
                Ok(None)
            }
            DecoderState::ReadingBody {
                expected,
                collected,
            } => {
                self.body[*collected] = byte;
                *collected += 1;
                if *collected == *expected {
                    let len = *expected;
                    self.state = DecoderState::ReadingLength;
                    Ok(Some(&self.body[..len]))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Feed a byte slice, returning the body of the first frame that
    /// completes within it. Bad length prefixes resync silently here;
    /// this entry point serves tests and the fuzz harness, not the
    /// byte-at-a-time client.
    pub fn feed(&mut self, data: &[u8]) -> Option<&[u8]> {
        let mut completed = None;
        for &byte in data {
            if let Ok(Some(body)) = self.push(byte) {
                completed = Some(body.len());
                break;
            }
        }
        completed.map(|len| &self.body[..len])
    }

    /// Reset decoder state (e.g. after flushing the UART).
    pub fn reset(&mut self) {
        self.state = DecoderState::ReadingLength;
    }
}

// ── Encoder ──────────────────────────────────────────────────

/// Encode a frame `[len][opcode][~opcode][payload]` into `out`.
/// Returns the number of bytes written, or `None` if `payload` is too
/// large or `out` too small.
pub fn encode_frame(opcode: Opcode, payload: &[u8], out: &mut [u8]) -> Option<usize> {
    let body_len = 2 + payload.len();
    if body_len > MAX_FRAME_SIZE {
        return None;
    }
    let wire_len = 1 + body_len;
    if wire_len > out.len() {
        return None;
    }
    out[0] = body_len as u8;
    out[1] = opcode as u8;
    out[2] = opcode.complement();
    out[3..3 + payload.len()].copy_from_slice(payload);
    Some(wire_len)
}
