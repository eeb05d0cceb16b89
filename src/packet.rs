//! The sock's fixed 47-byte serial frame.
//!
//! ```text
//! byte  0       0xF0 start marker
//! byte  2       battery
//! bytes 3..7    u32 LE firmware timestamp (ms)
//! bytes 7..23   4 x u32 LE orientation quaternion
//! bytes 23..29  3 x i16 LE accelerometer
//! bytes 29..45  8 x i16 LE raw sensor shorts
//! byte  45      additive checksum of bytes 0..=44 (mod 256)
//! byte  46      0x55 stop marker
//! ```
//!
//! The pressure channels used for CoP are read separately as big-endian
//! magnitudes at side-specific offsets, see [`crate::sensor_link`].

use log::warn;
use std::fmt::Write;

/// Length of every frame on the wire.
pub const FRAME_LEN: usize = 47;
/// First byte of every frame.
pub const START_MARKER: u8 = 0xF0;
/// Last byte of every frame.
pub const STOP_MARKER: u8 = 0x55;
/// Index of the checksum byte.
pub const CHECKSUM_INDEX: usize = FRAME_LEN - 2;

const SCAN_CAPACITY: usize = 2048;

/// 8-bit additive checksum over `data`.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// True only for a 47-byte buffer with both markers and a matching checksum.
pub fn validate(candidate: &[u8]) -> bool {
    candidate.len() == FRAME_LEN
        && candidate[0] == START_MARKER
        && candidate[FRAME_LEN - 1] == STOP_MARKER
        && candidate[CHECKSUM_INDEX] == checksum(&candidate[..CHECKSUM_INDEX])
}

/// A validated frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame([u8; FRAME_LEN]);

impl RawFrame {
    /// Wrap `bytes` if they form a valid frame.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if !validate(bytes) {
            return None;
        }
        let mut frame = [0u8; FRAME_LEN];
        frame.copy_from_slice(bytes);
        Some(Self(frame))
    }

    /// Stamp markers and checksum onto `body` and wrap it. Used by the
    /// simulated socks and by tests to build well-formed traffic.
    pub fn seal(mut body: [u8; FRAME_LEN]) -> Self {
        body[0] = START_MARKER;
        body[FRAME_LEN - 1] = STOP_MARKER;
        body[CHECKSUM_INDEX] = checksum(&body[..CHECKSUM_INDEX]);
        Self(body)
    }

    /// The frame bytes.
    pub fn as_bytes(&self) -> &[u8; FRAME_LEN] {
        &self.0
    }

    /// Big-endian magnitude at `offset`; `None` past the end of the frame.
    pub fn magnitude_at(&self, offset: usize) -> Option<u16> {
        let hi = *self.0.get(offset)?;
        let lo = *self.0.get(offset + 1)?;
        Some(u16::from_be_bytes([hi, lo]))
    }

    /// Dash-separated upper-case hex, the form frames take in the log queue.
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(FRAME_LEN * 3);
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                out.push('-');
            }
            let _ = write!(out, "{:02X}", b);
        }
        out
    }

    /// Typed view of the telemetry fields.
    pub fn fields(&self) -> FrameFields {
        FrameFields::from_frame(self)
    }
}

/// The telemetry carried by a frame, as written to the per-device log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFields {
    /// Battery level byte
    pub battery: u8,
    /// Firmware timestamp in milliseconds
    pub time_ms: u32,
    /// Raw orientation quaternion components
    pub quaternion: [u32; 4],
    /// Accelerometer X, Y, Z
    pub accel: [i16; 3],
    /// The eight raw sensor shorts
    pub sensors: [i16; 8],
}

impl FrameFields {
    fn from_frame(frame: &RawFrame) -> Self {
        let b = &frame.0;
        let u32_at = |i: usize| u32::from_le_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]]);
        let i16_at = |i: usize| i16::from_le_bytes([b[i], b[i + 1]]);

        Self {
            battery: b[2],
            time_ms: u32_at(3),
            quaternion: [u32_at(7), u32_at(11), u32_at(15), u32_at(19)],
            accel: [i16_at(23), i16_at(25), i16_at(27)],
            sensors: std::array::from_fn(|i| i16_at(29 + 2 * i)),
        }
    }

    /// Tab-separated log columns, without the timestamp.
    pub fn to_columns(&self) -> String {
        let mut cols: Vec<String> = vec![self.battery.to_string(), self.time_ms.to_string()];
        cols.extend(self.quaternion.iter().map(|q| q.to_string()));
        cols.extend(self.accel.iter().map(|a| a.to_string()));
        cols.extend(self.sensors.iter().map(|s| s.to_string()));
        cols.join("\t")
    }
}

/// Rolling buffer that turns an arbitrary byte stream into validated frames.
#[derive(Debug, Default)]
pub struct PacketScanner {
    buffer: Vec<u8>,
}

impl PacketScanner {
    /// An empty scanner.
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(SCAN_CAPACITY),
        }
    }

    /// Append incoming bytes. Input that would overflow the buffer is dropped.
    pub fn push(&mut self, bytes: &[u8]) {
        if self.buffer.len() + bytes.len() > SCAN_CAPACITY {
            warn!(
                "Incoming data exceeds scan buffer ({} + {} bytes), dropping it",
                self.buffer.len(),
                bytes.len()
            );
            return;
        }
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pull the next valid frame out of the buffer, if one is complete.
    pub fn next_frame(&mut self) -> Option<RawFrame> {
        while self.buffer.len() >= FRAME_LEN {
            let Some(start) = self.buffer.iter().position(|b| *b == START_MARKER) else {
                self.buffer.clear();
                return None;
            };

            if start + FRAME_LEN > self.buffer.len() {
                self.buffer.drain(..start);
                return None;
            }

            match RawFrame::parse(&self.buffer[start..start + FRAME_LEN]) {
                Some(frame) => {
                    self.buffer.drain(..start + FRAME_LEN);
                    return Some(frame);
                }
                None => {
                    self.buffer.drain(..=start);
                }
            }
        }
        None
    }

    /// Push `bytes` and collect every frame that became complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<RawFrame> {
        self.push(bytes);
        std::iter::from_fn(|| self.next_frame()).collect()
    }
}
