//! Bitstream message codec.
//!
//! [`MessageBuffer`] is a fixed-capacity byte buffer with separate read and
//! write cursors and a sticky overflow flag. Writes past capacity become
//! no-ops and reads past the end return sentinels; neither ever fails, so a
//! decode loop always runs to completion and the caller discards the packet
//! afterwards by checking [`MessageBuffer::overflowed`]. This keeps the hot
//! per-packet path total and panic-free no matter what arrives off the wire.
//!
//! Field encodings are little-endian throughout. Coordinates are quantized
//! to 1/8 unit in a signed 16-bit range, angles to a byte (1/256 turn) or a
//! short (1/65536 turn), and unit direction vectors to an index into a fixed
//! table of precomputed normals, one byte on the wire.

use std::sync::OnceLock;

use tracing::debug;

/// Wire MTU bound: no message may exceed this many bytes.
pub const MAX_MESSAGE_LEN: usize = 1400;

/// Longest string a message may carry, NUL excluded.
pub const MAX_STRING_CHARS: usize = 1024;

/// Number of entries in the unit-direction table.
pub const NUM_UNIT_DIRECTIONS: usize = 98;

/// Fixed-capacity message buffer with read/write cursors and a sticky
/// overflow flag.
#[derive(Debug, Clone)]
pub struct MessageBuffer {
    data: Vec<u8>,
    capacity: usize,
    read: usize,
    overflowed: bool,
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_LEN)
    }
}

impl MessageBuffer {
    /// Create an empty buffer bounded at `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
            read: 0,
            overflowed: false,
        }
    }

    /// Wrap received bytes for reading.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
            capacity: bytes.len().max(MAX_MESSAGE_LEN),
            read: 0,
            overflowed: false,
        }
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The written bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// True once any write was dropped or any read ran off the end.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.read)
    }

    /// Current read position.
    pub fn read_cursor(&self) -> usize {
        self.read
    }

    /// Discard contents and clear the overflow flag.
    pub fn clear(&mut self) {
        self.data.clear();
        self.read = 0;
        self.overflowed = false;
    }

    /// Rewind the read cursor to the start of the message.
    pub fn begin_reading(&mut self) {
        self.read = 0;
    }

    // --- writes ------------------------------------------------------------

    /// Append raw bytes; on capacity exhaustion the write is skipped and the
    /// overflow flag set.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        if self.data.len() + bytes.len() > self.capacity {
            if !self.overflowed {
                debug!(
                    len = self.data.len(),
                    attempted = bytes.len(),
                    capacity = self.capacity,
                    "message buffer overflowed"
                );
            }
            self.overflowed = true;
            return;
        }
        self.data.extend_from_slice(bytes);
    }

    /// Write an unsigned byte; out-of-range input truncates like a C cast.
    pub fn write_u8(&mut self, value: i32) {
        self.write_bytes(&[value as u8]);
    }

    /// Write a signed byte.
    pub fn write_i8(&mut self, value: i32) {
        self.write_bytes(&[(value as i8) as u8]);
    }

    /// Write a little-endian 16-bit integer.
    pub fn write_i16(&mut self, value: i32) {
        self.write_bytes(&(value as i16).to_le_bytes());
    }

    /// Write a little-endian 32-bit integer.
    pub fn write_i32(&mut self, value: i32) {
        self.write_bytes(&value.to_le_bytes());
    }

    /// Write an IEEE-754 float unquantized.
    pub fn write_f32(&mut self, value: f32) {
        self.write_bytes(&value.to_le_bytes());
    }

    /// Write a string as UTF-8 bytes plus a NUL terminator, truncated at
    /// [`MAX_STRING_CHARS`].
    pub fn write_string(&mut self, value: &str) {
        let bytes = value.as_bytes();
        let end = bytes.len().min(MAX_STRING_CHARS);
        self.write_bytes(&bytes[..end]);
        self.write_bytes(&[0]);
    }

    /// Write a world coordinate at 1/8-unit granularity, clamped to the
    /// signed 16-bit range.
    pub fn write_coord(&mut self, value: f32) {
        let quantized = (value * 8.0)
            .round()
            .clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        self.write_i16(quantized as i32);
    }

    /// Write a position as three coordinates.
    pub fn write_pos(&mut self, pos: &[f32; 3]) {
        self.write_coord(pos[0]);
        self.write_coord(pos[1]);
        self.write_coord(pos[2]);
    }

    /// Write an angle quantized to a byte (360/256 degrees per step).
    pub fn write_angle(&mut self, degrees: f32) {
        self.write_u8(((degrees * (256.0 / 360.0)).round() as i32) & 255);
    }

    /// Write an angle quantized to a short (360/65536 degrees per step).
    pub fn write_angle16(&mut self, degrees: f32) {
        self.write_i16(((degrees * (65536.0 / 360.0)).round() as i32) & 65535);
    }

    /// Write a unit direction as the index of the nearest precomputed
    /// normal.
    pub fn write_dir(&mut self, dir: &[f32; 3]) {
        let table = unit_directions();
        let mut best = 0usize;
        let mut best_dot = f32::MIN;
        for (index, normal) in table.iter().enumerate() {
            let dot = dir[0] * normal[0] + dir[1] * normal[1] + dir[2] * normal[2];
            if dot > best_dot {
                best_dot = dot;
                best = index;
            }
        }
        self.write_u8(best as i32);
    }

    // --- reads -------------------------------------------------------------

    fn take(&mut self, count: usize) -> Option<&[u8]> {
        if self.read + count > self.data.len() {
            self.read = self.data.len();
            self.overflowed = true;
            return None;
        }
        let slice = &self.data[self.read..self.read + count];
        self.read += count;
        Some(slice)
    }

    /// Read an unsigned byte; `-1` on underrun.
    pub fn read_u8(&mut self) -> i32 {
        match self.take(1) {
            Some(bytes) => bytes[0] as i32,
            None => -1,
        }
    }

    /// Read a signed byte; `-1` on underrun.
    pub fn read_i8(&mut self) -> i32 {
        match self.take(1) {
            Some(bytes) => bytes[0] as i8 as i32,
            None => -1,
        }
    }

    /// Read a little-endian 16-bit integer, sign-extended; `-1` on underrun.
    pub fn read_i16(&mut self) -> i32 {
        match self.take(2) {
            Some(bytes) => i16::from_le_bytes([bytes[0], bytes[1]]) as i32,
            None => -1,
        }
    }

    /// Read a little-endian 32-bit integer; `-1` on underrun.
    pub fn read_i32(&mut self) -> i32 {
        match self.take(4) {
            Some(bytes) => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            None => -1,
        }
    }

    /// Read a float; `-1.0` on underrun.
    pub fn read_f32(&mut self) -> f32 {
        match self.take(4) {
            Some(bytes) => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            None => -1.0,
        }
    }

    /// Read a NUL-terminated string, bounded at [`MAX_STRING_CHARS`].
    /// Invalid UTF-8 is replaced rather than rejected; the transport makes
    /// no promises about peer byte sequences.
    pub fn read_string(&mut self) -> String {
        let mut bytes = Vec::new();
        loop {
            let c = self.read_u8();
            if c <= 0 {
                break;
            }
            bytes.push(c as u8);
            if bytes.len() >= MAX_STRING_CHARS {
                break;
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Read a 1/8-unit quantized coordinate.
    pub fn read_coord(&mut self) -> f32 {
        self.read_i16() as f32 * 0.125
    }

    /// Read a position as three coordinates.
    pub fn read_pos(&mut self) -> [f32; 3] {
        [self.read_coord(), self.read_coord(), self.read_coord()]
    }

    /// Read a byte-quantized angle in `[0, 360)` degrees.
    pub fn read_angle(&mut self) -> f32 {
        match self.take(1) {
            Some(bytes) => bytes[0] as f32 * (360.0 / 256.0),
            None => 0.0,
        }
    }

    /// Read a short-quantized angle in `[0, 360)` degrees.
    pub fn read_angle16(&mut self) -> f32 {
        match self.take(2) {
            Some(bytes) => u16::from_le_bytes([bytes[0], bytes[1]]) as f32 * (360.0 / 65536.0),
            None => 0.0,
        }
    }

    /// Read a table-indexed unit direction. An out-of-range index marks the
    /// buffer overflowed and returns the zero vector; the caller's overflow
    /// check rejects the packet.
    pub fn read_dir(&mut self) -> [f32; 3] {
        let index = self.read_u8();
        let table = unit_directions();
        if index < 0 || index as usize >= table.len() {
            self.overflowed = true;
            return [0.0; 3];
        }
        table[index as usize]
    }
}

/// Fixed table of unit vectors shared by both peers: every nonzero integer
/// direction with components in `-2..=2`, scalar duplicates removed,
/// normalized. Enumeration order is part of the wire format.
pub fn unit_directions() -> &'static [[f32; 3]; NUM_UNIT_DIRECTIONS] {
    static TABLE: OnceLock<[[f32; 3]; NUM_UNIT_DIRECTIONS]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [[0.0f32; 3]; NUM_UNIT_DIRECTIONS];
        let mut count = 0;
        for x in -2i32..=2 {
            for y in -2i32..=2 {
                for z in -2i32..=2 {
                    if x == 0 && y == 0 && z == 0 {
                        continue;
                    }
                    // All-even triples are scalar doubles of smaller ones.
                    if x % 2 == 0 && y % 2 == 0 && z % 2 == 0 {
                        continue;
                    }
                    let len = ((x * x + y * y + z * z) as f32).sqrt();
                    table[count] = [x as f32 / len, y as f32 / len, z as f32 / len];
                    count += 1;
                }
            }
        }
        debug_assert_eq!(count, NUM_UNIT_DIRECTIONS);
        table
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_round_trips() {
        let mut msg = MessageBuffer::default();
        msg.write_u8(200);
        msg.write_i8(-5);
        msg.write_i16(-1234);
        msg.write_i32(0x1234_5678);
        msg.write_f32(3.25);

        assert_eq!(msg.read_u8(), 200);
        assert_eq!(msg.read_i8(), -5);
        assert_eq!(msg.read_i16(), -1234);
        assert_eq!(msg.read_i32(), 0x1234_5678);
        assert_eq!(msg.read_f32(), 3.25);
        assert!(!msg.overflowed());
    }

    #[test]
    fn write_truncates_like_a_cast() {
        let mut msg = MessageBuffer::default();
        msg.write_u8(256);
        msg.write_u8(300);
        msg.write_u8(-1);
        msg.write_i16(65535);
        assert_eq!(msg.read_u8(), 0);
        assert_eq!(msg.read_u8(), 44);
        assert_eq!(msg.read_u8(), 255);
        assert_eq!(msg.read_i16(), -1);
    }

    #[test]
    fn coord_round_trips_within_eighth_unit() {
        let mut msg = MessageBuffer::default();
        for value in [0.0f32, 1.0, -1.0, 100.5, -100.5, 0.125, 0.0625, 4095.875] {
            msg.clear();
            msg.write_coord(value);
            let back = msg.read_coord();
            assert!(
                (back - value).abs() <= 0.125,
                "coord {value} decoded as {back}"
            );
        }
    }

    #[test]
    fn coord_clamps_at_wire_range() {
        let mut msg = MessageBuffer::default();
        msg.write_coord(1_000_000.0);
        assert_eq!(msg.read_i16(), i16::MAX as i32);
    }

    #[test]
    fn angle_round_trips_within_step() {
        let mut msg = MessageBuffer::default();
        for value in [0.0f32, 45.0, 90.0, 180.0, 270.0, 359.0] {
            msg.clear();
            msg.write_angle(value);
            let back = msg.read_angle();
            let diff = (back - value).rem_euclid(360.0);
            let diff = diff.min(360.0 - diff);
            assert!(diff <= 360.0 / 256.0, "angle {value} decoded as {back}");
        }
    }

    #[test]
    fn angle16_round_trips_within_step() {
        let mut msg = MessageBuffer::default();
        for value in [0.0f32, 1.40625, 44.9, 180.0, 359.99] {
            msg.clear();
            msg.write_angle16(value);
            let back = msg.read_angle16();
            let diff = (back - value).rem_euclid(360.0);
            let diff = diff.min(360.0 - diff);
            assert!(diff <= 360.0 / 65536.0, "angle16 {value} decoded as {back}");
        }
    }

    #[test]
    fn string_round_trips() {
        let mut msg = MessageBuffer::default();
        msg.write_string("maps/demo1");
        msg.write_string("");
        msg.write_string("\\name\\player");
        assert_eq!(msg.read_string(), "maps/demo1");
        assert_eq!(msg.read_string(), "");
        assert_eq!(msg.read_string(), "\\name\\player");
    }

    #[test]
    fn oversized_string_is_truncated_not_overflowing() {
        let mut msg = MessageBuffer::new(MAX_STRING_CHARS * 2 + 16);
        let long = "x".repeat(MAX_STRING_CHARS + 100);
        msg.write_string(&long);
        let back = msg.read_string();
        assert_eq!(back.len(), MAX_STRING_CHARS);
    }

    #[test]
    fn dir_decodes_to_nearby_normal() {
        let mut msg = MessageBuffer::default();
        msg.write_dir(&[0.9, 0.1, 0.0]);
        let back = msg.read_dir();
        assert!(back[0] > 0.5, "expected +x-ish normal, got {back:?}");

        msg.clear();
        msg.write_dir(&[0.0, 0.0, -1.0]);
        assert_eq!(msg.read_dir(), [0.0, 0.0, -1.0]);
    }

    #[test]
    fn bad_dir_index_marks_overflow() {
        let mut msg = MessageBuffer::default();
        msg.write_u8(NUM_UNIT_DIRECTIONS as i32);
        assert_eq!(msg.read_dir(), [0.0; 3]);
        assert!(msg.overflowed());
    }

    #[test]
    fn read_underrun_returns_sentinels_and_marks_overflow() {
        let mut msg = MessageBuffer::default();
        msg.write_u8(0x42);
        assert_eq!(msg.read_i16(), -1);
        assert!(msg.overflowed());
        // Every further read keeps returning sentinels.
        assert_eq!(msg.read_i32(), -1);
        assert_eq!(msg.read_f32(), -1.0);
        assert_eq!(msg.read_string(), "");
    }

    #[test]
    fn write_overflow_is_a_no_op() {
        let mut msg = MessageBuffer::new(4);
        msg.write_i32(7);
        assert!(!msg.overflowed());
        msg.write_u8(1);
        assert!(msg.overflowed());
        assert_eq!(msg.len(), 4);
        // Reads of the intact prefix still work.
        assert_eq!(msg.read_i32(), 7);
    }

    #[test]
    fn direction_table_is_full_of_unit_vectors() {
        let table = unit_directions();
        for normal in table.iter() {
            let len = (normal[0] * normal[0] + normal[1] * normal[1] + normal[2] * normal[2])
                .sqrt();
            assert!((len - 1.0).abs() < 1e-6);
        }
    }
}
