//! The mutable packet buffer.
//!
//! A [`Packet`] owns a single fixed allocation of [`MAX_PACKET_SIZE`]
//! bytes, materialised lazily on first use, and tracks `(position, size)`
//! with `0 <= position` and `size <= MAX_PACKET_SIZE`. Writers grow `size`
//! as needed but never past the capacity, and overwriting in the middle of
//! the packet never truncates the tail. Converting into a
//! [`ReadOnlyPacket`] transfers ownership of the bytes and resets the
//! source, so received data can be handed to a worker without copying.

use std::io::Write;

use bytes::BytesMut;
use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;

use crate::codec::{self, Encoding};
use crate::error::PacketError;
use crate::read_only_packet::{PacketRead, ReadOnlyPacket, MAX_PACKET_SIZE};

#[derive(Debug, Default)]
pub struct Packet {
    position: u32,
    buffer: BytesMut,
}

impl Packet {
    /// A new, empty packet. No memory is allocated until first use.
    pub fn new() -> Packet {
        Packet::default()
    }

    /// Ensure the fixed backing allocation exists.
    pub fn allocate(&mut self) {
        if self.buffer.capacity() == 0 {
            self.buffer.reserve(MAX_PACKET_SIZE);
        }
    }

    /// Direct access to the underlying bytes, cursor ignored.
    pub fn const_data(&self) -> &[u8] {
        &self.buffer
    }

    /// Reset position and size to zero, keeping the allocation.
    pub fn clear(&mut self) {
        self.position = 0;
        self.buffer.clear();
    }

    /// Truncate the packet to the current position, discarding everything
    /// after it.
    pub fn erase_right(&mut self) {
        self.buffer.truncate(self.position as usize);
    }

    /// Set the size to `size` and expose the backing storage up to it.
    /// Bytes between the old and new size are zeroed. Fails if `size`
    /// exceeds the capacity or falls before the current position.
    pub fn direct(&mut self, size: u32) -> Result<&mut [u8], PacketError> {
        if size as usize > MAX_PACKET_SIZE {
            return Err(self.bounds_error(format!(
                "attempted to directly access {size} bytes, more than the maximum packet size"
            )));
        }

        if size < self.position {
            return Err(self.bounds_error(format!(
                "attempted to directly access {size} bytes, fewer than the current position"
            )));
        }

        self.allocate();
        let size = size as usize;

        if self.buffer.len() < size {
            self.buffer.resize(size, 0);
        } else {
            self.buffer.truncate(size);
        }

        Ok(&mut self.buffer[..size])
    }

    /// Copy `count` bytes starting at the current position into a fresh,
    /// rewound packet. The source is left untouched.
    pub fn split(&mut self, count: u32) -> Result<Packet, PacketError> {
        let mut other = Packet::new();

        if count == 0 {
            return Ok(other);
        }

        let position = self.position as usize;

        if u64::from(self.left()) < u64::from(count) {
            return Err(self.bounds_error(format!(
                "attempted to split {count} bytes, more than the packet holds"
            )));
        }

        let count = count as usize;
        other.write_array(&self.buffer[position..position + count])?;
        other.rewind();
        Ok(other)
    }

    /// Transfer ownership of the bytes into a read-only packet, resetting
    /// this packet to empty. The cursor carries over.
    pub fn take_read_only(&mut self) -> ReadOnlyPacket {
        let position = self.position;
        let buffer = std::mem::take(&mut self.buffer);
        self.position = 0;
        ReadOnlyPacket::from_parts(position, buffer.freeze())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), PacketError> {
        let position = self.position as usize;
        let end = position as u64 + bytes.len() as u64;

        if end > MAX_PACKET_SIZE as u64 {
            return Err(self.bounds_error(format!(
                "attempted to write {} bytes, past the maximum packet size",
                bytes.len()
            )));
        }

        self.allocate();
        let end = end as usize;

        if self.buffer.len() < end {
            self.buffer.resize(end, 0);
        }

        self.buffer[position..end].copy_from_slice(bytes);
        // end was checked against MAX_PACKET_SIZE above.
        self.position = end as u32;
        Ok(())
    }

    /// Write `count` zero bytes.
    pub fn write_blank(&mut self, count: u32) -> Result<(), PacketError> {
        self.write_bytes(&vec![0u8; count as usize])
    }

    pub fn write_array(&mut self, bytes: &[u8]) -> Result<(), PacketError> {
        self.write_bytes(bytes)
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), PacketError> {
        self.write_bytes(&[value])
    }

    pub fn write_s8(&mut self, value: i8) -> Result<(), PacketError> {
        self.write_bytes(&[value as u8])
    }

    // 16-bit writers. The unsuffixed variants are host byte order.

    pub fn write_u16(&mut self, value: u16) -> Result<(), PacketError> {
        self.write_bytes(&value.to_ne_bytes())
    }

    pub fn write_u16_be(&mut self, value: u16) -> Result<(), PacketError> {
        self.write_bytes(&value.to_be_bytes())
    }

    pub fn write_u16_le(&mut self, value: u16) -> Result<(), PacketError> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_s16(&mut self, value: i16) -> Result<(), PacketError> {
        self.write_bytes(&value.to_ne_bytes())
    }

    pub fn write_s16_be(&mut self, value: i16) -> Result<(), PacketError> {
        self.write_bytes(&value.to_be_bytes())
    }

    pub fn write_s16_le(&mut self, value: i16) -> Result<(), PacketError> {
        self.write_bytes(&value.to_le_bytes())
    }

    // 32-bit writers.

    pub fn write_u32(&mut self, value: u32) -> Result<(), PacketError> {
        self.write_bytes(&value.to_ne_bytes())
    }

    pub fn write_u32_be(&mut self, value: u32) -> Result<(), PacketError> {
        self.write_bytes(&value.to_be_bytes())
    }

    pub fn write_u32_le(&mut self, value: u32) -> Result<(), PacketError> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_s32(&mut self, value: i32) -> Result<(), PacketError> {
        self.write_bytes(&value.to_ne_bytes())
    }

    pub fn write_s32_be(&mut self, value: i32) -> Result<(), PacketError> {
        self.write_bytes(&value.to_be_bytes())
    }

    pub fn write_s32_le(&mut self, value: i32) -> Result<(), PacketError> {
        self.write_bytes(&value.to_le_bytes())
    }

    // 64-bit writers.

    pub fn write_u64(&mut self, value: u64) -> Result<(), PacketError> {
        self.write_bytes(&value.to_ne_bytes())
    }

    pub fn write_u64_be(&mut self, value: u64) -> Result<(), PacketError> {
        self.write_bytes(&value.to_be_bytes())
    }

    pub fn write_u64_le(&mut self, value: u64) -> Result<(), PacketError> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_s64(&mut self, value: i64) -> Result<(), PacketError> {
        self.write_bytes(&value.to_ne_bytes())
    }

    pub fn write_s64_be(&mut self, value: i64) -> Result<(), PacketError> {
        self.write_bytes(&value.to_be_bytes())
    }

    pub fn write_s64_le(&mut self, value: i64) -> Result<(), PacketError> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Floats travel as raw IEEE-754 bit patterns in host byte order only.
    pub fn write_f32(&mut self, value: f32) -> Result<(), PacketError> {
        self.write_bytes(&value.to_ne_bytes())
    }

    fn encode_wire(&mut self, encoding: Encoding, string: &str, null_terminate: bool) -> Vec<u8> {
        // Codec failures collapse to empty bytes on the wire path; a size
        // check after the fact detects them.
        codec::to_encoding(encoding, string, null_terminate).unwrap_or_default()
    }

    /// Write `string` in `encoding`, optionally null terminated.
    pub fn write_string(
        &mut self,
        encoding: Encoding,
        string: &str,
        null_terminate: bool,
    ) -> Result<(), PacketError> {
        let encoded = self.encode_wire(encoding, string, null_terminate);
        self.write_bytes(&encoded)
    }

    fn write_string_prefixed16(
        &mut self,
        encoded: Vec<u8>,
        write_prefix: fn(&mut Packet, u16) -> Result<(), PacketError>,
    ) -> Result<(), PacketError> {
        if encoded.len() > u16::MAX as usize {
            return Err(self.bounds_error(format!(
                "encoded string of {} bytes does not fit a u16 length prefix",
                encoded.len()
            )));
        }

        write_prefix(self, encoded.len() as u16)?;
        self.write_bytes(&encoded)
    }

    /// Write `string` preceded by its encoded byte length as a host-order
    /// u16. The length includes any null terminator.
    pub fn write_string16(
        &mut self,
        encoding: Encoding,
        string: &str,
        null_terminate: bool,
    ) -> Result<(), PacketError> {
        let encoded = self.encode_wire(encoding, string, null_terminate);
        self.write_string_prefixed16(encoded, Packet::write_u16)
    }

    pub fn write_string16_be(
        &mut self,
        encoding: Encoding,
        string: &str,
        null_terminate: bool,
    ) -> Result<(), PacketError> {
        let encoded = self.encode_wire(encoding, string, null_terminate);
        self.write_string_prefixed16(encoded, Packet::write_u16_be)
    }

    pub fn write_string16_le(
        &mut self,
        encoding: Encoding,
        string: &str,
        null_terminate: bool,
    ) -> Result<(), PacketError> {
        let encoded = self.encode_wire(encoding, string, null_terminate);
        self.write_string_prefixed16(encoded, Packet::write_u16_le)
    }

    /// Write `string` preceded by its encoded byte length as a host-order
    /// u32. The length includes any null terminator.
    pub fn write_string32(
        &mut self,
        encoding: Encoding,
        string: &str,
        null_terminate: bool,
    ) -> Result<(), PacketError> {
        let encoded = self.encode_wire(encoding, string, null_terminate);
        self.write_u32(encoded.len() as u32)?;
        self.write_bytes(&encoded)
    }

    pub fn write_string32_be(
        &mut self,
        encoding: Encoding,
        string: &str,
        null_terminate: bool,
    ) -> Result<(), PacketError> {
        let encoded = self.encode_wire(encoding, string, null_terminate);
        self.write_u32_be(encoded.len() as u32)?;
        self.write_bytes(&encoded)
    }

    pub fn write_string32_le(
        &mut self,
        encoding: Encoding,
        string: &str,
        null_terminate: bool,
    ) -> Result<(), PacketError> {
        let encoded = self.encode_wire(encoding, string, null_terminate);
        self.write_u32_le(encoded.len() as u32)?;
        self.write_bytes(&encoded)
    }

    /// Deflate `count` bytes starting at the current position, in place,
    /// with the default compression level. Returns the compressed size.
    pub fn compress(&mut self, count: i32) -> Result<i32, PacketError> {
        self.compress_with_level(count, -1)
    }

    /// Deflate with an explicit zlib level (`-1` for the default, `0..=9`
    /// otherwise).
    pub fn compress_with_level(&mut self, count: i32, level: i32) -> Result<i32, PacketError> {
        let compression = match level {
            -1 => Compression::default(),
            0..=9 => Compression::new(level as u32),
            _ => {
                return Err(self.bounds_error(format!("invalid compression level {level}")));
            }
        };

        self.recode_in_place(count, "compress", |input| {
            let mut encoder = ZlibEncoder::new(Vec::new(), compression);
            encoder.write_all(input)?;
            encoder.finish()
        })
    }

    /// Inflate `count` bytes starting at the current position, in place.
    /// Returns the decompressed size.
    pub fn decompress(&mut self, count: i32) -> Result<i32, PacketError> {
        self.recode_in_place(count, "decompress", |input| {
            let mut decoder = ZlibDecoder::new(Vec::new());
            decoder.write_all(input)?;
            decoder.finish()
        })
    }

    fn recode_in_place(
        &mut self,
        count: i32,
        operation: &str,
        recode: impl FnOnce(&[u8]) -> std::io::Result<Vec<u8>>,
    ) -> Result<i32, PacketError> {
        if count <= 0 {
            return Ok(0);
        }

        let position = self.position as usize;

        if u64::from(self.left()) < count as u64 {
            return Err(self.bounds_error(format!(
                "attempted to {operation} {count} bytes, more than the packet holds"
            )));
        }

        let input = self.buffer[position..position + count as usize].to_vec();
        let output = recode(&input)
            .map_err(|e| self.bounds_error(format!("failed to {operation} packet data: {e}")))?;

        if position + output.len() > MAX_PACKET_SIZE {
            return Err(self.bounds_error(format!(
                "{operation}ed data of {} bytes does not fit the packet",
                output.len()
            )));
        }

        self.buffer.truncate(position);
        self.buffer.extend_from_slice(&output);

        // The recoded data was checked to fit the packet above.
        Ok(output.len() as i32)
    }
}

impl PacketRead for Packet {
    fn data(&self) -> &[u8] {
        &self.buffer
    }

    fn tell(&self) -> u32 {
        self.position
    }

    fn set_position(&mut self, position: u32) {
        self.position = position;
    }
}

impl From<Packet> for ReadOnlyPacket {
    fn from(mut packet: Packet) -> ReadOnlyPacket {
        packet.take_read_only()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_round_trip_u8() {
        for value in [0u8, 1, 0x7f, 0xff] {
            let mut p = Packet::new();
            p.write_u8(value).unwrap();
            p.rewind();
            assert_eq!(p.read_u8().unwrap(), value);
        }

        let mut p = Packet::new();
        p.write_s8(-100).unwrap();
        p.rewind();
        assert_eq!(p.read_s8().unwrap(), -100);
    }

    #[rstest]
    #[case::zero(0)]
    #[case::small(0x1234)]
    #[case::max(u16::MAX)]
    fn test_round_trip_u16(#[case] value: u16) {
        let mut p = Packet::new();
        p.write_u16(value).unwrap();
        p.write_u16_be(value).unwrap();
        p.write_u16_le(value).unwrap();
        p.rewind();
        assert_eq!(p.read_u16().unwrap(), value);
        assert_eq!(p.read_u16_be().unwrap(), value);
        assert_eq!(p.read_u16_le().unwrap(), value);
    }

    #[rstest]
    #[case::zero(0)]
    #[case::negative(-77)]
    #[case::min(i16::MIN)]
    fn test_round_trip_s16(#[case] value: i16) {
        let mut p = Packet::new();
        p.write_s16(value).unwrap();
        p.write_s16_be(value).unwrap();
        p.write_s16_le(value).unwrap();
        p.rewind();
        assert_eq!(p.read_s16().unwrap(), value);
        assert_eq!(p.read_s16_be().unwrap(), value);
        assert_eq!(p.read_s16_le().unwrap(), value);
    }

    #[rstest]
    #[case::zero(0)]
    #[case::small(0xdead_beef)]
    #[case::max(u32::MAX)]
    fn test_round_trip_u32(#[case] value: u32) {
        let mut p = Packet::new();
        p.write_u32(value).unwrap();
        p.write_u32_be(value).unwrap();
        p.write_u32_le(value).unwrap();
        p.rewind();
        assert_eq!(p.read_u32().unwrap(), value);
        assert_eq!(p.read_u32_be().unwrap(), value);
        assert_eq!(p.read_u32_le().unwrap(), value);
    }

    #[rstest]
    #[case::zero(0)]
    #[case::negative(-1_000_000)]
    #[case::min(i32::MIN)]
    fn test_round_trip_s32(#[case] value: i32) {
        let mut p = Packet::new();
        p.write_s32(value).unwrap();
        p.write_s32_be(value).unwrap();
        p.write_s32_le(value).unwrap();
        p.rewind();
        assert_eq!(p.read_s32().unwrap(), value);
        assert_eq!(p.read_s32_be().unwrap(), value);
        assert_eq!(p.read_s32_le().unwrap(), value);
    }

    #[rstest]
    #[case::zero(0)]
    #[case::large(0x0123_4567_89ab_cdef)]
    #[case::max(u64::MAX)]
    fn test_round_trip_u64(#[case] value: u64) {
        let mut p = Packet::new();
        p.write_u64(value).unwrap();
        p.write_u64_be(value).unwrap();
        p.write_u64_le(value).unwrap();
        p.rewind();
        assert_eq!(p.read_u64().unwrap(), value);
        assert_eq!(p.read_u64_be().unwrap(), value);
        assert_eq!(p.read_u64_le().unwrap(), value);
    }

    #[rstest]
    #[case::zero(0)]
    #[case::negative(-42_000_000_000)]
    #[case::min(i64::MIN)]
    fn test_round_trip_s64(#[case] value: i64) {
        let mut p = Packet::new();
        p.write_s64(value).unwrap();
        p.write_s64_be(value).unwrap();
        p.write_s64_le(value).unwrap();
        p.rewind();
        assert_eq!(p.read_s64().unwrap(), value);
        assert_eq!(p.read_s64_be().unwrap(), value);
        assert_eq!(p.read_s64_le().unwrap(), value);
    }

    #[rstest]
    #[case::zero(0.0)]
    #[case::pi(3.14159_f32)]
    #[case::negative(-1.0e-20)]
    fn test_round_trip_f32(#[case] value: f32) {
        let mut p = Packet::new();
        p.write_f32(value).unwrap();
        p.rewind();
        assert_eq!(p.read_f32().unwrap(), value);
    }

    #[rstest]
    #[case::utf8(Encoding::Utf8, "handshake string")]
    #[case::cp1252(Encoding::Cp1252, "caf\u{e9}")]
    #[case::cp932(Encoding::Cp932, "日本語")]
    fn test_round_trip_strings(#[case] encoding: Encoding, #[case] value: &str) {
        for null_terminate in [false, true] {
            let mut p = Packet::new();
            p.write_string16(encoding, value, null_terminate).unwrap();
            p.write_string16_be(encoding, value, null_terminate).unwrap();
            p.write_string16_le(encoding, value, null_terminate).unwrap();
            p.write_string32(encoding, value, null_terminate).unwrap();
            p.write_string32_be(encoding, value, null_terminate).unwrap();
            p.write_string32_le(encoding, value, null_terminate).unwrap();
            p.rewind();
            assert_eq!(p.read_string16(encoding).unwrap(), value);
            assert_eq!(p.read_string16_be(encoding).unwrap(), value);
            assert_eq!(p.read_string16_le(encoding).unwrap(), value);
            assert_eq!(p.read_string32(encoding).unwrap(), value);
            assert_eq!(p.read_string32_be(encoding).unwrap(), value);
            assert_eq!(p.read_string32_le(encoding).unwrap(), value);
            assert_eq!(p.left(), 0);
        }
    }

    #[test]
    fn test_write_string_null_terminated() {
        let mut p = Packet::new();
        p.write_string(Encoding::Utf8, "abc", true).unwrap();
        assert_eq!(p.size(), 4);
        p.rewind();
        assert_eq!(p.read_string(Encoding::Utf8).unwrap(), "abc");
    }

    #[test]
    fn test_write_blank_grows_with_zeroes() {
        let mut p = Packet::new();
        p.write_u8(0xaa).unwrap();
        p.write_blank(4).unwrap();
        assert_eq!(p.size(), 5);
        assert_eq!(p.const_data(), &[0xaa, 0, 0, 0, 0]);
    }

    #[test]
    fn test_overwrite_preserves_tail() {
        let mut p = Packet::new();
        p.write_array(b"0123456789").unwrap();
        p.seek(2).unwrap();
        p.write_array(b"XY").unwrap();
        assert_eq!(p.size(), 10);
        assert_eq!(p.const_data(), b"01XY456789");
        assert_eq!(p.tell(), 4);
    }

    #[test]
    fn test_write_past_capacity() {
        let mut p = Packet::new();
        p.write_blank(MAX_PACKET_SIZE as u32).unwrap();
        assert!(p.write_u8(0).is_err());
        assert_eq!(p.size(), MAX_PACKET_SIZE as u32);
    }

    #[test]
    fn test_clear_and_erase_right() {
        let mut p = Packet::new();
        p.write_array(b"abcdef").unwrap();
        p.seek(3).unwrap();
        p.erase_right();
        assert_eq!(p.size(), 3);
        assert_eq!(p.const_data(), b"abc");

        p.clear();
        assert_eq!(p.size(), 0);
        assert_eq!(p.tell(), 0);
    }

    #[test]
    fn test_direct() {
        let mut p = Packet::new();
        p.write_array(b"abc").unwrap();

        {
            let data = p.direct(5).unwrap();
            assert_eq!(data.len(), 5);
            assert_eq!(&data[..3], b"abc");
            data[3] = b'd';
            data[4] = b'e';
        }

        assert_eq!(p.size(), 5);
        assert_eq!(p.const_data(), b"abcde");

        assert!(p.direct(MAX_PACKET_SIZE as u32 + 1).is_err());
        p.seek(4).unwrap();
        assert!(p.direct(2).is_err());
    }

    #[test]
    fn test_split() {
        let mut p = Packet::new();
        p.write_array(b"header|payload").unwrap();
        p.seek(7).unwrap();

        let mut split = p.split(7).unwrap();
        assert_eq!(split.size(), 7);
        assert_eq!(split.tell(), 0);
        assert_eq!(split.read_array(7).unwrap(), b"payload");

        // The source is unchanged.
        assert_eq!(p.size(), 14);
        assert_eq!(p.tell(), 7);

        assert!(p.split(100).is_err());
    }

    #[test]
    fn test_move_into_read_only() {
        let mut a = Packet::new();
        a.write_array(b"abc").unwrap();
        assert_eq!(a.tell(), 3);

        let mut b: ReadOnlyPacket = a.take_read_only();
        a.write_array(b"z").unwrap();

        b.rewind();
        a.rewind();
        assert_eq!(b.read_array(3).unwrap(), b"abc");
        assert_eq!(a.read_array(1).unwrap(), b"z");
        assert_eq!(a.size(), 1);
    }

    #[test]
    fn test_compress_round_trip() {
        let payload: Vec<u8> = std::iter::repeat(b"lobby data ".as_slice())
            .take(64)
            .flatten()
            .copied()
            .collect();

        let mut p = Packet::new();
        p.write_array(b"head").unwrap();
        p.write_array(&payload).unwrap();
        p.seek(4).unwrap();

        let compressed = p.compress(payload.len() as i32).unwrap();
        assert!(compressed > 0);
        assert!((compressed as usize) < payload.len());
        assert_eq!(p.size() as usize, 4 + compressed as usize);
        assert_eq!(p.tell(), 4);

        let decompressed = p.decompress(compressed).unwrap();
        assert_eq!(decompressed as usize, payload.len());
        assert_eq!(&p.const_data()[..4], b"head");
        assert_eq!(&p.const_data()[4..], &payload[..]);
    }

    #[test]
    fn test_compress_bounds() {
        let mut p = Packet::new();
        p.write_array(b"ab").unwrap();
        p.rewind();
        assert!(p.compress(5).is_err());
        assert_eq!(p.compress(0).unwrap(), 0);
        assert!(p.compress_with_level(2, 10).is_err());
    }

    #[test]
    fn test_lazy_allocation() {
        let p = Packet::new();
        assert_eq!(p.size(), 0);

        let mut p = Packet::new();
        p.write_u8(1).unwrap();
        assert!(p.const_data().len() == 1);
    }
}
