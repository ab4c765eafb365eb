//! Cursor-based reading over packet data.
//!
//! [`PacketRead`] is the seam shared by the mutable [`crate::packet::Packet`]
//! and the immutable [`ReadOnlyPacket`]: bounds-checked typed readers with
//! big-endian, little-endian and host-order variants, cursor movement, and
//! a hex dump for diagnostics. Every operation that would leave the legal
//! `[0, MAX_PACKET_SIZE]` window, or read past the current size, fails with
//! a [`PacketError`] carrying a snapshot of the buffer.

use bytes::Bytes;

use crate::codec::{self, Encoding};
use crate::error::PacketError;

/// Maximum number of bytes in a packet.
pub const MAX_PACKET_SIZE: usize = 16384;

/// Decode `bytes` up to the first null terminator, collapsing codec errors
/// to the empty string (the wire-level convention; callers that need the
/// distinction use [`crate::codec`] directly).
pub(crate) fn wire_string(encoding: Encoding, bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    codec::from_encoding(encoding, &bytes[..end]).unwrap_or_default()
}

pub trait PacketRead {
    /// The valid bytes of the packet, `[0, size)`.
    fn data(&self) -> &[u8];

    /// Current position in the packet.
    fn tell(&self) -> u32;

    /// Move the cursor without any bounds check. Prefer [`PacketRead::seek`].
    fn set_position(&mut self, position: u32);

    /// Number of bytes in the packet.
    fn size(&self) -> u32 {
        // Packet data never exceeds MAX_PACKET_SIZE, so sizes and
        // positions convert losslessly between u32 and usize.
        self.data().len() as u32
    }

    /// Number of bytes between the current position and the size.
    fn left(&self) -> u32 {
        self.size().saturating_sub(self.tell())
    }

    /// Fixed capacity of any packet.
    fn capacity(&self) -> u32 {
        MAX_PACKET_SIZE as u32
    }

    fn bounds_error(&self, message: impl Into<String>) -> PacketError
    where
        Self: Sized,
    {
        PacketError::new(message, self.tell(), self.size(), self.dump())
    }

    /// Seek to `position` bytes from the beginning of the packet.
    fn seek(&mut self, position: u32) -> Result<(), PacketError>
    where
        Self: Sized,
    {
        if position as usize > MAX_PACKET_SIZE {
            return Err(self.bounds_error(format!(
                "attempted to seek to {position}, past the maximum packet size"
            )));
        }

        self.set_position(position);
        Ok(())
    }

    /// Advance the cursor by `count` bytes.
    fn skip(&mut self, count: u32) -> Result<(), PacketError>
    where
        Self: Sized,
    {
        if count == 0 {
            return Ok(());
        }

        let target = u64::from(self.tell()) + u64::from(count);

        if target > MAX_PACKET_SIZE as u64 {
            return Err(self.bounds_error(format!(
                "attempted to skip {count} bytes, past the maximum packet size"
            )));
        }

        self.set_position(target as u32);
        Ok(())
    }

    /// Move the cursor back to the beginning of the packet.
    fn rewind(&mut self) {
        self.set_position(0);
    }

    /// Move the cursor back by `count` bytes.
    fn rewind_by(&mut self, count: u32) -> Result<(), PacketError>
    where
        Self: Sized,
    {
        let position = self.tell();

        if count > position {
            return Err(self.bounds_error(format!(
                "attempted to rewind {count} bytes, past the beginning of the packet"
            )));
        }

        self.set_position(position - count);
        Ok(())
    }

    /// Set the cursor to the end of the packet so `tell() == size()`.
    fn end(&mut self) {
        let size = self.size();
        self.set_position(size);
    }

    fn read_bytes<const N: usize>(&mut self) -> Result<[u8; N], PacketError>
    where
        Self: Sized,
    {
        let position = self.tell() as usize;

        if u64::from(self.left()) < N as u64 {
            return Err(self.bounds_error(format!("attempted to read {N} bytes past the end")));
        }

        let mut out = [0u8; N];
        out.copy_from_slice(&self.data()[position..position + N]);
        self.set_position((position + N) as u32);
        Ok(out)
    }

    fn peek_bytes<const N: usize>(&self) -> Result<[u8; N], PacketError>
    where
        Self: Sized,
    {
        let position = self.tell() as usize;

        if u64::from(self.left()) < N as u64 {
            return Err(self.bounds_error(format!("attempted to peek {N} bytes past the end")));
        }

        let mut out = [0u8; N];
        out.copy_from_slice(&self.data()[position..position + N]);
        Ok(out)
    }

    /// Read `count` bytes into a fresh vector.
    fn read_array(&mut self, count: u32) -> Result<Vec<u8>, PacketError>
    where
        Self: Sized,
    {
        let position = self.tell() as usize;

        if u64::from(self.left()) < u64::from(count) {
            return Err(
                self.bounds_error(format!("attempted to read {count} bytes past the end"))
            );
        }

        let count = count as usize;
        let out = self.data()[position..position + count].to_vec();
        self.set_position((position + count) as u32);
        Ok(out)
    }

    /// Read exactly `buffer.len()` bytes into caller storage.
    fn read_into(&mut self, buffer: &mut [u8]) -> Result<(), PacketError>
    where
        Self: Sized,
    {
        let position = self.tell() as usize;

        if u64::from(self.left()) < buffer.len() as u64 {
            return Err(self.bounds_error(format!(
                "attempted to read {} bytes past the end",
                buffer.len()
            )));
        }

        buffer.copy_from_slice(&self.data()[position..position + buffer.len()]);
        self.set_position((position + buffer.len()) as u32);
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8, PacketError>
    where
        Self: Sized,
    {
        Ok(self.read_bytes::<1>()?[0])
    }

    fn read_s8(&mut self) -> Result<i8, PacketError>
    where
        Self: Sized,
    {
        Ok(self.read_bytes::<1>()?[0] as i8)
    }

    fn peek_u8(&self) -> Result<u8, PacketError>
    where
        Self: Sized,
    {
        Ok(self.peek_bytes::<1>()?[0])
    }

    // 16-bit readers. The unsuffixed variants are host byte order.

    fn read_u16(&mut self) -> Result<u16, PacketError>
    where
        Self: Sized,
    {
        Ok(u16::from_ne_bytes(self.read_bytes()?))
    }

    fn read_u16_be(&mut self) -> Result<u16, PacketError>
    where
        Self: Sized,
    {
        Ok(u16::from_be_bytes(self.read_bytes()?))
    }

    fn read_u16_le(&mut self) -> Result<u16, PacketError>
    where
        Self: Sized,
    {
        Ok(u16::from_le_bytes(self.read_bytes()?))
    }

    fn read_s16(&mut self) -> Result<i16, PacketError>
    where
        Self: Sized,
    {
        Ok(i16::from_ne_bytes(self.read_bytes()?))
    }

    fn read_s16_be(&mut self) -> Result<i16, PacketError>
    where
        Self: Sized,
    {
        Ok(i16::from_be_bytes(self.read_bytes()?))
    }

    fn read_s16_le(&mut self) -> Result<i16, PacketError>
    where
        Self: Sized,
    {
        Ok(i16::from_le_bytes(self.read_bytes()?))
    }

    fn peek_u16(&self) -> Result<u16, PacketError>
    where
        Self: Sized,
    {
        Ok(u16::from_ne_bytes(self.peek_bytes()?))
    }

    fn peek_u16_be(&self) -> Result<u16, PacketError>
    where
        Self: Sized,
    {
        Ok(u16::from_be_bytes(self.peek_bytes()?))
    }

    fn peek_u16_le(&self) -> Result<u16, PacketError>
    where
        Self: Sized,
    {
        Ok(u16::from_le_bytes(self.peek_bytes()?))
    }

    // 32-bit readers.

    fn read_u32(&mut self) -> Result<u32, PacketError>
    where
        Self: Sized,
    {
        Ok(u32::from_ne_bytes(self.read_bytes()?))
    }

    fn read_u32_be(&mut self) -> Result<u32, PacketError>
    where
        Self: Sized,
    {
        Ok(u32::from_be_bytes(self.read_bytes()?))
    }

    fn read_u32_le(&mut self) -> Result<u32, PacketError>
    where
        Self: Sized,
    {
        Ok(u32::from_le_bytes(self.read_bytes()?))
    }

    fn read_s32(&mut self) -> Result<i32, PacketError>
    where
        Self: Sized,
    {
        Ok(i32::from_ne_bytes(self.read_bytes()?))
    }

    fn read_s32_be(&mut self) -> Result<i32, PacketError>
    where
        Self: Sized,
    {
        Ok(i32::from_be_bytes(self.read_bytes()?))
    }

    fn read_s32_le(&mut self) -> Result<i32, PacketError>
    where
        Self: Sized,
    {
        Ok(i32::from_le_bytes(self.read_bytes()?))
    }

    fn peek_u32(&self) -> Result<u32, PacketError>
    where
        Self: Sized,
    {
        Ok(u32::from_ne_bytes(self.peek_bytes()?))
    }

    fn peek_u32_be(&self) -> Result<u32, PacketError>
    where
        Self: Sized,
    {
        Ok(u32::from_be_bytes(self.peek_bytes()?))
    }

    fn peek_u32_le(&self) -> Result<u32, PacketError>
    where
        Self: Sized,
    {
        Ok(u32::from_le_bytes(self.peek_bytes()?))
    }

    // 64-bit readers.

    fn read_u64(&mut self) -> Result<u64, PacketError>
    where
        Self: Sized,
    {
        Ok(u64::from_ne_bytes(self.read_bytes()?))
    }

    fn read_u64_be(&mut self) -> Result<u64, PacketError>
    where
        Self: Sized,
    {
        Ok(u64::from_be_bytes(self.read_bytes()?))
    }

    fn read_u64_le(&mut self) -> Result<u64, PacketError>
    where
        Self: Sized,
    {
        Ok(u64::from_le_bytes(self.read_bytes()?))
    }

    fn read_s64(&mut self) -> Result<i64, PacketError>
    where
        Self: Sized,
    {
        Ok(i64::from_ne_bytes(self.read_bytes()?))
    }

    fn read_s64_be(&mut self) -> Result<i64, PacketError>
    where
        Self: Sized,
    {
        Ok(i64::from_be_bytes(self.read_bytes()?))
    }

    fn read_s64_le(&mut self) -> Result<i64, PacketError>
    where
        Self: Sized,
    {
        Ok(i64::from_le_bytes(self.read_bytes()?))
    }

    /// Floats travel as raw IEEE-754 bit patterns in host byte order only.
    fn read_f32(&mut self) -> Result<f32, PacketError>
    where
        Self: Sized,
    {
        Ok(f32::from_ne_bytes(self.read_bytes()?))
    }

    /// Read a null-terminated string in `encoding`. The terminator is
    /// consumed but not part of the result.
    fn read_string(&mut self, encoding: Encoding) -> Result<String, PacketError>
    where
        Self: Sized,
    {
        let position = self.tell() as usize;
        let data = self.data();

        let Some(terminator) = data[position.min(data.len())..]
            .iter()
            .position(|&b| b == 0)
        else {
            return Err(self.bounds_error("unterminated string"));
        };

        let bytes = self.read_array((terminator + 1) as u32)?;
        Ok(wire_string(encoding, &bytes))
    }

    /// Read a string whose encoded byte length (including any terminator)
    /// is prefixed as a host-order u16.
    fn read_string16(&mut self, encoding: Encoding) -> Result<String, PacketError>
    where
        Self: Sized,
    {
        let size = self.read_u16()?;
        let bytes = self.read_array(u32::from(size))?;
        Ok(wire_string(encoding, &bytes))
    }

    fn read_string16_be(&mut self, encoding: Encoding) -> Result<String, PacketError>
    where
        Self: Sized,
    {
        let size = self.read_u16_be()?;
        let bytes = self.read_array(u32::from(size))?;
        Ok(wire_string(encoding, &bytes))
    }

    fn read_string16_le(&mut self, encoding: Encoding) -> Result<String, PacketError>
    where
        Self: Sized,
    {
        let size = self.read_u16_le()?;
        let bytes = self.read_array(u32::from(size))?;
        Ok(wire_string(encoding, &bytes))
    }

    /// Read a string whose encoded byte length (including any terminator)
    /// is prefixed as a host-order u32.
    fn read_string32(&mut self, encoding: Encoding) -> Result<String, PacketError>
    where
        Self: Sized,
    {
        let size = self.read_u32()?;
        let bytes = self.read_array(size)?;
        Ok(wire_string(encoding, &bytes))
    }

    fn read_string32_be(&mut self, encoding: Encoding) -> Result<String, PacketError>
    where
        Self: Sized,
    {
        let size = self.read_u32_be()?;
        let bytes = self.read_array(size)?;
        Ok(wire_string(encoding, &bytes))
    }

    fn read_string32_le(&mut self, encoding: Encoding) -> Result<String, PacketError>
    where
        Self: Sized,
    {
        let size = self.read_u32_le()?;
        let bytes = self.read_array(size)?;
        Ok(wire_string(encoding, &bytes))
    }

    /// Hex dump of the packet: 16 bytes per line in two 8-byte groups, a
    /// `{..}` marker around the byte at the cursor, printable ASCII on the
    /// right with everything else as a dot.
    fn dump(&self) -> String {
        let data = self.data();
        let position = self.tell() as usize;

        if data.is_empty() {
            return String::new();
        }

        let cell = |out: &mut String, i: usize| {
            if i >= data.len() {
                out.push_str(if position == i { "  }" } else { "   " });
            } else if position == i {
                out.push_str(&format!("{:02X}}}", data[i]));
            } else if position == i + 1 {
                out.push_str(&format!("{:02X}{{", data[i]));
            } else {
                out.push_str(&format!("{:02X} ", data[i]));
            }
        };

        let ascii = |out: &mut String, from: usize, to: usize| {
            for &value in &data[from.min(data.len())..to.min(data.len())] {
                out.push(if (0x20..0x7f).contains(&value) {
                    value as char
                } else {
                    '.'
                });
            }
        };

        let mut lines = Vec::new();
        let mut line = 0usize;

        while line < data.len() {
            let mut out = String::with_capacity(75);
            out.push_str(&format!("{line:04X}"));
            out.push_str(if position == line { " {" } else { "  " });

            for i in line..line + 8 {
                cell(&mut out, i);
            }

            out.push(if position == line + 8 { '}' } else { ' ' });

            for i in line + 8..line + 16 {
                cell(&mut out, i);
            }

            out.push(' ');
            ascii(&mut out, line, line + 8);
            out.push(' ');
            ascii(&mut out, line + 8, line + 16);

            lines.push(out);
            line += 16;
        }

        lines.join("\n")
    }

    /// Log the hex dump.
    fn hex_dump(&self) {
        tracing::info!("packet dump:\n{}", self.dump());
    }
}

/// Immutable view over packet bytes with its own cursor.
///
/// The backing storage is reference counted: [`ReadOnlyPacket::view`] and
/// [`Clone`] share it without copying, so a frame can be broadcast to many
/// connections or carved into per-command bodies cheaply. Once created the
/// bytes never change, which makes the view safe to hand to worker threads.
#[derive(Debug, Clone, Default)]
pub struct ReadOnlyPacket {
    position: u32,
    data: Bytes,
}

impl ReadOnlyPacket {
    pub fn new() -> ReadOnlyPacket {
        ReadOnlyPacket::default()
    }

    pub(crate) fn from_parts(position: u32, data: Bytes) -> ReadOnlyPacket {
        ReadOnlyPacket { position, data }
    }

    /// A new packet sharing this packet's storage, restricted to
    /// `[start, start + size)` and rewound.
    pub fn view(&self, start: u32, size: u32) -> Result<ReadOnlyPacket, PacketError> {
        if u64::from(start) + u64::from(size) > u64::from(self.size()) {
            return Err(self.bounds_error(format!(
                "attempted to view {size} bytes at {start}, past the end"
            )));
        }

        let start = start as usize;
        let size = size as usize;
        Ok(ReadOnlyPacket {
            position: 0,
            data: self.data.slice(start..start + size),
        })
    }

    /// Direct access to the underlying bytes, cursor ignored.
    pub fn const_data(&self) -> &[u8] {
        &self.data
    }
}

impl PacketRead for ReadOnlyPacket {
    fn data(&self) -> &[u8] {
        &self.data
    }

    fn tell(&self) -> u32 {
        self.position
    }

    fn set_position(&mut self, position: u32) {
        self.position = position;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn packet(data: &[u8]) -> ReadOnlyPacket {
        ReadOnlyPacket::from_parts(0, Bytes::copy_from_slice(data))
    }

    #[test]
    fn test_cursor_arithmetic() {
        let mut p = packet(b"abcdef");
        assert_eq!(p.size(), 6);
        assert_eq!(p.tell(), 0);
        assert_eq!(p.left(), 6);

        p.skip(4).unwrap();
        assert_eq!(p.tell(), 4);
        assert_eq!(p.left(), 2);

        p.rewind_by(1).unwrap();
        assert_eq!(p.tell(), 3);

        p.end();
        assert_eq!(p.tell(), 6);
        assert_eq!(p.left(), 0);

        p.rewind();
        assert_eq!(p.tell(), 0);
    }

    #[test]
    fn test_seek_bounds() {
        let mut p = packet(b"ab");

        // Seeking is bounded by the maximum packet size, not the data size.
        p.seek(100).unwrap();
        assert_eq!(p.left(), 0);

        assert!(p.seek(MAX_PACKET_SIZE as u32 + 1).is_err());
        assert!(p.rewind_by(200).is_err());
    }

    #[test]
    fn test_read_past_end() {
        let mut p = packet(b"abc");
        let err = p.read_u32_le().unwrap_err();
        assert_eq!(err.position(), 0);
        assert_eq!(err.size(), 3);
        assert!(!err.snapshot().is_empty());
    }

    #[test]
    fn test_endian_variants() {
        let mut p = packet(&[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(p.peek_u32_be().unwrap(), 0x0102_0304);
        assert_eq!(p.peek_u32_le().unwrap(), 0x0403_0201);
        assert_eq!(p.read_u16_be().unwrap(), 0x0102);
        assert_eq!(p.read_u16_le().unwrap(), 0x0403);
        assert_eq!(p.left(), 0);
    }

    #[test]
    fn test_peek_does_not_advance() {
        let p = packet(&[0xff, 0x00]);
        assert_eq!(p.peek_u8().unwrap(), 0xff);
        assert_eq!(p.peek_u16_le().unwrap(), 0x00ff);
        assert_eq!(p.tell(), 0);
    }

    #[test]
    fn test_read_array_and_into() {
        let mut p = packet(b"hello world");
        assert_eq!(p.read_array(5).unwrap(), b"hello");

        let mut buffer = [0u8; 6];
        p.read_into(&mut buffer).unwrap();
        assert_eq!(&buffer, b" world");
        assert!(p.read_array(1).is_err());
    }

    #[test]
    fn test_read_string_null_terminated() {
        let mut p = packet(b"first\0second\0");
        assert_eq!(p.read_string(Encoding::Utf8).unwrap(), "first");
        assert_eq!(p.read_string(Encoding::Utf8).unwrap(), "second");
        assert_eq!(p.left(), 0);
    }

    #[test]
    fn test_read_string_unterminated() {
        let mut p = packet(b"no terminator");
        assert!(p.read_string(Encoding::Utf8).is_err());
    }

    #[rstest]
    #[case::be(&[0x00, 0x00, 0x00, 0x02, b'h', b'i'])]
    fn test_read_string32_be(#[case] data: &[u8]) {
        let mut p = packet(data);
        assert_eq!(p.read_string32_be(Encoding::Utf8).unwrap(), "hi");
        assert_eq!(p.left(), 0);
    }

    #[test]
    fn test_view_shares_storage() {
        let p = packet(b"0123456789");
        let mut view = p.view(2, 4).unwrap();
        assert_eq!(view.size(), 4);
        assert_eq!(view.read_array(4).unwrap(), b"2345");
        assert!(p.view(8, 3).is_err());
    }

    #[test]
    fn test_dump_marker() {
        let mut p = packet(b"ABCDEFGHIJKLMNOPQR");
        p.seek(1).unwrap();

        let dump = p.dump();
        let mut lines = dump.lines();
        let first = lines.next().unwrap();

        // Two lines for 18 bytes, marker braces around the cursor byte.
        assert_eq!(dump.lines().count(), 2);
        assert!(first.starts_with("0000"));
        assert!(first.contains("41{42}43"));
        assert!(first.ends_with("ABCDEFGH IJKLMNOP"));
    }
}
