//! Primitive Wire Codec
//!
//! All multibyte integers on the wire are 4-byte big-endian two's-complement
//! values. Frame length words overload the most significant bit as a
//! "digest trailer follows" marker; [`set_length_flag`] and
//! [`clear_length_flag`] are the single encoding used everywhere for that
//! marker. Strings are UTF-8 with no terminator; payload boundaries carry
//! the length.

use crate::packet::PacketError;
use std::io::{Read, Write};

/// Mask covering the 31 value bits of a flagged length word.
pub const LENGTH_MASK: u32 = 0x7FFF_FFFF;

/// Flag bit signalling a digest trailer after the payload.
pub const LENGTH_FLAG: u32 = 0x8000_0000;

/// Serializes a signed 32-bit integer, most significant byte first.
pub fn write_i32<W: Write + ?Sized>(sink: &mut W, value: i32) -> Result<(), PacketError> {
    sink.write_all(&value.to_be_bytes())?;
    Ok(())
}

/// Reads a signed 32-bit integer, most significant byte first.
pub fn read_i32<R: Read + ?Sized>(source: &mut R) -> Result<i32, PacketError> {
    let mut buf = [0u8; 4];
    read_full(source, &mut buf)?;
    Ok(i32::from_be_bytes(buf))
}

/// Encodes a signed 32-bit integer into its 4 wire bytes.
pub fn i32_to_bytes(value: i32) -> [u8; 4] {
    value.to_be_bytes()
}

/// Decodes a signed 32-bit integer from exactly 4 wire bytes.
pub fn i32_from_slice(bytes: &[u8]) -> Result<i32, PacketError> {
    let array: [u8; 4] = bytes
        .try_into()
        .map_err(|_| PacketError::Malformed("integer field is not 4 bytes"))?;
    Ok(i32::from_be_bytes(array))
}

/// Adds the digest marker to a length word.
pub fn set_length_flag(value: i32) -> i32 {
    (value as u32 | LENGTH_FLAG) as i32
}

/// Strips the digest marker from a length word.
pub fn clear_length_flag(value: i32) -> i32 {
    (value as u32 & LENGTH_MASK) as i32
}

/// Whether a length word carries the digest marker.
pub fn has_length_flag(value: i32) -> bool {
    value < 0
}

/// Reads one byte, failing with unexpected-end at EOF.
pub fn read_byte<R: Read + ?Sized>(source: &mut R) -> Result<u8, PacketError> {
    let mut buf = [0u8; 1];
    read_full(source, &mut buf)?;
    Ok(buf[0])
}

/// Reads exactly `len` bytes, failing with unexpected-end if the source
/// runs out first.
pub fn read_exact_vec<R: Read + ?Sized>(source: &mut R, len: usize) -> Result<Vec<u8>, PacketError> {
    let mut buf = vec![0u8; len];
    read_full(source, &mut buf)?;
    Ok(buf)
}

/// Reads until `buf` is full, looping over short reads.
pub fn read_full<R: Read + ?Sized>(source: &mut R, buf: &mut [u8]) -> Result<(), PacketError> {
    let mut offset = 0;
    while offset < buf.len() {
        let n = source.read(&mut buf[offset..])?;
        if n == 0 {
            return Err(PacketError::UnexpectedEnd);
        }
        offset += n;
    }
    Ok(())
}

/// Reads and discards exactly `len` bytes.
pub fn skip_exact<R: Read + ?Sized>(source: &mut R, len: usize) -> Result<(), PacketError> {
    let mut remaining = len;
    let mut scratch = [0u8; 512];
    while remaining > 0 {
        let want = remaining.min(scratch.len());
        let n = source.read(&mut scratch[..want])?;
        if n == 0 {
            return Err(PacketError::UnexpectedEnd);
        }
        remaining -= n;
    }
    Ok(())
}

/// Decodes a UTF-8 string from payload bytes.
pub fn utf8_from_bytes(bytes: &[u8]) -> Result<String, PacketError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| PacketError::Malformed("payload is not UTF-8"))
}

/// Reader bounded to a fixed number of bytes of its inner source.
///
/// Envelope packets hand their inner decoder a clamped view of the outer
/// stream so a malformed inner frame cannot overrun the envelope body.
pub struct LengthClampedReader<R> {
    inner: R,
    remaining: usize,
}

impl<R: Read> LengthClampedReader<R> {
    pub fn new(inner: R, limit: usize) -> Self {
        LengthClampedReader {
            inner,
            remaining: limit,
        }
    }

    /// Bytes still readable before the clamp reports end of stream.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for LengthClampedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(self.remaining);
        let n = self.inner.read(&mut buf[..want])?;
        self.remaining -= n;
        Ok(n)
    }
}
