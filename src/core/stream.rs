//! # Bit Streams
//!
//! One field-declaration code path, three modes. Every packet declares its
//! fields once as a generic `serialize<S: Stream>` routine; the same routine
//! measures, writes and reads, so the write and read layouts cannot drift.
//!
//! - [`MeasureStream`]: counts the exact number of bits without writing
//! - [`WriteStream`]: packs bits LSB-first into a `BytesMut`
//! - [`ReadStream`]: bounds-checked reader over an untrusted `&[u8]`
//!
//! ## Bit Layout
//! Bit `n` of the stream is bit `n % 8` of byte `n / 8`. Byte arrays are
//! preceded by zero padding up to the next byte boundary. A finished stream is
//! padded with zero bits to a whole byte.
//!
//! ## Safety
//! Read mode never panics: truncation, non-zero padding, trailing bytes and
//! out-of-range bounded integers all surface as errors.

use bytes::{BufMut, Bytes, BytesMut};

use crate::config::MAX_PACKET_BYTES;
use crate::error::{constants, ProtocolError, Result};

/// Number of bits needed to encode any value in `[min, max]`
#[inline]
pub const fn bits_required(min: u32, max: u32) -> u32 {
    let range = max - min;
    if range == 0 {
        0
    } else {
        32 - range.leading_zeros()
    }
}

#[inline]
fn check_bits(value: u32, bits: u32) -> Result<()> {
    if bits < 32 && (value >> bits) != 0 {
        return Err(ProtocolError::ValueOutOfRange {
            value: u64::from(value),
            min: 0,
            max: (1u64 << bits) - 1,
        });
    }
    Ok(())
}

#[inline]
fn check_range(value: u32, min: u32, max: u32) -> Result<()> {
    if value < min || value > max {
        return Err(ProtocolError::ValueOutOfRange {
            value: u64::from(value),
            min: u64::from(min),
            max: u64::from(max),
        });
    }
    Ok(())
}

/// Serialization contract shared by the measure, write and read modes
pub trait Stream {
    /// True for [`WriteStream`]
    const IS_WRITING: bool;
    /// True for [`ReadStream`]; only in this mode are `value` arguments overwritten
    const IS_READING: bool;

    /// Serialize the low `bits` bits of `value` (`bits` ≤ 32)
    fn serialize_bits(&mut self, value: &mut u32, bits: u32) -> Result<()>;

    /// Pad with zero bits up to the next byte boundary
    fn serialize_align(&mut self) -> Result<()>;

    /// Serialize a byte array of exactly `data.len()` bytes, byte aligned
    fn serialize_bytes(&mut self, data: &mut [u8]) -> Result<()>;

    /// Bits measured, written or read so far
    fn bits_processed(&self) -> usize;

    fn serialize_bool(&mut self, value: &mut bool) -> Result<()> {
        let mut bit = u32::from(*value);
        self.serialize_bits(&mut bit, 1)?;
        if Self::IS_READING {
            *value = bit != 0;
        }
        Ok(())
    }

    fn serialize_u64(&mut self, value: &mut u64) -> Result<()> {
        let mut lo = *value as u32;
        let mut hi = (*value >> 32) as u32;
        self.serialize_bits(&mut lo, 32)?;
        self.serialize_bits(&mut hi, 32)?;
        if Self::IS_READING {
            *value = (u64::from(hi) << 32) | u64::from(lo);
        }
        Ok(())
    }

    /// Serialize an integer bounded to `[min, max]` using the minimal bit width.
    ///
    /// Out-of-range values are rejected in every mode, never wrapped.
    fn serialize_int(&mut self, value: &mut u32, min: u32, max: u32) -> Result<()> {
        debug_assert!(min <= max);
        if !Self::IS_READING {
            check_range(*value, min, max)?;
        }

        let mut offset = value.wrapping_sub(min);
        self.serialize_bits(&mut offset, bits_required(min, max))?;

        if Self::IS_READING {
            let decoded = min
                .checked_add(offset)
                .ok_or(ProtocolError::ValueOutOfRange {
                    value: u64::from(min) + u64::from(offset),
                    min: u64::from(min),
                    max: u64::from(max),
                })?;
            check_range(decoded, min, max)?;
            *value = decoded;
        }
        Ok(())
    }

    /// Serialize an index in `[0, count)`
    fn serialize_index(&mut self, index: &mut usize, count: usize) -> Result<()> {
        debug_assert!(count > 0 && count <= u32::MAX as usize);
        let max = (count - 1) as u32;
        let mut value = u32::try_from(*index).map_err(|_| ProtocolError::ValueOutOfRange {
            value: *index as u64,
            min: 0,
            max: u64::from(max),
        })?;
        self.serialize_int(&mut value, 0, max)?;
        if Self::IS_READING {
            *index = value as usize;
        }
        Ok(())
    }
}

/// Counts bits without producing output
#[derive(Debug, Default)]
pub struct MeasureStream {
    bits: usize,
}

impl MeasureStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encoded size in whole bytes, including final padding
    pub fn bytes_required(&self) -> usize {
        self.bits.div_ceil(8)
    }
}

impl Stream for MeasureStream {
    const IS_WRITING: bool = false;
    const IS_READING: bool = false;

    fn serialize_bits(&mut self, value: &mut u32, bits: u32) -> Result<()> {
        debug_assert!(bits <= 32);
        check_bits(*value, bits)?;
        self.bits += bits as usize;
        Ok(())
    }

    fn serialize_align(&mut self) -> Result<()> {
        self.bits += (8 - self.bits % 8) % 8;
        Ok(())
    }

    fn serialize_bytes(&mut self, data: &mut [u8]) -> Result<()> {
        self.serialize_align()?;
        self.bits += data.len() * 8;
        Ok(())
    }

    fn bits_processed(&self) -> usize {
        self.bits
    }
}

/// Packs bits into a bounded output buffer
#[derive(Debug)]
pub struct WriteStream {
    buf: BytesMut,
    scratch: u64,
    scratch_bits: u32,
    bits_written: usize,
    max_bytes: usize,
}

impl Default for WriteStream {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteStream {
    /// Stream limited to [`MAX_PACKET_BYTES`]
    pub fn new() -> Self {
        Self::with_limit(MAX_PACKET_BYTES)
    }

    pub fn with_limit(max_bytes: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(max_bytes.min(MAX_PACKET_BYTES)),
            scratch: 0,
            scratch_bits: 0,
            bits_written: 0,
            max_bytes,
        }
    }

    fn reserve_bits(&self, bits: usize) -> Result<()> {
        let needed = (self.bits_written + bits).div_ceil(8);
        if needed > self.max_bytes {
            return Err(ProtocolError::OversizedPacket(needed));
        }
        Ok(())
    }

    fn push_bits(&mut self, value: u32, bits: u32) {
        // scratch_bits stays below 8 between calls, so the shift fits in 64 bits
        self.scratch |= u64::from(value) << self.scratch_bits;
        self.scratch_bits += bits;
        self.bits_written += bits as usize;
        while self.scratch_bits >= 8 {
            self.buf.put_u8(self.scratch as u8);
            self.scratch >>= 8;
            self.scratch_bits -= 8;
        }
    }

    fn pad_to_byte(&mut self) {
        let rem = (self.bits_written % 8) as u32;
        if rem != 0 {
            self.push_bits(0, 8 - rem);
        }
    }

    /// Pad to a whole byte and hand out the encoded buffer
    pub fn finish(mut self) -> Bytes {
        self.pad_to_byte();
        self.buf.freeze()
    }
}

impl Stream for WriteStream {
    const IS_WRITING: bool = true;
    const IS_READING: bool = false;

    fn serialize_bits(&mut self, value: &mut u32, bits: u32) -> Result<()> {
        debug_assert!(bits <= 32);
        if bits == 0 {
            return Ok(());
        }
        check_bits(*value, bits)?;
        self.reserve_bits(bits as usize)?;
        self.push_bits(*value, bits);
        Ok(())
    }

    fn serialize_align(&mut self) -> Result<()> {
        self.pad_to_byte();
        Ok(())
    }

    fn serialize_bytes(&mut self, data: &mut [u8]) -> Result<()> {
        self.pad_to_byte();
        self.reserve_bits(data.len() * 8)?;
        self.buf.put_slice(data);
        self.bits_written += data.len() * 8;
        Ok(())
    }

    fn bits_processed(&self) -> usize {
        self.bits_written
    }
}

/// Bounds-checked reader over an untrusted datagram
#[derive(Debug)]
pub struct ReadStream<'a> {
    data: &'a [u8],
    bit_pos: usize,
}

impl<'a> ReadStream<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, bit_pos: 0 }
    }

    fn total_bits(&self) -> usize {
        self.data.len() * 8
    }

    fn read_bits(&mut self, bits: u32) -> Result<u32> {
        if self.bit_pos + bits as usize > self.total_bits() {
            return Err(ProtocolError::MalformedPacket(constants::ERR_TRUNCATED));
        }

        let mut value: u64 = 0;
        let mut read = 0u32;
        while read < bits {
            let byte = self.data[self.bit_pos / 8];
            let offset = (self.bit_pos % 8) as u32;
            let take = (8 - offset).min(bits - read);
            let chunk = (u64::from(byte) >> offset) & ((1u64 << take) - 1);
            value |= chunk << read;
            read += take;
            self.bit_pos += take as usize;
        }
        Ok(value as u32)
    }

    fn skip_padding(&mut self) -> Result<()> {
        let rem = (self.bit_pos % 8) as u32;
        if rem != 0 && self.read_bits(8 - rem)? != 0 {
            return Err(ProtocolError::MalformedPacket(constants::ERR_NONZERO_PADDING));
        }
        Ok(())
    }

    /// Consume the final padding and reject any trailing bytes
    pub fn finish(mut self) -> Result<()> {
        self.skip_padding()?;
        if self.bit_pos != self.total_bits() {
            return Err(ProtocolError::MalformedPacket(constants::ERR_TRAILING_BYTES));
        }
        Ok(())
    }
}

impl Stream for ReadStream<'_> {
    const IS_WRITING: bool = false;
    const IS_READING: bool = true;

    fn serialize_bits(&mut self, value: &mut u32, bits: u32) -> Result<()> {
        debug_assert!(bits <= 32);
        *value = if bits == 0 { 0 } else { self.read_bits(bits)? };
        Ok(())
    }

    fn serialize_align(&mut self) -> Result<()> {
        self.skip_padding()
    }

    fn serialize_bytes(&mut self, data: &mut [u8]) -> Result<()> {
        self.skip_padding()?;
        let start = self.bit_pos / 8;
        let end = start + data.len();
        let src = self
            .data
            .get(start..end)
            .ok_or(ProtocolError::MalformedPacket(constants::ERR_TRUNCATED))?;
        data.copy_from_slice(src);
        self.bit_pos = end * 8;
        Ok(())
    }

    fn bits_processed(&self) -> usize {
        self.bit_pos
    }
}
