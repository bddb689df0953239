//! Alignment-aware byte cursors.
//!
//! Every multi-byte value on the wire sits at an offset that is a multiple of
//! its natural size, measured from the start of the message. The write side
//! zero-fills the gap, the read side skips it.

use bytes::{BufMut, BytesMut};

use crate::error::{Result, WireError};

const INITIAL_CAPACITY: usize = 256;

/// Byte order of a message, fixed by its first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

impl Endianness {
    /// Marker byte stored at offset 0 of every message.
    pub fn marker(self) -> u8 {
        match self {
            Endianness::Little => b'l',
            Endianness::Big => b'B',
        }
    }

    pub fn from_marker(byte: u8) -> Result<Self> {
        match byte {
            b'l' => Ok(Endianness::Little),
            b'B' => Ok(Endianness::Big),
            other => Err(WireError::InvalidEndianness(other)),
        }
    }
}

/// Number of zero bytes needed to move `offset` to a multiple of `alignment`.
pub fn padding_for(offset: usize, alignment: usize) -> usize {
    debug_assert!(matches!(alignment, 1 | 2 | 4 | 8));
    (alignment - offset % alignment) % alignment
}

/// Growable output buffer with a write position at its end.
#[derive(Debug)]
pub struct WriteCursor {
    buf: BytesMut,
    endian: Endianness,
}

macro_rules! write_fixed {
    ($name:ident, $ty:ty, $size:expr) => {
        #[doc = concat!("Align to ", stringify!($size), " and write a `", stringify!($ty), "`.")]
        pub fn $name(&mut self, value: $ty) {
            self.align($size);
            let bytes = match self.endian {
                Endianness::Little => value.to_le_bytes(),
                Endianness::Big => value.to_be_bytes(),
            };
            self.put_slice(&bytes);
        }
    };
}

impl WriteCursor {
    pub fn new(endian: Endianness) -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
            endian,
        }
    }

    pub fn endianness(&self) -> Endianness {
        self.endian
    }

    /// Current write offset, which is also the number of bytes written.
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    /// Zero-fill up to the next multiple of `alignment`.
    pub fn align(&mut self, alignment: usize) {
        let pad = padding_for(self.buf.len(), alignment);
        if pad > 0 {
            self.grow_for(pad);
            self.buf.put_bytes(0, pad);
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.grow_for(1);
        self.buf.put_u8(value);
    }

    write_fixed!(write_u16, u16, 2);
    write_fixed!(write_i16, i16, 2);
    write_fixed!(write_u32, u32, 4);
    write_fixed!(write_i32, i32, 4);
    write_fixed!(write_u64, u64, 8);
    write_fixed!(write_i64, i64, 8);
    write_fixed!(write_f64, f64, 8);

    /// Append raw bytes with no alignment.
    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.grow_for(bytes.len());
        self.buf.put_slice(bytes);
    }

    /// Align to 4 and write a zero `u32` to be filled in later. Returns its offset.
    pub fn reserve_u32(&mut self) -> usize {
        self.align(4);
        let offset = self.buf.len();
        self.put_slice(&[0; 4]);
        offset
    }

    /// Overwrite a placeholder written by [`WriteCursor::reserve_u32`].
    pub fn backpatch_u32(&mut self, offset: usize, value: u32) {
        let bytes = match self.endian {
            Endianness::Little => value.to_le_bytes(),
            Endianness::Big => value.to_be_bytes(),
        };
        self.buf[offset..offset + 4].copy_from_slice(&bytes);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> BytesMut {
        self.buf
    }

    // Double capacity on overflow so long messages cost O(log n) reallocations.
    fn grow_for(&mut self, additional: usize) {
        let needed = self.buf.len() + additional;
        if needed <= self.buf.capacity() {
            return;
        }
        let mut capacity = self.buf.capacity().max(INITIAL_CAPACITY);
        while capacity < needed {
            capacity *= 2;
        }
        self.buf.reserve(capacity - self.buf.len());
    }
}

/// Read position over a borrowed message buffer.
///
/// Offsets are absolute within `data`, so alignment is computed against the
/// start of the message even when decoding begins mid-buffer.
#[derive(Debug, Clone)]
pub struct ReadCursor<'a> {
    data: &'a [u8],
    pos: usize,
    endian: Endianness,
}

macro_rules! read_fixed {
    ($name:ident, $ty:ty, $size:expr) => {
        #[doc = concat!("Align to ", stringify!($size), " and read a `", stringify!($ty), "`.")]
        pub fn $name(&mut self) -> Result<$ty> {
            self.align($size)?;
            let bytes = self.take($size)?;
            let mut raw = [0u8; $size];
            raw.copy_from_slice(bytes);
            Ok(match self.endian {
                Endianness::Little => <$ty>::from_le_bytes(raw),
                Endianness::Big => <$ty>::from_be_bytes(raw),
            })
        }
    };
}

impl<'a> ReadCursor<'a> {
    pub fn new(data: &'a [u8], endian: Endianness) -> Self {
        Self::at(data, 0, endian)
    }

    /// Start reading at `pos` while keeping alignment relative to `data[0]`.
    pub fn at(data: &'a [u8], pos: usize, endian: Endianness) -> Self {
        Self { data, pos, endian }
    }

    pub fn endianness(&self) -> Endianness {
        self.endian
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Skip to the next multiple of `alignment`. Padding contents are ignored.
    pub fn align(&mut self, alignment: usize) -> Result<()> {
        let pad = padding_for(self.pos, alignment);
        self.take(pad).map(drop)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    read_fixed!(read_u16, u16, 2);
    read_fixed!(read_i16, i16, 2);
    read_fixed!(read_u32, u32, 4);
    read_fixed!(read_i32, i32, 4);
    read_fixed!(read_u64, u64, 8);
    read_fixed!(read_i64, i64, 8);
    read_fixed!(read_f64, f64, 8);

    /// Split off a cursor bounded to the next `len` bytes and advance past them.
    ///
    /// The returned cursor keeps absolute offsets, so alignment inside it
    /// still lines up with the message start.
    pub fn split_bounded(&mut self, len: usize) -> Result<ReadCursor<'a>> {
        let available = self.remaining();
        if len > available {
            return Err(WireError::BufferUnderrun {
                needed: len,
                available,
            });
        }
        let end = self.pos + len;
        let bounded = ReadCursor {
            data: &self.data[..end],
            pos: self.pos,
            endian: self.endian,
        };
        self.pos = end;
        Ok(bounded)
    }

    /// Consume exactly `len` bytes.
    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let available = self.remaining();
        if len > available {
            return Err(WireError::BufferUnderrun {
                needed: len,
                available,
            });
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.data[start..start + len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_math() {
        assert_eq!(padding_for(0, 8), 0);
        assert_eq!(padding_for(1, 4), 3);
        assert_eq!(padding_for(1, 8), 7);
        assert_eq!(padding_for(6, 2), 0);
        assert_eq!(padding_for(13, 1), 0);
    }

    #[test]
    fn byte_then_u32_pads_three() {
        let mut w = WriteCursor::new(Endianness::Little);
        w.write_u8(0xAA);
        w.write_u32(1);
        assert_eq!(w.as_slice(), &[0xAA, 0, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn byte_then_i64_pads_seven() {
        let mut w = WriteCursor::new(Endianness::Big);
        w.write_u8(1);
        w.write_i64(-2);
        assert_eq!(w.position(), 16);
        assert_eq!(&w.as_slice()[1..8], &[0; 7]);
        assert_eq!(&w.as_slice()[8..], &(-2i64).to_be_bytes());
    }

    #[test]
    fn reads_both_byte_orders() {
        for endian in [Endianness::Little, Endianness::Big] {
            let mut w = WriteCursor::new(endian);
            w.write_u8(7);
            w.write_i16(-300);
            w.write_u32(0xDEAD_BEEF);
            w.write_f64(2.5);
            let bytes = w.into_inner();

            let mut r = ReadCursor::new(&bytes, endian);
            assert_eq!(r.read_u8().unwrap(), 7);
            assert_eq!(r.read_i16().unwrap(), -300);
            assert_eq!(r.read_u32().unwrap(), 0xDEAD_BEEF);
            assert_eq!(r.read_f64().unwrap(), 2.5);
            assert_eq!(r.remaining(), 0);
        }
    }

    #[test]
    fn underrun_is_distinct() {
        let data = [1u8, 2];
        let mut r = ReadCursor::new(&data, Endianness::Little);
        let err = r.read_u32().unwrap_err();
        assert!(err.is_underrun());
        assert!(matches!(
            err,
            WireError::BufferUnderrun {
                needed: 4,
                available: 2
            }
        ));
    }

    #[test]
    fn alignment_relative_to_buffer_start() {
        let data = [0u8; 16];
        let mut r = ReadCursor::at(&data, 5, Endianness::Little);
        r.align(8).unwrap();
        assert_eq!(r.position(), 8);
    }

    #[test]
    fn backpatch_placeholder() {
        let mut w = WriteCursor::new(Endianness::Big);
        w.write_u8(1);
        let at = w.reserve_u32();
        assert_eq!(at, 4);
        w.write_u8(9);
        w.backpatch_u32(at, 0x0102_0304);
        assert_eq!(w.as_slice(), &[1, 0, 0, 0, 1, 2, 3, 4, 9]);
    }

    #[test]
    fn grows_geometrically() {
        let mut w = WriteCursor::new(Endianness::Little);
        w.put_slice(&[0u8; INITIAL_CAPACITY + 1]);
        assert!(w.into_inner().capacity() >= INITIAL_CAPACITY * 2);
    }

    #[test]
    fn endianness_markers() {
        assert_eq!(Endianness::from_marker(b'l').unwrap(), Endianness::Little);
        assert_eq!(Endianness::from_marker(b'B').unwrap(), Endianness::Big);
        assert!(matches!(
            Endianness::from_marker(b'x'),
            Err(WireError::InvalidEndianness(b'x'))
        ));
    }
}
