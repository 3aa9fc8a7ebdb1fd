//! Binary cursor I/O over byte buffers.
//!
//! [`WriteCursor`] appends fixed-width big-endian values to a growable buffer
//! and supports reserving space for a value that is only known later (a
//! count or a change mask), plus rewinding to drop bytes that turned out to
//! be unnecessary. [`ReadCursor`] is its bounds-checked counterpart: every
//! read past the end of the input fails with [`CursorError::OutOfBounds`]
//! instead of producing garbage.

/// Errors produced by cursor reads and backfills.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CursorError {
    /// A read needed more bytes than remain in the input.
    #[error("read of {needed} bytes at offset {position} exceeds input ({remaining} remaining)")]
    OutOfBounds {
        /// Bytes the read required.
        needed: usize,
        /// Bytes left after the cursor.
        remaining: usize,
        /// Cursor offset at the time of the read.
        position: usize,
    },

    /// A reservation was backfilled after the cursor rewound past it.
    #[error("reservation at offset {offset} no longer exists (buffer length {len})")]
    StaleReservation {
        /// Offset of the reserved slot.
        offset: usize,
        /// Current buffer length.
        len: usize,
    },
}

// ---------------------------------------------------------------------------
// Reservations
// ---------------------------------------------------------------------------

/// Placeholder for a `u8` written later with [`WriteCursor::backfill_u8`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a reserved slot should be backfilled or rewound"]
pub struct ReservedU8 {
    offset: usize,
}

impl ReservedU8 {
    /// Offset of the reserved byte; rewinding here drops the slot.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// Placeholder for a `u32` written later with [`WriteCursor::backfill_u32`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a reserved slot should be backfilled or rewound"]
pub struct ReservedU32 {
    offset: usize,
}

impl ReservedU32 {
    /// Offset of the first reserved byte; rewinding here drops the slot.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

// ---------------------------------------------------------------------------
// WriteCursor
// ---------------------------------------------------------------------------

/// Growable big-endian byte writer.
///
/// The cursor position is always the end of the written data: rewinding
/// truncates.
#[derive(Debug, Clone, Default)]
pub struct WriteCursor {
    buf: Vec<u8>,
}

impl WriteCursor {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty writer with preallocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Current write offset (number of bytes written).
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    /// Drops everything written after `position`.
    pub fn rewind(&mut self, position: usize) {
        self.buf.truncate(position);
    }

    /// Written bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the writer and returns the written bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Writes a zero placeholder byte and returns its slot.
    pub fn space_u8(&mut self) -> ReservedU8 {
        let offset = self.buf.len();
        self.buf.push(0);
        ReservedU8 { offset }
    }

    /// Writes a zero placeholder `u32` and returns its slot.
    pub fn space_u32(&mut self) -> ReservedU32 {
        let offset = self.buf.len();
        self.buf.extend_from_slice(&[0; 4]);
        ReservedU32 { offset }
    }

    /// Fills a previously reserved byte.
    pub fn backfill_u8(&mut self, slot: ReservedU8, value: u8) -> Result<(), CursorError> {
        let len = self.buf.len();
        let byte = self
            .buf
            .get_mut(slot.offset)
            .ok_or(CursorError::StaleReservation {
                offset: slot.offset,
                len,
            })?;
        *byte = value;
        Ok(())
    }

    /// Fills a previously reserved `u32`.
    pub fn backfill_u32(&mut self, slot: ReservedU32, value: u32) -> Result<(), CursorError> {
        let len = self.buf.len();
        let bytes = self
            .buf
            .get_mut(slot.offset..slot.offset + 4)
            .ok_or(CursorError::StaleReservation {
                offset: slot.offset,
                len,
            })?;
        bytes.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ReadCursor
// ---------------------------------------------------------------------------

/// Bounds-checked big-endian reader over a byte slice.
#[derive(Debug, Clone)]
pub struct ReadCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ReadCursor<'a> {
    /// Creates a reader positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current read offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// `true` once every byte has been consumed.
    pub fn is_exhausted(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], CursorError> {
        let end = self.pos + N;
        let slice = self
            .data
            .get(self.pos..end)
            .ok_or(CursorError::OutOfBounds {
                needed: N,
                remaining: self.remaining(),
                position: self.pos,
            })?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        self.pos = end;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, CursorError> {
        Ok(u8::from_be_bytes(self.take::<1>()?))
    }

    pub fn read_u16(&mut self) -> Result<u16, CursorError> {
        Ok(u16::from_be_bytes(self.take::<2>()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, CursorError> {
        Ok(u32::from_be_bytes(self.take::<4>()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, CursorError> {
        Ok(f32::from_be_bytes(self.take::<4>()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, CursorError> {
        Ok(f64::from_be_bytes(self.take::<8>()?))
    }
}
