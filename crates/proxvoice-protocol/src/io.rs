//! Big-endian byte cursor used by every packet body.
//!
//! UUIDs travel as two 64-bit halves (most significant first), int lists as
//! an `i32` count followed by `i32` items, strings as a `u16` byte length
//! followed by UTF-8.

use bytes::{BufMut, BytesMut};
use uuid::Uuid;

use crate::error::ProtocolError;

/// Symmetric binary encoding for a message or a nested structure.
pub trait Wire: Sized {
    fn write(&self, w: &mut Writer);

    fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError>;
}

/// Helper for reading binary data with automatic cursor advancement.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos.checked_add(len).ok_or(ProtocolError::PacketTooShort {
            expected: usize::MAX,
            got: self.data.len(),
        })?;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or(ProtocolError::PacketTooShort {
                expected: end,
                got: self.data.len(),
            })?;
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, ProtocolError> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::InvalidValue {
                field: "bool",
                value: u64::from(other),
            }),
        }
    }

    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    pub fn read_uuid(&mut self) -> Result<Uuid, ProtocolError> {
        let most = self.read_u64()?;
        let least = self.read_u64()?;
        Ok(Uuid::from_u128((u128::from(most) << 64) | u128::from(least)))
    }

    /// `u32` length followed by raw bytes.
    pub fn read_byte_array(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_int_list(&mut self) -> Result<Vec<i32>, ProtocolError> {
        let count = self.read_count(4)?;
        (0..count).map(|_| self.read_i32()).collect()
    }

    pub fn read_list<T: Wire>(&mut self) -> Result<Vec<T>, ProtocolError> {
        let count = self.read_count(1)?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(T::read(self)?);
        }
        Ok(items)
    }

    /// A bool presence flag followed by the value.
    pub fn read_optional<T>(
        &mut self,
        read: impl FnOnce(&mut Self) -> Result<T, ProtocolError>,
    ) -> Result<Option<T>, ProtocolError> {
        if self.read_bool()? {
            Ok(Some(read(self)?))
        } else {
            Ok(None)
        }
    }

    /// Reads an `i32` element count and rejects counts that cannot fit in the
    /// remaining bytes, so a hostile prefix cannot force a huge allocation.
    fn read_count(&mut self, min_item_size: usize) -> Result<usize, ProtocolError> {
        let count = self.read_i32()?;
        if count < 0 {
            return Err(ProtocolError::InvalidLength(i64::from(count)));
        }
        let count = count as usize;
        if count.saturating_mul(min_item_size) > self.remaining().len() {
            return Err(ProtocolError::PacketTooShort {
                expected: self.pos.saturating_add(count.saturating_mul(min_item_size)),
                got: self.data.len(),
            });
        }
        Ok(count)
    }

    #[must_use]
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Fails if any bytes are left unread.
    pub fn finish(&self) -> Result<(), ProtocolError> {
        match self.remaining().len() {
            0 => Ok(()),
            n => Err(ProtocolError::TrailingBytes(n)),
        }
    }
}

/// Helper for building binary payloads.
#[derive(Default)]
pub struct Writer {
    buf: BytesMut,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.put_u16(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buf.put_u32(value.to_bits());
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    /// Strings longer than `u16::MAX` bytes are cut at a char boundary.
    pub fn write_string(&mut self, s: &str) {
        let mut end = s.len().min(u16::MAX as usize);
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        self.buf.put_u16(end as u16);
        self.buf.put_slice(&s.as_bytes()[..end]);
    }

    pub fn write_uuid(&mut self, id: &Uuid) {
        let value = id.as_u128();
        self.buf.put_u64((value >> 64) as u64);
        self.buf.put_u64(value as u64);
    }

    pub fn write_byte_array(&mut self, bytes: &[u8]) {
        self.buf.put_u32(bytes.len() as u32);
        self.buf.put_slice(bytes);
    }

    pub fn write_int_list(&mut self, values: &[i32]) {
        self.buf.put_i32(values.len() as i32);
        for value in values {
            self.buf.put_i32(*value);
        }
    }

    pub fn write_list<T: Wire>(&mut self, items: &[T]) {
        self.buf.put_i32(items.len() as i32);
        for item in items {
            item.write(self);
        }
    }

    pub fn write_optional<T>(&mut self, value: Option<&T>, write: impl FnOnce(&mut Self, &T)) {
        self.write_bool(value.is_some());
        if let Some(value) = value {
            write(self, value);
        }
    }

    pub fn position(&self) -> usize {
        self.buf.len()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}
