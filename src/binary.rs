use crate::error::{PatchError, Result};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, warn};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

/// Little-endian cursor over an in-memory buffer.
pub struct BinaryReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> BinaryReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    pub fn at(data: &'a [u8], position: usize) -> Result<Self> {
        let mut reader = Self::new(data);
        reader.seek(position)?;
        Ok(reader)
    }

    pub fn len(&self) -> usize {
        self.cursor.get_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn position(&self) -> usize {
        self.cursor.position() as usize
    }

    pub fn remaining(&self) -> usize {
        self.len().saturating_sub(self.position())
    }

    pub fn seek(&mut self, position: usize) -> Result<()> {
        if position > self.len() {
            return Err(PatchError::malformed(format!(
                "seek to {} beyond buffer of {} bytes",
                position,
                self.len()
            )));
        }
        self.cursor.seek(SeekFrom::Start(position as u64))?;
        Ok(())
    }

    pub fn skip(&mut self, count: usize) -> Result<()> {
        self.seek(self.position() + count)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.cursor.read_u8()?)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(self.cursor.read_u16::<LittleEndian>()?)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(self.cursor.read_u32::<LittleEndian>()?)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.cursor.read_i32::<LittleEndian>()?)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.cursor.read_i64::<LittleEndian>()?)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buffer = [0u8; N];
        self.cursor.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8]> {
        let start = self.position();
        if count > self.remaining() {
            warn!(
                "read_bytes: wanted {} bytes at {}, only {} available",
                count,
                start,
                self.remaining()
            );
            return Err(PatchError::malformed(format!(
                "truncated read of {} bytes at offset {}",
                count, start
            )));
        }
        let data: &'a [u8] = *self.cursor.get_ref();
        self.cursor.set_position((start + count) as u64);
        Ok(&data[start..start + count])
    }

    /// Reads a NUL-padded fixed-width string, decoded as Shift-JIS.
    pub fn read_fixed_string(&mut self, width: usize) -> Result<String> {
        let raw = self.read_bytes(width)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let (decoded, _, had_errors) = encoding_rs::SHIFT_JIS.decode(&raw[..end]);
        if had_errors {
            debug!("read_fixed_string: lossy decode of {:02X?}", &raw[..end]);
        }
        Ok(decoded.into_owned())
    }
}

/// Growable little-endian writer that can also patch already-written fields.
#[derive(Default)]
pub struct BinaryWriter {
    cursor: Cursor<Vec<u8>>,
}

impl BinaryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cursor: Cursor::new(Vec::with_capacity(capacity)),
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        let end = data.len() as u64;
        let mut cursor = Cursor::new(data);
        cursor.set_position(end);
        Self { cursor }
    }

    pub fn len(&self) -> usize {
        self.cursor.get_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn position(&self) -> usize {
        self.cursor.position() as usize
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        Ok(self.cursor.write_u8(value)?)
    }

    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        Ok(self.cursor.write_u16::<LittleEndian>(value)?)
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        Ok(self.cursor.write_u32::<LittleEndian>(value)?)
    }

    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        Ok(self.cursor.write_i32::<LittleEndian>(value)?)
    }

    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        Ok(self.cursor.write_i64::<LittleEndian>(value)?)
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        Ok(self.cursor.write_all(data)?)
    }

    pub fn write_fixed_string(&mut self, value: &str, width: usize) -> Result<()> {
        let (encoded, _, _) = encoding_rs::SHIFT_JIS.encode(value);
        let mut field = vec![0u8; width];
        let n = encoded.len().min(width);
        field[..n].copy_from_slice(&encoded[..n]);
        self.write_bytes(&field)
    }

    /// Appends `fill` bytes until the length is a multiple of `alignment`.
    pub fn pad_to(&mut self, alignment: usize, fill: u8) -> Result<()> {
        let target = align_up(self.len(), alignment);
        self.cursor.set_position(self.len() as u64);
        while self.len() < target {
            self.write_u8(fill)?;
        }
        Ok(())
    }

    pub fn patch_u32(&mut self, position: usize, value: u32) -> Result<()> {
        self.patch_slice(position, 4)?;
        LittleEndian::write_u32(&mut self.cursor.get_mut()[position..position + 4], value);
        Ok(())
    }

    fn patch_slice(&self, position: usize, width: usize) -> Result<()> {
        if position + width > self.len() {
            return Err(PatchError::malformed(format!(
                "patch of {} bytes at {} beyond buffer of {} bytes",
                width,
                position,
                self.len()
            )));
        }
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        self.cursor.get_ref()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.cursor.into_inner()
    }
}

pub fn align_up(value: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

pub fn read_u32_at(data: &[u8], position: usize) -> Result<u32> {
    BinaryReader::at(data, position)?.read_u32()
}

pub fn read_i64_at(data: &[u8], position: usize) -> Result<i64> {
    BinaryReader::at(data, position)?.read_i64()
}
