//! Fixed-width index (HED) records.

use crate::binary::{BinaryReader, BinaryWriter};
use crate::error::{PatchError, Result};
use log::{debug, info};
use std::fs;
use std::path::Path;

pub const RECORD_SIZE: usize = 0x20;

pub type ContentHash = [u8; 16];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub hash: ContentHash,
    pub actual_length: i32,
    pub stored_length: i32,
    pub offset: i64,
}

impl IndexEntry {
    pub fn read(reader: &mut BinaryReader<'_>) -> Result<Self> {
        Ok(Self {
            hash: reader.read_array::<16>()?,
            actual_length: reader.read_i32()?,
            stored_length: reader.read_i32()?,
            offset: reader.read_i64()?,
        })
    }

    pub fn write(&self, writer: &mut BinaryWriter) -> Result<()> {
        writer.write_bytes(&self.hash)?;
        writer.write_i32(self.actual_length)?;
        writer.write_i32(self.stored_length)?;
        writer.write_i64(self.offset)
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// Byte range of this entry inside a blob of `blob_length` bytes.
    pub fn range(&self, blob_length: u64) -> Result<std::ops::Range<usize>> {
        let start = u64::try_from(self.offset).map_err(|_| {
            PatchError::malformed(format!("{}: negative offset {}", self.hash_hex(), self.offset))
        })?;
        let length = u64::try_from(self.stored_length).map_err(|_| {
            PatchError::malformed(format!(
                "{}: negative stored length {}",
                self.hash_hex(),
                self.stored_length
            ))
        })?;
        if start + length > blob_length {
            return Err(PatchError::malformed(format!(
                "{}: entry 0x{:X}+0x{:X} runs past blob end 0x{:X}",
                self.hash_hex(),
                start,
                length,
                blob_length
            )));
        }
        Ok(start as usize..(start + length) as usize)
    }
}

pub fn parse_index(data: &[u8]) -> Result<Vec<IndexEntry>> {
    if data.len() % RECORD_SIZE != 0 {
        return Err(PatchError::malformed(format!(
            "index length {} is not a multiple of 0x{:X}",
            data.len(),
            RECORD_SIZE
        )));
    }

    let mut reader = BinaryReader::new(data);
    let mut entries = Vec::with_capacity(data.len() / RECORD_SIZE);
    while reader.remaining() > 0 {
        entries.push(IndexEntry::read(&mut reader)?);
    }
    debug!("parsed {} index records", entries.len());
    Ok(entries)
}

pub fn serialize_index(entries: &[IndexEntry]) -> Result<Vec<u8>> {
    let mut writer = BinaryWriter::with_capacity(entries.len() * RECORD_SIZE);
    for entry in entries {
        entry.write(&mut writer)?;
    }
    Ok(writer.into_inner())
}

pub fn read_index_file<P: AsRef<Path>>(path: P) -> Result<Vec<IndexEntry>> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(PatchError::NotFound(format!("index {}", path.display())));
    }
    let data = fs::read(path)?;
    info!("Index {}: {} bytes", path.display(), data.len());
    parse_index(&data)
}

pub fn content_hash(name: &str) -> ContentHash {
    md5::compute(name.as_bytes()).0
}
