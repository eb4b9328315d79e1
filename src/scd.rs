//! SCD audio container schema: global header, entry table and the
//! per-entry meta / aux / extradata blocks.

use crate::binary::{BinaryReader, BinaryWriter, read_u32_at};
use crate::error::{PatchError, Result};
use log::debug;

pub const MAGIC: &[u8; 8] = b"SEDBSSCF";
pub const TABLES_OFFSET_FIELD: usize = 0x0E;
pub const FILE_SIZE_FIELD: usize = 0x10;
pub const ENTRY_COUNT_FIELD: usize = 0x04;
pub const HEADERS_OFFSET_FIELD: usize = 0x0C;

pub const META_SIZE: usize = 0x20;
pub const VORBIS_EXTRADATA_SIZE: usize = 0x20;
pub const ADPCM_FORMAT_SIZE: usize = 0x32;
pub const AUX_HEADER_SIZE: usize = 0x14;
pub const ENTRY_ALIGNMENT: usize = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecId {
    Vorbis,
    MsAdpcm,
    Other(u32),
}

impl CodecId {
    pub fn from_u32(value: u32) -> Self {
        match value {
            0x6 => CodecId::Vorbis,
            0xC => CodecId::MsAdpcm,
            other => CodecId::Other(other),
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            CodecId::Vorbis => 0x6,
            CodecId::MsAdpcm => 0xC,
            CodecId::Other(other) => other,
        }
    }
}

/// Fixed 0x20-byte block at the start of every entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMeta {
    pub stream_size: u32,
    pub channels: u8,
    pub sample_rate: u32,
    pub codec: CodecId,
    pub loop_start: u32,
    pub loop_end: u32,
    pub extradata_size: u32,
    pub aux_count: u32,
    /// Bytes 0x05..0x08, carried through.
    pub reserved: [u8; 3],
}

impl EntryMeta {
    pub fn read(reader: &mut BinaryReader<'_>) -> Result<Self> {
        let stream_size = reader.read_u32()?;
        let channels = reader.read_u8()?;
        let reserved = reader.read_array::<3>()?;
        Ok(Self {
            stream_size,
            channels,
            reserved,
            sample_rate: reader.read_u32()?,
            codec: CodecId::from_u32(reader.read_u32()?),
            loop_start: reader.read_u32()?,
            loop_end: reader.read_u32()?,
            extradata_size: reader.read_u32()?,
            aux_count: reader.read_u32()?,
        })
    }

    pub fn write(&self, writer: &mut BinaryWriter) -> Result<()> {
        writer.write_u32(self.stream_size)?;
        writer.write_u8(self.channels)?;
        writer.write_bytes(&self.reserved)?;
        writer.write_u32(self.sample_rate)?;
        writer.write_u32(self.codec.as_u32())?;
        writer.write_u32(self.loop_start)?;
        writer.write_u32(self.loop_end)?;
        writer.write_u32(self.extradata_size)?;
        writer.write_u32(self.aux_count)
    }
}

/// `MARK` block: absolute loop samples plus mark positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxBlock {
    pub magic: [u8; 4],
    /// Declared size of the whole block; rebuilt blocks keep it.
    pub size: u32,
    pub loop_start: u32,
    pub loop_end: u32,
    pub marks: Vec<u32>,
}

impl AuxBlock {
    pub fn read(reader: &mut BinaryReader<'_>) -> Result<Self> {
        let start = reader.position();
        let magic = reader.read_array::<4>()?;
        let size = reader.read_u32()?;
        if (size as usize) < AUX_HEADER_SIZE || size as usize > reader.len() - start {
            return Err(PatchError::malformed(format!("aux block size 0x{:X}", size)));
        }
        let loop_start = reader.read_u32()?;
        let loop_end = reader.read_u32()?;
        let declared = reader.read_u32()? as usize;
        let capacity = (size as usize - AUX_HEADER_SIZE) / 4;
        let marks = (0..declared.min(capacity))
            .map(|_| reader.read_u32())
            .collect::<Result<Vec<_>>>()?;
        reader.seek(start + size as usize)?;
        Ok(Self {
            magic,
            size,
            loop_start,
            loop_end,
            marks,
        })
    }

    pub fn capacity(&self) -> usize {
        (self.size as usize).saturating_sub(AUX_HEADER_SIZE) / 4
    }

    pub fn write(&self, writer: &mut BinaryWriter) -> Result<()> {
        let start = writer.len();
        writer.write_bytes(&self.magic)?;
        writer.write_u32(self.size)?;
        writer.write_u32(self.loop_start)?;
        writer.write_u32(self.loop_end)?;
        let marks = &self.marks[..self.marks.len().min(self.capacity())];
        writer.write_u32(marks.len() as u32)?;
        for &mark in marks {
            writer.write_u32(mark)?;
        }
        while writer.len() < start + self.size as usize {
            writer.write_u8(0)?;
        }
        Ok(())
    }
}

/// Vorbis codec header block; unknown bytes ride along in `raw`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VorbisExtradata {
    pub raw: [u8; VORBIS_EXTRADATA_SIZE],
}

impl VorbisExtradata {
    const ENCRYPTION_KEY: usize = 0x02;
    const SEEK_TABLE_SIZE: usize = 0x10;
    const VORBIS_HEADER_SIZE: usize = 0x14;

    pub fn read(reader: &mut BinaryReader<'_>) -> Result<Self> {
        Ok(Self {
            raw: reader.read_array::<VORBIS_EXTRADATA_SIZE>()?,
        })
    }

    pub fn encryption_key(&self) -> u8 {
        self.raw[Self::ENCRYPTION_KEY]
    }

    pub fn seek_table_size(&self) -> u32 {
        u32::from_le_bytes(field(&self.raw, Self::SEEK_TABLE_SIZE))
    }

    pub fn vorbis_header_size(&self) -> u32 {
        u32::from_le_bytes(field(&self.raw, Self::VORBIS_HEADER_SIZE))
    }

    pub fn set_encryption_key(&mut self, key: u8) {
        self.raw[Self::ENCRYPTION_KEY] = key;
    }

    pub fn set_seek_table_size(&mut self, size: u32) {
        self.raw[Self::SEEK_TABLE_SIZE..Self::SEEK_TABLE_SIZE + 4]
            .copy_from_slice(&size.to_le_bytes());
    }

    pub fn set_vorbis_header_size(&mut self, size: u32) {
        self.raw[Self::VORBIS_HEADER_SIZE..Self::VORBIS_HEADER_SIZE + 4]
            .copy_from_slice(&size.to_le_bytes());
    }
}

fn field(raw: &[u8], offset: usize) -> [u8; 4] {
    [raw[offset], raw[offset + 1], raw[offset + 2], raw[offset + 3]]
}

/// One parsed entry.
#[derive(Debug, Clone)]
pub struct ScdEntry<'a> {
    pub meta: EntryMeta,
    pub aux: Option<AuxBlock>,
    /// Everything between the aux block and the audio stream.
    pub extradata: &'a [u8],
    /// Audio data after the extradata region, `stream_size` bytes when intact.
    pub stream: &'a [u8],
    pub raw: &'a [u8],
}

impl<'a> ScdEntry<'a> {
    pub fn parse(raw: &'a [u8]) -> Result<Self> {
        let mut reader = BinaryReader::new(raw);
        let meta = EntryMeta::read(&mut reader)?;
        let aux = if meta.aux_count > 0 {
            Some(AuxBlock::read(&mut reader)?)
        } else {
            None
        };
        let extradata = reader.read_bytes(meta.extradata_size as usize)?;
        let stream_end = (reader.position() + meta.stream_size as usize).min(raw.len());
        let stream = &raw[reader.position()..stream_end];
        debug!(
            "scd entry: {:?} codec, {} Hz, {} ch, stream 0x{:X}",
            meta.codec, meta.sample_rate, meta.channels, meta.stream_size
        );
        Ok(Self {
            meta,
            aux,
            extradata,
            stream,
            raw,
        })
    }

    pub fn vorbis_extradata(&self) -> Result<VorbisExtradata> {
        VorbisExtradata::read(&mut BinaryReader::new(self.extradata))
    }

    /// Offset of the extradata region inside the entry.
    pub fn extradata_offset(&self) -> usize {
        META_SIZE + self.aux.as_ref().map_or(0, |aux| aux.size as usize)
    }
}

/// A whole container with its entry offset table resolved.
#[derive(Debug, Clone)]
pub struct ScdFile<'a> {
    pub data: &'a [u8],
    pub tables_offset: usize,
    pub headers_offset: usize,
    pub entry_offsets: Vec<usize>,
}

impl<'a> ScdFile<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < FILE_SIZE_FIELD + 4 || &data[..MAGIC.len()] != MAGIC {
            return Err(PatchError::malformed("not an SCD container"));
        }

        let tables_offset = BinaryReader::at(data, TABLES_OFFSET_FIELD)?.read_u16()? as usize;
        let entry_count =
            BinaryReader::at(data, tables_offset + ENTRY_COUNT_FIELD)?.read_u16()? as usize;
        let headers_offset = read_u32_at(data, tables_offset + HEADERS_OFFSET_FIELD)? as usize;
        debug!(
            "scd: tables 0x{:X}, {} entries, headers 0x{:X}",
            tables_offset, entry_count, headers_offset
        );

        let mut reader = BinaryReader::at(data, headers_offset)?;
        let mut entry_offsets = Vec::with_capacity(entry_count);
        for index in 0..entry_count {
            let offset = reader.read_u32()? as usize;
            if offset >= data.len() || entry_offsets.last().is_some_and(|&prev| offset <= prev) {
                return Err(PatchError::malformed(format!(
                    "entry #{} offset 0x{:X} out of order or past EOF",
                    index, offset
                )));
            }
            entry_offsets.push(offset);
        }

        Ok(Self {
            data,
            tables_offset,
            headers_offset,
            entry_offsets,
        })
    }

    pub fn entry_count(&self) -> usize {
        self.entry_offsets.len()
    }

    /// Byte range of entry `index`; the last entry runs to EOF.
    pub fn entry_range(&self, index: usize) -> Result<std::ops::Range<usize>> {
        let start = *self
            .entry_offsets
            .get(index)
            .ok_or_else(|| PatchError::malformed(format!("no entry #{}", index)))?;
        let end = self
            .entry_offsets
            .get(index + 1)
            .copied()
            .unwrap_or(self.data.len());
        Ok(start..end)
    }

    pub fn entry(&self, index: usize) -> Result<ScdEntry<'a>> {
        ScdEntry::parse(&self.data[self.entry_range(index)?])
    }

    pub fn declared_size(&self) -> Result<u32> {
        read_u32_at(self.data, FILE_SIZE_FIELD)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_parse_container_and_entries() {
        let data = container(&[vorbis_entry(Some(2)), vorbis_entry(None)]);
        let scd = ScdFile::parse(&data).unwrap();
        assert_eq!(scd.entry_count(), 2);
        assert_eq!(scd.declared_size().unwrap() as usize, data.len());

        let first = scd.entry(0).unwrap();
        assert_eq!(first.meta.codec, CodecId::Vorbis);
        assert_eq!(first.aux.as_ref().unwrap().marks.len(), 2);
        assert_eq!(first.extradata_offset(), META_SIZE + AUX_HEADER_SIZE + 8);
        assert_eq!(first.vorbis_extradata().unwrap().encryption_key(), 0x3A);
        assert_eq!(first.stream, &[0xEE; 16]);

        let last = scd.entry_range(1).unwrap();
        assert_eq!(last.end, data.len());
    }

    #[test]
    fn test_bad_offsets_are_malformed() {
        let mut data = container(&[vorbis_entry(None)]);
        data[0x40..0x44].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        assert!(ScdFile::parse(&data).is_err());
        assert!(ScdFile::parse(b"SEDBSSCF").is_err());
    }

    #[test]
    fn test_aux_write_keeps_declared_size() {
        let aux = AuxBlock {
            magic: *b"MARK",
            size: 0x20,
            loop_start: 5,
            loop_end: 9,
            marks: vec![1, 2, 3, 4, 5],
        };
        let mut writer = BinaryWriter::new();
        aux.write(&mut writer).unwrap();
        assert_eq!(writer.len(), 0x20);

        let reread = AuxBlock::read(&mut BinaryReader::new(writer.as_slice())).unwrap();
        assert_eq!(reread.marks, vec![1, 2, 3]);
    }
}
