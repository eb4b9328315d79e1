//! Blob entry layout: clear header (the cipher seed), remastered sub-asset
//! table, main payload, then sub-asset payloads.

use crate::binary::{BinaryReader, BinaryWriter, align_up};
use crate::cipher::PayloadCodec;
use crate::error::{PatchError, Result};
use log::debug;

pub const SEED_SIZE: usize = 0x10;
pub const SUB_ASSET_SIZE: usize = 0x30;
pub const SUB_ASSET_NAME_SIZE: usize = 0x20;
pub const PAYLOAD_ALIGNMENT: usize = 0x10;
pub const PADDING_BYTE: u8 = 0xCD;

pub const UNCOMPRESSED: i32 = -1;
pub const RAW: i32 = -2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AssetHeader {
    pub decompressed_length: i32,
    pub remastered_asset_count: i32,
    /// `>= 0` compressed size, `-1` uncompressed, `<= -2` stored raw without encryption.
    pub compressed_length: i32,
    pub creation_date: i32,
}

impl AssetHeader {
    pub fn read(reader: &mut BinaryReader<'_>) -> Result<Self> {
        Ok(Self {
            decompressed_length: reader.read_i32()?,
            remastered_asset_count: reader.read_i32()?,
            compressed_length: reader.read_i32()?,
            creation_date: reader.read_i32()?,
        })
    }

    pub fn write(&self, writer: &mut BinaryWriter) -> Result<()> {
        writer.write_i32(self.decompressed_length)?;
        writer.write_i32(self.remastered_asset_count)?;
        writer.write_i32(self.compressed_length)?;
        writer.write_i32(self.creation_date)
    }

    pub fn to_seed(&self) -> Result<Vec<u8>> {
        let mut writer = BinaryWriter::with_capacity(SEED_SIZE);
        self.write(&mut writer)?;
        Ok(writer.into_inner())
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed_length > UNCOMPRESSED
    }

    pub fn is_encrypted(&self) -> bool {
        self.compressed_length > RAW
    }

    pub fn stored_payload_length(&self) -> Result<usize> {
        stored_length(self.decompressed_length, self.compressed_length)
    }

    pub fn sub_asset_count(&self) -> Result<usize> {
        usize::try_from(self.remastered_asset_count).map_err(|_| {
            PatchError::malformed(format!(
                "negative remastered asset count {}",
                self.remastered_asset_count
            ))
        })
    }
}

fn stored_length(decompressed: i32, compressed: i32) -> Result<usize> {
    let length = if compressed >= 0 {
        compressed
    } else {
        decompressed
    };
    let length = usize::try_from(length)
        .map_err(|_| PatchError::malformed(format!("negative payload length {}", length)))?;
    Ok(if compressed == UNCOMPRESSED {
        align_up(length, PAYLOAD_ALIGNMENT)
    } else {
        length
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemasteredSubAsset {
    pub name: String,
    /// Relative to the first byte after the main payload.
    pub offset: i32,
    pub original_asset_offset: i32,
    pub decompressed_length: i32,
    pub compressed_length: i32,
}

impl RemasteredSubAsset {
    pub fn read(reader: &mut BinaryReader<'_>) -> Result<Self> {
        Ok(Self {
            name: reader.read_fixed_string(SUB_ASSET_NAME_SIZE)?,
            offset: reader.read_i32()?,
            original_asset_offset: reader.read_i32()?,
            decompressed_length: reader.read_i32()?,
            compressed_length: reader.read_i32()?,
        })
    }

    pub fn write(&self, writer: &mut BinaryWriter) -> Result<()> {
        writer.write_fixed_string(&self.name, SUB_ASSET_NAME_SIZE)?;
        writer.write_i32(self.offset)?;
        writer.write_i32(self.original_asset_offset)?;
        writer.write_i32(self.decompressed_length)?;
        writer.write_i32(self.compressed_length)
    }

    /// The header a sub-asset payload is encoded under; it shares the
    /// parent's key, so only its own lengths differ.
    pub fn payload_header(&self, parent: &AssetHeader) -> AssetHeader {
        AssetHeader {
            decompressed_length: self.decompressed_length,
            compressed_length: self.compressed_length,
            ..*parent
        }
    }

    pub fn stored_payload_length(&self) -> Result<usize> {
        stored_length(self.decompressed_length, self.compressed_length)
    }
}

/// One parsed blob entry.
#[derive(Debug, Clone)]
pub struct AssetContainer<'a> {
    pub header: AssetHeader,
    pub sub_assets: Vec<RemasteredSubAsset>,
    /// Main payload exactly as stored (possibly encrypted and compressed).
    pub stored_payload: &'a [u8],
    /// Sub-asset payloads as stored, in table order.
    pub stored_sub_payloads: Vec<&'a [u8]>,
    /// Every byte of the entry, header included.
    pub raw: &'a [u8],
}

impl<'a> AssetContainer<'a> {
    pub fn parse(entry: &'a [u8]) -> Result<Self> {
        let mut reader = BinaryReader::new(entry);
        let seed = reader.read_bytes(SEED_SIZE)?;
        let header = AssetHeader::read(&mut BinaryReader::new(seed))?;
        debug!("asset header: {:?}", header);

        let count = header.sub_asset_count()?;
        if count * SUB_ASSET_SIZE > reader.remaining() {
            return Err(PatchError::malformed(format!(
                "{} remastered records do not fit in {} bytes",
                count,
                reader.remaining()
            )));
        }
        let sub_assets = (0..count)
            .map(|_| RemasteredSubAsset::read(&mut reader))
            .collect::<Result<Vec<_>>>()?;

        let stored_payload = read_payload(&mut reader, header.stored_payload_length()?)?;
        let sub_base = reader.position();

        let mut stored_sub_payloads = Vec::with_capacity(sub_assets.len());
        for sub in &sub_assets {
            let start = sub_base
                + usize::try_from(sub.offset).map_err(|_| {
                    PatchError::malformed(format!("sub-asset '{}' has negative offset", sub.name))
                })?;
            let mut sub_reader = BinaryReader::at(entry, start)?;
            stored_sub_payloads.push(read_payload(&mut sub_reader, sub.stored_payload_length()?)?);
        }

        Ok(Self {
            header,
            sub_assets,
            stored_payload,
            stored_sub_payloads,
            raw: entry,
        })
    }

    /// Main payload with the cipher removed, still compressed if it was.
    pub fn original_payload(&self, codec: &dyn PayloadCodec) -> Result<Vec<u8>> {
        codec.decrypt(&self.header, self.stored_payload)
    }

    /// Fully decoded main payload.
    pub fn decoded_payload(&self, codec: &dyn PayloadCodec) -> Result<Vec<u8>> {
        codec.decode(&self.header, self.stored_payload)
    }

    pub fn decoded_sub_payload(&self, index: usize, codec: &dyn PayloadCodec) -> Result<Vec<u8>> {
        let sub = self.sub_assets.get(index).ok_or_else(|| {
            PatchError::malformed(format!("no remastered sub-asset #{}", index))
        })?;
        codec.decode(&sub.payload_header(&self.header), self.stored_sub_payloads[index])
    }
}

fn read_payload<'a>(reader: &mut BinaryReader<'a>, length: usize) -> Result<&'a [u8]> {
    // Tolerate a final block whose alignment padding was never written.
    let available = reader.remaining();
    if length > available && align_up(available, PAYLOAD_ALIGNMENT) == length {
        return reader.read_bytes(available);
    }
    reader.read_bytes(length)
}

/// Replacement content for one remastered sub-asset.
pub enum SubAssetSource<'a> {
    Keep,
    Replace(&'a [u8]),
}

pub struct BuiltEntry {
    pub bytes: Vec<u8>,
    /// Main payload length before encoding.
    pub actual_length: i32,
}

/// Serializes a new blob entry.
pub struct AssetEntryBuilder<'c> {
    codec: &'c dyn PayloadCodec,
}

impl<'c> AssetEntryBuilder<'c> {
    pub fn new(codec: &'c dyn PayloadCodec) -> Self {
        Self { codec }
    }

    /// Encodes `plain` under a header modelled on `template`. The template's
    /// compressed length only selects the mode: `>= 0` compress, `-1`
    /// encrypt only, `<= -2` store raw.
    ///
    /// Sub-asset keys only depend on the parent's count and creation date,
    /// which are kept, so untouched sub-asset payloads are copied as stored.
    pub fn build(
        &self,
        template: &AssetHeader,
        plain: &[u8],
        original: Option<&AssetContainer<'_>>,
        sub_sources: &[SubAssetSource<'_>],
    ) -> Result<BuiltEntry> {
        let base = AssetHeader {
            remastered_asset_count: original.map_or(0, |o| o.sub_assets.len() as i32),
            ..*template
        };
        let (header, payload) = self.encode_payload(&base, template.compressed_length, plain)?;

        let mut sub_assets = Vec::new();
        let mut sub_payloads: Vec<Vec<u8>> = Vec::new();
        if let Some(original) = original {
            let mut cursor = 0usize;
            for (index, sub) in original.sub_assets.iter().enumerate() {
                let (mut record, data) = match sub_sources.get(index) {
                    Some(SubAssetSource::Replace(replacement)) => {
                        let (encoded, data) = self.encode_payload(
                            &sub.payload_header(&header),
                            sub.compressed_length,
                            replacement,
                        )?;
                        debug!(
                            "sub-asset '{}': {} -> {} bytes",
                            sub.name,
                            replacement.len(),
                            data.len()
                        );
                        let record = RemasteredSubAsset {
                            decompressed_length: encoded.decompressed_length,
                            compressed_length: encoded.compressed_length,
                            ..sub.clone()
                        };
                        (record, data)
                    }
                    _ => (sub.clone(), original.stored_sub_payloads[index].to_vec()),
                };
                record.offset = cursor as i32;
                cursor += data.len();
                sub_assets.push(record);
                sub_payloads.push(data);
            }
        }

        let mut writer = BinaryWriter::with_capacity(
            SEED_SIZE + sub_assets.len() * SUB_ASSET_SIZE + payload.len(),
        );
        header.write(&mut writer)?;
        for sub in &sub_assets {
            sub.write(&mut writer)?;
        }
        writer.write_bytes(&payload)?;
        for data in &sub_payloads {
            writer.write_bytes(data)?;
        }

        Ok(BuiltEntry {
            bytes: writer.into_inner(),
            actual_length: plain.len() as i32,
        })
    }

    /// Pads, optionally compresses, then keys `plain`. Returns the header the
    /// payload was keyed with.
    fn encode_payload(
        &self,
        template: &AssetHeader,
        mode: i32,
        plain: &[u8],
    ) -> Result<(AssetHeader, Vec<u8>)> {
        let mut header = AssetHeader {
            decompressed_length: plain.len() as i32,
            ..*template
        };

        if mode <= RAW {
            header.compressed_length = RAW;
            return Ok((header, plain.to_vec()));
        }

        let mut padded = BinaryWriter::from_vec(plain.to_vec());
        padded.pad_to(PAYLOAD_ALIGNMENT, PADDING_BYTE)?;

        let mut data = if mode > UNCOMPRESSED {
            let mut compressed = BinaryWriter::from_vec(self.codec.compress(padded.as_slice())?);
            compressed.pad_to(PAYLOAD_ALIGNMENT, PADDING_BYTE)?;
            header.compressed_length = compressed.len() as i32;
            compressed.into_inner()
        } else {
            header.compressed_length = UNCOMPRESSED;
            padded.into_inner()
        };

        // The seed is the final header, lengths included.
        self.codec.apply_cipher(&header, &mut data)?;
        Ok((header, data))
    }
}
