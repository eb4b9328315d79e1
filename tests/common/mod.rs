#![allow(dead_code)]

use byteorder::{LittleEndian, WriteBytesExt};
use hed_patch::asset::{AssetEntryBuilder, AssetHeader, RAW, RemasteredSubAsset};
use hed_patch::binary::BinaryWriter;
use hed_patch::hed::{IndexEntry, content_hash, serialize_index};
use hed_patch::ogg::OggStream;
use hed_patch::scd::{
    AUX_HEADER_SIZE, AuxBlock, CodecId, EntryMeta, FILE_SIZE_FIELD, MAGIC, VORBIS_EXTRADATA_SIZE,
    VorbisExtradata,
};
use hed_patch::tools::{AudioDecoder, AudioEncoder, DecoderReport, EncoderLoop};
use hed_patch::wav::{Wave, pcm_wav};
use hed_patch::{ArchivePair, EgsCodec, PatchError, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const SAMPLES_PER_PAGE: u64 = 1024;

fn ogg_page(granule: i64, sequence: u32, body: &[u8]) -> Vec<u8> {
    let mut page = b"OggS".to_vec();
    page.push(0);
    page.push(if sequence == 0 { 0x02 } else { 0x00 });
    page.write_i64::<LittleEndian>(granule).unwrap();
    page.write_u32::<LittleEndian>(1).unwrap();
    page.write_u32::<LittleEndian>(sequence).unwrap();
    page.write_u32::<LittleEndian>(0).unwrap();
    assert!(body.len() < 255);
    page.push(1);
    page.push(body.len() as u8);
    page.extend_from_slice(body);
    page
}

/// Ogg Vorbis lookalike: identification page, comment+setup page, then one
/// audio page per `SAMPLES_PER_PAGE` samples.
pub fn ogg_stream(channels: u8, rate: u32, total: u64, loop_points: Option<(u64, u64)>) -> Vec<u8> {
    let mut id = b"\x01vorbis".to_vec();
    id.write_u32::<LittleEndian>(0).unwrap();
    id.push(channels);
    id.write_u32::<LittleEndian>(rate).unwrap();
    id.extend_from_slice(&[0; 13]);

    let comments: Vec<String> = loop_points
        .map(|(s, e)| vec![format!("LoopStart={}", s), format!("LoopEnd={}", e)])
        .unwrap_or_default();
    let mut setup = b"\x03vorbis".to_vec();
    setup.write_u32::<LittleEndian>(4).unwrap();
    setup.extend_from_slice(b"test");
    setup.write_u32::<LittleEndian>(comments.len() as u32).unwrap();
    for comment in &comments {
        setup.write_u32::<LittleEndian>(comment.len() as u32).unwrap();
        setup.extend_from_slice(comment.as_bytes());
    }
    setup.push(1);
    setup.extend_from_slice(b"\x05vorbis");
    setup.extend_from_slice(&[0xAA; 16]);

    let mut data = ogg_page(0, 0, &id);
    data.extend(ogg_page(0, 1, &setup));
    let mut granule = 0;
    let mut sequence = 2;
    while granule < total {
        granule = (granule + SAMPLES_PER_PAGE).min(total);
        data.extend(ogg_page(granule as i64, sequence, &[0x55; 64]));
        sequence += 1;
    }
    data
}

/// Encoder stand-in that emits synthetic Ogg and fails for one sample rate.
pub struct FakeEncoder {
    pub fail_rate: Option<u32>,
}

impl AudioEncoder for FakeEncoder {
    fn encode_vorbis(&self, wav: &Path, loop_points: Option<EncoderLoop>) -> Result<Vec<u8>> {
        let data = fs::read(wav)?;
        let wave = Wave::parse(&data)?;
        if Some(wave.format.sample_rate) == self.fail_rate {
            return Err(PatchError::tool("oggenc", "exited with status 1"));
        }
        Ok(ogg_stream(
            wave.format.channels as u8,
            wave.format.sample_rate,
            wave.total_frames()?,
            loop_points.map(|l| (l.start, l.end)),
        ))
    }

    fn encode_adpcm(&self, _wav: &Path) -> Result<Vec<u8>> {
        Err(PatchError::Unsupported("no ADPCM encoder in tests".into()))
    }
}

/// Decoder stand-in writing silent PCM of the stream's length.
pub struct FakeDecoder {
    pub available: bool,
}

impl AudioDecoder for FakeDecoder {
    fn decode_ogg(&self, ogg: &Path, wav: &Path) -> Result<bool> {
        if !self.available {
            return Ok(false);
        }
        let data = fs::read(ogg)?;
        let stream = OggStream::parse(&data)?;
        let info = stream.identification()?;
        let samples = vec![0i16; stream.total_samples() as usize * info.channels as usize];
        fs::write(wav, pcm_wav(info.channels as u16, info.sample_rate, &samples, &[])?)?;
        Ok(true)
    }

    fn decode_container(&self, _container: &Path, _wav: &Path) -> Result<Option<DecoderReport>> {
        Ok(None)
    }

    fn searched_paths(&self) -> Vec<PathBuf> {
        vec![PathBuf::from("tools/oggdec"), PathBuf::from("tools/vgmstream-cli")]
    }
}

/// WAV of `frames` silent stereo frames with `INFO` tags such as
/// `LoopStart=1000`.
pub fn tagged_wav(rate: u32, frames: usize, tags: &[&str]) -> Vec<u8> {
    let mut extra = Vec::new();
    if !tags.is_empty() {
        let mut body = b"INFO".to_vec();
        for tag in tags {
            body.extend_from_slice(tag.as_bytes());
            body.push(0);
        }
        if body.len() % 2 == 1 {
            body.push(0);
        }
        extra.extend_from_slice(b"LIST");
        extra.extend_from_slice(&(body.len() as u32).to_le_bytes());
        extra.extend_from_slice(&body);
    }
    pcm_wav(2, rate, &vec![0i16; frames * 2], &extra).unwrap()
}

pub fn vorbis_template_entry(marks: usize) -> Vec<u8> {
    let aux = AuxBlock {
        magic: *b"MARK",
        size: (AUX_HEADER_SIZE + marks * 4) as u32,
        loop_start: 0,
        loop_end: 0,
        marks: vec![0; marks],
    };
    let mut extradata = VorbisExtradata {
        raw: [0; VORBIS_EXTRADATA_SIZE],
    };
    extradata.set_encryption_key(0x5A);
    let meta = EntryMeta {
        stream_size: 40,
        channels: 2,
        sample_rate: 48000,
        codec: CodecId::Vorbis,
        loop_start: 0,
        loop_end: 0,
        extradata_size: VORBIS_EXTRADATA_SIZE as u32,
        aux_count: 1,
        reserved: [0; 3],
    };
    let mut writer = BinaryWriter::new();
    meta.write(&mut writer).unwrap();
    aux.write(&mut writer).unwrap();
    writer.write_bytes(&extradata.raw).unwrap();
    writer.write_bytes(&[0x11; 40]).unwrap();
    writer.into_inner()
}

/// SCD with tables at 0x30 and the offset table at 0x40.
pub fn scd_template(entries: &[Vec<u8>]) -> Vec<u8> {
    let mut writer = BinaryWriter::new();
    writer.write_bytes(MAGIC).unwrap();
    writer.write_u32(3).unwrap();
    writer.write_u16(0).unwrap();
    writer.write_u16(0x30).unwrap();
    writer.write_u32(0).unwrap();
    writer.pad_to(0x30, 0).unwrap();
    writer.write_u16(0).unwrap();
    writer.write_u16(0).unwrap();
    writer.write_u16(entries.len() as u16).unwrap();
    writer.write_u16(0).unwrap();
    writer.write_u32(0).unwrap();
    writer.write_u32(0x40).unwrap();

    let mut offset = 0x40 + ((entries.len() * 4 + 0xF) & !0xF);
    for entry in entries {
        writer.write_u32(offset as u32).unwrap();
        offset += entry.len();
    }
    writer.pad_to(0x10, 0).unwrap();
    for entry in entries {
        writer.write_bytes(entry).unwrap();
    }
    let size = writer.len() as u32;
    writer.patch_u32(FILE_SIZE_FIELD, size).unwrap();
    writer.into_inner()
}

pub struct ArchiveFile {
    pub name: &'static str,
    pub data: Vec<u8>,
    /// Template compressed length: `0` compress, `-1` encrypt only, `-2` raw.
    pub mode: i32,
}

/// Writes `<dir>/game.hed` + `<dir>/game.pkg`, plus an empty record per
/// name in `empty`.
pub fn write_archive(dir: &Path, files: &[ArchiveFile], empty: &[&str]) -> ArchivePair {
    let codec = EgsCodec::default();
    let builder = AssetEntryBuilder::new(&codec);
    let mut index = Vec::new();
    let mut blob = Vec::new();
    for file in files {
        let template = AssetHeader {
            compressed_length: file.mode,
            creation_date: 0x5F00_0000,
            ..AssetHeader::default()
        };
        let built = builder.build(&template, &file.data, None, &[]).unwrap();
        index.push(IndexEntry {
            hash: content_hash(file.name),
            actual_length: built.actual_length,
            stored_length: built.bytes.len() as i32,
            offset: blob.len() as i64,
        });
        blob.extend_from_slice(&built.bytes);
    }
    for name in empty {
        index.push(IndexEntry {
            hash: content_hash(name),
            actual_length: 77,
            stored_length: 0,
            offset: 0,
        });
    }
    let pair = ArchivePair::in_dir(dir, "game");
    fs::write(&pair.index, serialize_index(&index).unwrap()).unwrap();
    fs::write(&pair.blob, blob).unwrap();
    pair
}

pub fn write_file(root: &Path, relative: &str, data: &[u8]) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, data).unwrap();
}

/// Writes `<dir>/game.hed` + `<dir>/game.pkg` from pre-built entries. The
/// actual length of each record is taken from its header.
pub fn write_entries(dir: &Path, entries: &[(&str, Vec<u8>)]) -> ArchivePair {
    let mut index = Vec::new();
    let mut blob = Vec::new();
    for (name, bytes) in entries {
        index.push(IndexEntry {
            hash: content_hash(name),
            actual_length: i32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            stored_length: bytes.len() as i32,
            offset: blob.len() as i64,
        });
        blob.extend_from_slice(bytes);
    }
    let pair = ArchivePair::in_dir(dir, "game");
    fs::write(&pair.index, serialize_index(&index).unwrap()).unwrap();
    fs::write(&pair.blob, blob).unwrap();
    pair
}

/// Raw-stored entry: main payload plus one raw payload per `(name, data)`
/// sub-asset.
pub fn entry_with_sub_assets(main: &[u8], subs: &[(&str, &[u8])]) -> Vec<u8> {
    let header = AssetHeader {
        decompressed_length: main.len() as i32,
        remastered_asset_count: subs.len() as i32,
        compressed_length: RAW,
        creation_date: 0x5F00_0000,
    };
    let mut writer = BinaryWriter::new();
    header.write(&mut writer).unwrap();
    let mut offset = 0;
    for (name, data) in subs {
        RemasteredSubAsset {
            name: name.to_string(),
            offset,
            original_asset_offset: 0,
            decompressed_length: data.len() as i32,
            compressed_length: RAW,
        }
        .write(&mut writer)
        .unwrap();
        offset += data.len() as i32;
    }
    writer.write_bytes(main).unwrap();
    for (_, data) in subs {
        writer.write_bytes(data).unwrap();
    }
    writer.into_inner()
}
