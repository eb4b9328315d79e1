//! Rebuilds SCD containers from WAV sources using a container as template.

use crate::binary::{BinaryReader, BinaryWriter, align_up};
use crate::error::{PatchError, Result};
use crate::ogg::OggStream;
use crate::scd::{
    ADPCM_FORMAT_SIZE, AuxBlock, CodecId, ENTRY_ALIGNMENT, EntryMeta, FILE_SIZE_FIELD, META_SIZE,
    ScdEntry, ScdFile, VORBIS_EXTRADATA_SIZE, VorbisExtradata,
};
use crate::tools::{AudioEncoder, EncoderLoop};
use crate::wav::{LoopTags, Wave};
use log::{debug, info};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    /// Loop the whole stream when the WAV carries no loop tags.
    pub full_loop: bool,
}

/// Loop request derived from the source WAV, in samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SourceLoop {
    start: u64,
    end: u64,
}

pub struct ContainerBuilder<'e> {
    encoder: &'e dyn AudioEncoder,
    options: BuildOptions,
}

impl<'e> ContainerBuilder<'e> {
    pub fn new(encoder: &'e dyn AudioEncoder, options: BuildOptions) -> Self {
        Self { encoder, options }
    }

    /// Rebuilds every entry that has a source; the rest are copied verbatim.
    pub fn build(&self, template: &[u8], sources: &BTreeMap<usize, PathBuf>) -> Result<Vec<u8>> {
        let scd = ScdFile::parse(template)?;
        if let Some(&index) = sources.keys().find(|&&i| i >= scd.entry_count()) {
            return Err(PatchError::malformed(format!(
                "source for entry #{} but template has {} entries",
                index,
                scd.entry_count()
            )));
        }

        let mut rebuilt = Vec::with_capacity(scd.entry_count());
        for index in 0..scd.entry_count() {
            let bytes = match sources.get(&index) {
                Some(wav) => {
                    info!("Rebuilding entry #{} from {}", index, wav.display());
                    self.build_entry(&scd.entry(index)?, wav)?
                }
                None => template[scd.entry_range(index)?].to_vec(),
            };
            rebuilt.push(bytes);
        }
        assemble(&scd, &rebuilt)
    }

    /// Encodes one entry, choosing the codec from the template entry.
    pub fn build_entry(&self, template: &ScdEntry<'_>, wav_path: &Path) -> Result<Vec<u8>> {
        let source = fs::read(wav_path).map_err(|e| {
            PatchError::Io(io::Error::new(
                e.kind(),
                format!("reading {}: {}", wav_path.display(), e),
            ))
        })?;
        let wave = Wave::parse(&source)?;
        let tags = wave.loop_tags();
        let source_loop = self.source_loop(&wave, &tags)?;

        // The encoders write beside their input, so work on a private copy.
        let scratch = tempfile::Builder::new().prefix("hed-patch-").tempdir()?;
        let work_wav = scratch.path().join("source.wav");
        fs::write(&work_wav, &source)?;

        match template.meta.codec {
            CodecId::Vorbis => self.build_vorbis(template, &work_wav, &tags, source_loop),
            CodecId::MsAdpcm => self.build_adpcm(template, &work_wav, &wave, &tags, source_loop),
            CodecId::Other(id) => Err(PatchError::Unsupported(format!(
                "codec 0x{:X} in template entry",
                id
            ))),
        }
    }

    fn source_loop(&self, wave: &Wave<'_>, tags: &LoopTags) -> Result<Option<SourceLoop>> {
        if let Some(start) = tags.loop_start {
            let end = match tags.loop_end {
                Some(end) => end,
                None => wave.total_frames()?,
            };
            if end <= start {
                return Err(PatchError::malformed(format!(
                    "LoopEnd {} is not after LoopStart {}",
                    end, start
                )));
            }
            return Ok(Some(SourceLoop { start, end }));
        }
        if self.options.full_loop {
            return Ok(Some(SourceLoop {
                start: 0,
                end: wave.total_frames()?,
            }));
        }
        Ok(None)
    }

    fn build_vorbis(
        &self,
        template: &ScdEntry<'_>,
        wav: &Path,
        tags: &LoopTags,
        source_loop: Option<SourceLoop>,
    ) -> Result<Vec<u8>> {
        let ogg_bytes = self.encoder.encode_vorbis(
            wav,
            source_loop.map(|l| EncoderLoop {
                start: l.start,
                end: l.end,
            }),
        )?;
        let ogg = OggStream::parse(&ogg_bytes)?;
        let info = ogg.identification()?;
        let stream_size = ogg.stream_size();
        let total_samples = ogg.total_samples();

        let (loop_start, loop_end) = match source_loop {
            Some(l) => (
                ogg.offset_for_sample(l.start).unwrap_or(0) as u32,
                stream_size as u32,
            ),
            None => (0, 0),
        };
        debug!(
            "vorbis: header 0x{:X}, stream 0x{:X}, loop bytes 0x{:X}..0x{:X}",
            ogg.header_size, stream_size, loop_start, loop_end
        );

        let seek_table = ogg.seek_table();
        let seek_bytes = seek_table.len() * 4;

        let mut extradata = template.vorbis_extradata()?;
        extradata.set_vorbis_header_size(ogg.header_size as u32);
        extradata.set_seek_table_size(seek_bytes as u32);
        // Rebuilt streams are stored in clear.
        extradata.set_encryption_key(0);

        let aux = rebuild_aux(template, tags, source_loop, total_samples);
        let meta = EntryMeta {
            stream_size: stream_size as u32,
            channels: info.channels,
            sample_rate: info.sample_rate,
            codec: CodecId::Vorbis,
            loop_start,
            loop_end,
            extradata_size: (VORBIS_EXTRADATA_SIZE + seek_bytes + ogg.header_size) as u32,
            aux_count: template.meta.aux_count,
            reserved: template.meta.reserved,
        };

        let aux_size = aux.as_ref().map_or(0, |a| a.size as usize);
        let total = align_up(
            META_SIZE + aux_size + VORBIS_EXTRADATA_SIZE + seek_bytes + ogg_bytes.len(),
            ENTRY_ALIGNMENT,
        );
        let mut writer = BinaryWriter::with_capacity(total);
        meta.write(&mut writer)?;
        if let Some(aux) = &aux {
            aux.write(&mut writer)?;
        }
        writer.write_bytes(&extradata.raw)?;
        for offset in &seek_table {
            writer.write_u32(*offset)?;
        }
        // The whole Ogg file, setup pages included.
        writer.write_bytes(&ogg_bytes)?;
        writer.pad_to(ENTRY_ALIGNMENT, 0)?;
        debug_assert_eq!(writer.len(), total);
        Ok(writer.into_inner())
    }

    fn build_adpcm(
        &self,
        template: &ScdEntry<'_>,
        wav: &Path,
        source: &Wave<'_>,
        tags: &LoopTags,
        source_loop: Option<SourceLoop>,
    ) -> Result<Vec<u8>> {
        let encoded = self.encoder.encode_adpcm(wav)?;
        let adpcm = Wave::parse(&encoded)?;
        let fmt = adpcm.fmt_chunk()?;
        if fmt.len() < ADPCM_FORMAT_SIZE {
            return Err(PatchError::malformed(format!(
                "ADPCM fmt chunk is 0x{:X} bytes, need 0x{:X}",
                fmt.len(),
                ADPCM_FORMAT_SIZE
            )));
        }
        let payload = adpcm.data_chunk()?.body(&encoded);

        let samples_per_block = BinaryReader::at(fmt, 0x12)?.read_u16()?.max(1) as u64;
        let block_align = adpcm.format.block_align as u64;
        let to_bytes = |sample: u64| ((sample / samples_per_block) * block_align) as u32;
        let (loop_start, loop_end) = match source_loop {
            Some(l) => (
                to_bytes(l.start),
                to_bytes(l.end).min(payload.len() as u32),
            ),
            None => (0, 0),
        };

        let total_samples = source.total_frames()?;
        let aux = rebuild_aux(template, tags, source_loop, total_samples);
        let meta = EntryMeta {
            stream_size: payload.len() as u32,
            channels: adpcm.format.channels as u8,
            sample_rate: adpcm.format.sample_rate,
            codec: CodecId::MsAdpcm,
            loop_start,
            loop_end,
            extradata_size: ADPCM_FORMAT_SIZE as u32,
            aux_count: template.meta.aux_count,
            reserved: template.meta.reserved,
        };

        let mut writer = BinaryWriter::new();
        meta.write(&mut writer)?;
        if let Some(aux) = &aux {
            aux.write(&mut writer)?;
        }
        writer.write_bytes(&fmt[..ADPCM_FORMAT_SIZE])?;
        writer.write_bytes(payload)?;
        writer.pad_to(ENTRY_ALIGNMENT, 0)?;
        Ok(writer.into_inner())
    }
}

/// Keeps the template's aux block size and mark count; loop samples come
/// from the source, marks from `MARKn` tags or the template's values.
fn rebuild_aux(
    template: &ScdEntry<'_>,
    tags: &LoopTags,
    source_loop: Option<SourceLoop>,
    total_samples: u64,
) -> Option<AuxBlock> {
    let original = template.aux.as_ref()?;
    let marks = original
        .marks
        .iter()
        .enumerate()
        .map(|(i, &old)| tags.mark(i as u32).map_or(old, |v| v as u32))
        .collect();
    Some(AuxBlock {
        loop_start: source_loop.map_or(0, |l| l.start as u32),
        loop_end: source_loop.map_or(total_samples, |l| l.end) as u32,
        marks,
        ..original.clone()
    })
}

/// Copies everything before the first entry, appends `entries`, then fixes
/// the offset table and the file-size field.
pub fn assemble(scd: &ScdFile<'_>, entries: &[Vec<u8>]) -> Result<Vec<u8>> {
    let prefix_end = scd.entry_offsets.first().copied().unwrap_or(scd.data.len());
    let table_end = scd.headers_offset + entries.len() * 4;
    if table_end > prefix_end {
        return Err(PatchError::malformed(format!(
            "entry offset table ends at 0x{:X}, after first entry at 0x{:X}",
            table_end, prefix_end
        )));
    }

    let total = prefix_end + entries.iter().map(Vec::len).sum::<usize>();
    let mut writer = BinaryWriter::with_capacity(total);
    writer.write_bytes(&scd.data[..prefix_end])?;

    let mut offsets = Vec::with_capacity(entries.len());
    for entry in entries {
        offsets.push(writer.len() as u32);
        writer.write_bytes(entry)?;
    }

    for (index, offset) in offsets.iter().enumerate() {
        writer.patch_u32(scd.headers_offset + index * 4, *offset)?;
    }
    let size = writer.len() as u32;
    writer.patch_u32(FILE_SIZE_FIELD, size)?;
    debug!("scd: assembled {} entries, 0x{:X} bytes", entries.len(), size);
    Ok(writer.into_inner())
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::binary::BinaryWriter;
    use crate::error::{PatchError, Result};
    use crate::ogg;
    use crate::tools::{AudioEncoder, EncoderLoop};
    use crate::wav::Wave;
    use std::fs;
    use std::path::Path;

    pub const ADPCM_BLOCK_ALIGN: u16 = 0x800;
    pub const ADPCM_SAMPLES_PER_BLOCK: u16 = 2036;

    /// Produces synthetic Ogg with one page per 1024 samples, and MS-ADPCM
    /// WAVs with 0x800-byte blocks of 2036 samples.
    pub struct FakeEncoder {
        pub fail: bool,
    }

    /// MS-ADPCM RIFF: 0x32-byte `fmt ` then whole blocks of filler.
    pub fn adpcm_wav(channels: u16, sample_rate: u32, frames: u64) -> Vec<u8> {
        let blocks = frames.div_ceil(ADPCM_SAMPLES_PER_BLOCK as u64) as usize;
        let data_size = blocks * ADPCM_BLOCK_ALIGN as usize;

        let mut writer = BinaryWriter::new();
        writer.write_bytes(b"RIFF").unwrap();
        writer.write_u32((4 + 8 + 0x32 + 8 + data_size) as u32).unwrap();
        writer.write_bytes(b"WAVEfmt ").unwrap();
        writer.write_u32(0x32).unwrap();
        writer.write_u16(2).unwrap();
        writer.write_u16(channels).unwrap();
        writer.write_u32(sample_rate).unwrap();
        let byte_rate = sample_rate * ADPCM_BLOCK_ALIGN as u32 / ADPCM_SAMPLES_PER_BLOCK as u32;
        writer.write_u32(byte_rate).unwrap();
        writer.write_u16(ADPCM_BLOCK_ALIGN).unwrap();
        writer.write_u16(4).unwrap();
        writer.write_u16(32).unwrap();
        writer.write_u16(ADPCM_SAMPLES_PER_BLOCK).unwrap();
        writer.write_u16(7).unwrap();
        let coefficients: [(i16, i16); 7] = [
            (256, 0),
            (512, -256),
            (0, 0),
            (192, 64),
            (240, 0),
            (460, -208),
            (392, -232),
        ];
        for (first, second) in coefficients {
            writer.write_u16(first as u16).unwrap();
            writer.write_u16(second as u16).unwrap();
        }
        writer.write_bytes(b"data").unwrap();
        writer.write_u32(data_size as u32).unwrap();
        writer.write_bytes(&vec![0x22; data_size]).unwrap();
        writer.into_inner()
    }

    impl AudioEncoder for FakeEncoder {
        fn encode_vorbis(&self, wav: &Path, loop_points: Option<EncoderLoop>) -> Result<Vec<u8>> {
            if self.fail {
                return Err(PatchError::tool("oggenc", "exited with 1"));
            }
            let data = fs::read(wav)?;
            let wave = Wave::parse(&data)?;
            Ok(ogg::testing::stream(
                wave.format.channels as u8,
                wave.format.sample_rate,
                wave.total_frames()?,
                1024,
                loop_points.map(|l| (l.start, l.end)),
            ))
        }

        fn encode_adpcm(&self, wav: &Path) -> Result<Vec<u8>> {
            if self.fail {
                return Err(PatchError::tool("adpcmencode3", "exited with 1"));
            }
            let data = fs::read(wav)?;
            let wave = Wave::parse(&data)?;
            Ok(adpcm_wav(
                wave.format.channels,
                wave.format.sample_rate,
                wave.total_frames()?,
            ))
        }
    }
}
