//! RIFF/WAVE chunk access, loop tags and the `smpl` loop-cue chunk.

use crate::binary::{BinaryReader, BinaryWriter};
use crate::error::{PatchError, Result};
use crate::ogg::find;
use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub id: [u8; 4],
    /// Offset of the chunk body (after id and size).
    pub offset: usize,
    pub size: usize,
}

impl Chunk {
    pub fn body<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        let end = (self.offset + self.size).min(data.len());
        &data[self.offset..end]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaveFormat {
    pub format_tag: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub block_align: u16,
    pub bits_per_sample: u16,
}

/// Parsed view of a RIFF/WAVE file.
#[derive(Debug, Clone)]
pub struct Wave<'a> {
    pub data: &'a [u8],
    pub chunks: Vec<Chunk>,
    pub format: WaveFormat,
}

impl<'a> Wave<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < 12 || &data[0..4] != b"RIFF" || &data[8..12] != b"WAVE" {
            return Err(PatchError::malformed("not a RIFF/WAVE file"));
        }

        let mut chunks = Vec::new();
        let mut reader = BinaryReader::at(data, 12)?;
        while reader.remaining() >= 8 {
            let id = reader.read_array::<4>()?;
            let size = reader.read_u32()? as usize;
            let offset = reader.position();
            chunks.push(Chunk { id, offset, size });
            // Chunks are word aligned; a truncated last chunk ends the walk.
            let next = offset + size + (size & 1);
            if next > data.len() {
                break;
            }
            reader.seek(next)?;
        }

        let fmt = chunks
            .iter()
            .find(|c| &c.id == b"fmt ")
            .ok_or_else(|| PatchError::malformed("WAV has no fmt chunk"))?;
        let mut reader = BinaryReader::new(fmt.body(data));
        let format_tag = reader.read_u16()?;
        let channels = reader.read_u16()?;
        let sample_rate = reader.read_u32()?;
        let _byte_rate = reader.read_u32()?;
        let block_align = reader.read_u16()?;
        let bits_per_sample = reader.read_u16()?;

        let format = WaveFormat {
            format_tag,
            channels,
            sample_rate,
            block_align,
            bits_per_sample,
        };
        debug!("wav: {:?}, {} chunks", format, chunks.len());
        Ok(Self {
            data,
            chunks,
            format,
        })
    }

    pub fn chunk(&self, id: &[u8; 4]) -> Option<&Chunk> {
        self.chunks.iter().find(|c| &c.id == id)
    }

    pub fn fmt_chunk(&self) -> Result<&'a [u8]> {
        self.chunk(b"fmt ")
            .map(|c| c.body(self.data))
            .ok_or_else(|| PatchError::malformed("WAV has no fmt chunk"))
    }

    pub fn data_chunk(&self) -> Result<&Chunk> {
        self.chunk(b"data")
            .ok_or_else(|| PatchError::malformed("WAV has no data chunk"))
    }

    pub fn total_frames(&self) -> Result<u64> {
        if self.format.block_align == 0 {
            return Err(PatchError::malformed("WAV block align is zero"));
        }
        Ok(self.data_chunk()?.size as u64 / self.format.block_align as u64)
    }

    /// Loop markers from the metadata chunks. Sample data is never searched.
    pub fn loop_tags(&self) -> LoopTags {
        let mut tags = LoopTags::default();
        for chunk in self.chunks.iter().filter(|c| &c.id != b"data") {
            let found = LoopTags::scan(chunk.body(self.data));
            tags.loop_start = tags.loop_start.or(found.loop_start);
            tags.loop_end = tags.loop_end.or(found.loop_end);
            for (index, value) in found.marks {
                if tags.mark(index).is_none() {
                    tags.marks.push((index, value));
                }
            }
        }
        tags.marks.sort_unstable();
        tags
    }
}

/// ASCII `LoopStart`/`LoopEnd`/`MARKn` markers in a block of metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopTags {
    pub loop_start: Option<u64>,
    pub loop_end: Option<u64>,
    /// `(n, sample)` pairs in ascending `n`.
    pub marks: Vec<(u32, u64)>,
}

impl LoopTags {
    pub fn scan(data: &[u8]) -> Self {
        let mut marks = Vec::new();
        let mut position = 0;
        while let Some(found) = find(data, b"MARK", position) {
            let digits_start = found + 4;
            let digits = data[digits_start..]
                .iter()
                .take_while(|b| b.is_ascii_digit())
                .count();
            if digits > 0 {
                let index = std::str::from_utf8(&data[digits_start..digits_start + digits])
                    .ok()
                    .and_then(|s| s.parse::<u32>().ok());
                if let (Some(index), Some(value)) =
                    (index, number_after(data, digits_start + digits))
                {
                    marks.push((index, value));
                }
            }
            position = found + 4;
        }
        marks.sort_unstable();
        marks.dedup_by_key(|(n, _)| *n);

        Self {
            loop_start: tag_value(data, b"LoopStart"),
            loop_end: tag_value(data, b"LoopEnd"),
            marks,
        }
    }

    pub fn mark(&self, index: u32) -> Option<u64> {
        self.marks
            .iter()
            .find(|(n, _)| *n == index)
            .map(|&(_, value)| value)
    }
}

fn tag_value(data: &[u8], tag: &[u8]) -> Option<u64> {
    let found = find(data, tag, 0)?;
    number_after(data, found + tag.len())
}

/// Decimal integer after a tag, allowing a short `=`, `:`, space or NUL separator.
fn number_after(data: &[u8], position: usize) -> Option<u64> {
    let rest = data.get(position..)?;
    let skip = rest
        .iter()
        .take(4)
        .take_while(|b| matches!(b, b'=' | b':' | b' ' | 0))
        .count();
    let digits: String = rest[skip..]
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .map(|&b| b as char)
        .collect();
    digits.parse().ok()
}

/// Loop in absolute samples, end inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoopInfo {
    pub has_loop: bool,
    pub start_sample: u64,
    pub end_sample_inclusive: u64,
}

impl LoopInfo {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(start_sample: u64, end_sample_inclusive: u64) -> Self {
        Self {
            has_loop: true,
            start_sample,
            end_sample_inclusive,
        }
    }
}

const SMPL_BODY_SIZE: u32 = 36 + 24;

/// Returns `wav` with any `smpl` chunk removed and, when `info` loops, a new
/// one appended. The RIFF size is rewritten.
pub fn with_loop_chunk(wav: &[u8], info: &LoopInfo) -> Result<Vec<u8>> {
    let parsed = Wave::parse(wav)?;
    let mut writer = BinaryWriter::with_capacity(wav.len() + 8 + SMPL_BODY_SIZE as usize);
    writer.write_bytes(&wav[..12])?;

    for chunk in &parsed.chunks {
        if &chunk.id == b"smpl" {
            continue;
        }
        let body = chunk.body(wav);
        writer.write_bytes(&chunk.id)?;
        writer.write_u32(body.len() as u32)?;
        writer.write_bytes(body)?;
        if body.len() % 2 == 1 {
            writer.write_u8(0)?;
        }
    }

    if info.has_loop {
        let period = 1_000_000_000 / parsed.format.sample_rate.max(1);
        writer.write_bytes(b"smpl")?;
        writer.write_u32(SMPL_BODY_SIZE)?;
        writer.write_u32(0)?; // manufacturer
        writer.write_u32(0)?; // product
        writer.write_u32(period)?;
        writer.write_u32(60)?; // MIDI unity note
        writer.write_u32(0)?; // pitch fraction
        writer.write_u32(0)?; // SMPTE format
        writer.write_u32(0)?; // SMPTE offset
        writer.write_u32(1)?; // loop count
        writer.write_u32(0)?; // sampler data
        writer.write_u32(0)?; // cue point id
        writer.write_u32(0)?; // forward
        writer.write_u32(info.start_sample as u32)?;
        writer.write_u32(info.end_sample_inclusive as u32)?;
        writer.write_u32(0)?; // fraction
        writer.write_u32(0)?; // play count, 0 = infinite
    }

    let riff_size = (writer.len() - 8) as u32;
    writer.patch_u32(4, riff_size)?;
    Ok(writer.into_inner())
}

/// Reads the first loop of a `smpl` chunk, if any.
pub fn read_loop_chunk(wav: &[u8]) -> Result<Option<LoopInfo>> {
    let parsed = Wave::parse(wav)?;
    let Some(chunk) = parsed.chunk(b"smpl") else {
        return Ok(None);
    };
    let mut reader = BinaryReader::new(chunk.body(wav));
    reader.skip(28)?;
    if reader.read_u32()? == 0 {
        return Ok(None);
    }
    reader.skip(4 + 8)?;
    let start = reader.read_u32()? as u64;
    let end = reader.read_u32()? as u64;
    Ok(Some(LoopInfo::new(start, end)))
}

/// Minimal 16-bit PCM WAV, with extra chunks appended after `data`.
pub fn pcm_wav(channels: u16, sample_rate: u32, samples: &[i16], extra: &[u8]) -> Result<Vec<u8>> {
    let block_align = channels * 2;
    let data_size = samples.len() * 2;
    let mut writer = BinaryWriter::with_capacity(44 + data_size + extra.len());
    writer.write_bytes(b"RIFF")?;
    writer.write_u32((36 + data_size + extra.len()) as u32)?;
    writer.write_bytes(b"WAVEfmt ")?;
    writer.write_u32(16)?;
    writer.write_u16(1)?;
    writer.write_u16(channels)?;
    writer.write_u32(sample_rate)?;
    writer.write_u32(sample_rate * block_align as u32)?;
    writer.write_u16(block_align)?;
    writer.write_u16(16)?;
    writer.write_bytes(b"data")?;
    writer.write_u32(data_size as u32)?;
    for &sample in samples {
        writer.write_u16(sample as u16)?;
    }
    writer.write_bytes(extra)?;
    Ok(writer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pcm() {
        let wav = pcm_wav(2, 44100, &[0; 400], &[]).unwrap();
        let parsed = Wave::parse(&wav).unwrap();
        assert_eq!(parsed.format.channels, 2);
        assert_eq!(parsed.format.block_align, 4);
        assert_eq!(parsed.total_frames().unwrap(), 200);
        assert!(Wave::parse(b"OggS").is_err());
    }

    #[test]
    fn test_loop_tags() {
        let mut list = b"LIST".to_vec();
        let body = b"INFOLoopStart=1000\0LoopEnd=5000\0MARK0=10\0MARK2=3000\0";
        list.extend_from_slice(&(body.len() as u32).to_le_bytes());
        list.extend_from_slice(body);
        let wav = pcm_wav(1, 22050, &[0; 10], &list).unwrap();

        let tags = Wave::parse(&wav).unwrap().loop_tags();
        assert_eq!(tags.loop_start, Some(1000));
        assert_eq!(tags.loop_end, Some(5000));
        assert_eq!(tags.marks, vec![(0, 10), (2, 3000)]);
        assert_eq!(tags.mark(1), None);

        let untagged = pcm_wav(1, 22050, &[0; 10], &[]).unwrap();
        assert_eq!(LoopTags::scan(&untagged), LoopTags::default());
    }

    #[test]
    fn test_loop_tags_ignore_sample_data() {
        // PCM whose bytes happen to spell out tags.
        let noise: Vec<i16> = b"LoopStart=99\0LoopEnd=500\0MARK1=7\0\0"
            .chunks(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let wav = pcm_wav(1, 22050, &noise, &[]).unwrap();
        assert_eq!(Wave::parse(&wav).unwrap().loop_tags(), LoopTags::default());

        let mut list = b"LIST".to_vec();
        let body = b"INFOLoopStart=40\0\0";
        list.extend_from_slice(&(body.len() as u32).to_le_bytes());
        list.extend_from_slice(body);
        let wav = pcm_wav(1, 22050, &noise, &list).unwrap();
        let tags = Wave::parse(&wav).unwrap().loop_tags();
        assert_eq!(tags.loop_start, Some(40));
        assert_eq!(tags.loop_end, None);
        assert!(tags.marks.is_empty());
    }

    #[test]
    fn test_smpl_inject_and_replace() {
        let wav = pcm_wav(1, 32000, &[1, 2, 3], &[]).unwrap();
        let looped = with_loop_chunk(&wav, &LoopInfo::new(1000, 4999)).unwrap();
        assert_eq!(read_loop_chunk(&looped).unwrap(), Some(LoopInfo::new(1000, 4999)));

        let riff_size = u32::from_le_bytes(looped[4..8].try_into().unwrap()) as usize;
        assert_eq!(riff_size + 8, looped.len());

        // A second injection replaces rather than stacks.
        let relooped = with_loop_chunk(&looped, &LoopInfo::new(0, 10)).unwrap();
        assert_eq!(relooped.len(), looped.len());

        let cleared = with_loop_chunk(&looped, &LoopInfo::none()).unwrap();
        assert_eq!(read_loop_chunk(&cleared).unwrap(), None);
        assert_eq!(cleared, wav);
    }
}
