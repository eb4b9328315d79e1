//! Just enough Ogg/Vorbis to map between byte offsets and sample positions.

use crate::binary::{BinaryReader, read_i64_at};
use crate::error::{PatchError, Result};
use log::debug;

pub const CAPTURE_PATTERN: &[u8; 4] = b"OggS";
pub const PAGE_HEADER_SIZE: usize = 27;
pub const SEEK_GRANULARITY: u64 = 2048;

const IDENTIFICATION_MARKER: &[u8; 7] = b"\x01vorbis";
const COMMENT_MARKER: &[u8; 7] = b"\x03vorbis";
const SETUP_MARKER: &[u8; 7] = b"\x05vorbis";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OggPage {
    pub offset: usize,
    pub granule: i64,
    /// Header plus body, or up to the next capture pattern for damaged pages.
    pub length: usize,
}

/// Finds every page, jumping over page bodies and resyncing on the capture
/// pattern when a header is damaged.
pub fn scan_pages(data: &[u8]) -> Vec<OggPage> {
    let mut pages = Vec::new();
    let mut position = 0usize;

    while let Some(found) = find(data, CAPTURE_PATTERN, position) {
        let granule = match read_i64_at(data, found + 6) {
            Ok(granule) => granule,
            Err(_) => break,
        };
        let length = page_length(data, found)
            .unwrap_or_else(|| find(data, CAPTURE_PATTERN, found + 1).unwrap_or(data.len()) - found);
        pages.push(OggPage {
            offset: found,
            granule,
            length,
        });
        position = found + length.max(1);
    }

    debug!("ogg: {} pages in {} bytes", pages.len(), data.len());
    pages
}

fn page_length(data: &[u8], offset: usize) -> Option<usize> {
    let segments = *data.get(offset + 26)? as usize;
    let table = data.get(offset + PAGE_HEADER_SIZE..offset + PAGE_HEADER_SIZE + segments)?;
    let body: usize = table.iter().map(|&b| b as usize).sum();
    let length = PAGE_HEADER_SIZE + segments + body;
    (offset + length <= data.len()).then_some(length)
}

pub fn find(data: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= data.len() || needle.is_empty() {
        return None;
    }
    data[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|p| p + from)
}

/// A scanned Ogg Vorbis stream.
#[derive(Debug, Clone)]
pub struct OggStream<'a> {
    pub data: &'a [u8],
    pub pages: Vec<OggPage>,
    /// Byte offset of the first audio page; everything before is codec setup.
    pub header_size: usize,
}

impl<'a> OggStream<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let pages = scan_pages(data);
        if pages.is_empty() {
            return Err(PatchError::malformed("no OggS page found"));
        }
        let header_size = pages
            .iter()
            .find(|page| page.granule != 0)
            .map(|page| page.offset)
            .ok_or_else(|| PatchError::malformed("no Ogg page with a non-zero granule"))?;
        if find(&data[..header_size], SETUP_MARKER, 0).is_none() {
            return Err(PatchError::malformed("no Vorbis setup header before first audio page"));
        }
        debug!("ogg: header size 0x{:X}", header_size);
        Ok(Self {
            data,
            pages,
            header_size,
        })
    }

    pub fn stream_size(&self) -> usize {
        self.data.len() - self.header_size
    }

    pub fn audio_pages(&self) -> impl Iterator<Item = &OggPage> {
        self.pages.iter().filter(|page| page.offset >= self.header_size)
    }

    pub fn total_samples(&self) -> u64 {
        self.pages
            .iter()
            .rev()
            .map(|page| page.granule)
            .find(|&granule| granule > 0)
            .unwrap_or(0) as u64
    }

    pub fn identification(&self) -> Result<VorbisInfo> {
        let start = find(self.data, IDENTIFICATION_MARKER, 0)
            .filter(|&p| p < self.header_size)
            .ok_or_else(|| PatchError::malformed("no Vorbis identification header"))?;
        let mut reader = BinaryReader::at(self.data, start + IDENTIFICATION_MARKER.len())?;
        let _version = reader.read_u32()?;
        Ok(VorbisInfo {
            channels: reader.read_u8()?,
            sample_rate: reader.read_u32()?,
        })
    }

    /// Byte offset, relative to the end of codec setup, of the first audio
    /// page whose granule reaches `sample`.
    pub fn offset_for_sample(&self, sample: u64) -> Option<usize> {
        self.audio_pages()
            .find(|page| page.granule >= 0 && page.granule as u64 >= sample)
            .map(|page| page.offset - self.header_size)
    }

    /// Granule of the first page at or after a setup-relative byte offset.
    pub fn sample_at_offset(&self, relative: usize) -> Option<u64> {
        let absolute = self.header_size + relative;
        self.audio_pages()
            .find(|page| page.offset >= absolute)
            .map(|page| page.granule.max(0) as u64)
    }

    /// Setup-relative offsets spaced at least `SEEK_GRANULARITY` samples
    /// apart. Never empty.
    pub fn seek_table(&self) -> Vec<u32> {
        let mut table = Vec::new();
        let mut last_granule = 0i64;
        for page in self.audio_pages() {
            if page.granule - last_granule >= SEEK_GRANULARITY as i64 {
                table.push((page.offset - self.header_size) as u32);
                last_granule = page.granule;
            }
        }
        if table.is_empty() {
            table.push(0);
        }
        table
    }

    /// `LoopStart`/`LoopEnd` user comments, when the encoder embedded them.
    pub fn loop_comments(&self) -> (Option<u64>, Option<u64>) {
        let Some(start) = find(self.data, COMMENT_MARKER, 0).filter(|&p| p < self.header_size)
        else {
            return (None, None);
        };
        let comments = match parse_comments(&self.data[start + COMMENT_MARKER.len()..]) {
            Ok(comments) => comments,
            Err(e) => {
                debug!("ogg: unreadable comment header: {}", e);
                return (None, None);
            }
        };
        let lookup = |key: &str| {
            comments.iter().find_map(|c| {
                let (k, v) = c.split_once('=')?;
                k.eq_ignore_ascii_case(key)
                    .then(|| v.trim().parse::<u64>().ok())
                    .flatten()
            })
        };
        (lookup("LoopStart"), lookup("LoopEnd"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VorbisInfo {
    pub channels: u8,
    pub sample_rate: u32,
}

fn parse_comments(data: &[u8]) -> Result<Vec<String>> {
    let mut reader = BinaryReader::new(data);
    let vendor_length = reader.read_u32()? as usize;
    reader.skip(vendor_length)?;
    let count = reader.read_u32()?;
    let mut comments = Vec::new();
    for _ in 0..count {
        let length = reader.read_u32()? as usize;
        let raw = reader.read_bytes(length)?;
        comments.push(String::from_utf8_lossy(raw).into_owned());
    }
    Ok(comments)
}
