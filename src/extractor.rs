//! Decodes the first entry of an SCD container back to a looped WAV.

use crate::error::{PatchError, Result};
use crate::ogg::{CAPTURE_PATTERN, OggStream, find};
use crate::scd::ScdFile;
use crate::tools::{AudioDecoder, DecoderReport};
use crate::wav::{LoopInfo, with_loop_chunk};
use log::{debug, info, warn};
use std::fs;
use std::path::Path;

/// Loop starts closer to zero than `total / MIN_LOOP_START_DIVISOR` are
/// treated as mapping noise.
const MIN_LOOP_START_DIVISOR: u64 = 1000;

#[derive(Debug, Clone)]
pub struct Extraction {
    pub wav: Vec<u8>,
    pub loop_info: LoopInfo,
    pub total_samples: Option<u64>,
}

pub struct ContainerExtractor<'d> {
    decoder: &'d dyn AudioDecoder,
}

impl<'d> ContainerExtractor<'d> {
    pub fn new(decoder: &'d dyn AudioDecoder) -> Self {
        Self { decoder }
    }

    pub fn extract_file(&self, container: &Path, output: &Path) -> Result<LoopInfo> {
        let data = fs::read(container)
            .map_err(|e| PatchError::NotFound(format!("{}: {}", container.display(), e)))?;
        let extraction = self.extract(&data)?;
        fs::write(output, &extraction.wav)?;
        info!(
            "Extracted {} -> {} (loop: {:?})",
            container.display(),
            output.display(),
            extraction.loop_info
        );
        Ok(extraction.loop_info)
    }

    pub fn extract(&self, container: &[u8]) -> Result<Extraction> {
        let scd = ScdFile::parse(container)?;
        let entry = scd.entry(0)?;
        let embedded = embedded_ogg(entry.raw);
        let ogg = embedded.and_then(|bytes| match OggStream::parse(bytes) {
            Ok(ogg) => Some(ogg),
            Err(e) => {
                debug!("extract: embedded Ogg unusable: {}", e);
                None
            }
        });

        let scratch = tempfile::Builder::new().prefix("hed-extract-").tempdir()?;
        let wav_path = scratch.path().join("decoded.wav");

        let mut report = None;
        let decoded_ogg = match &ogg {
            Some(ogg) => {
                let ogg_path = scratch.path().join("stream.ogg");
                fs::write(&ogg_path, ogg.data)?;
                self.decoder.decode_ogg(&ogg_path, &wav_path)?
            }
            None => false,
        };
        if !decoded_ogg {
            let container_path = scratch.path().join("container.scd");
            fs::write(&container_path, container)?;
            report = self.decoder.decode_container(&container_path, &wav_path)?;
            if report.is_none() {
                let searched = self
                    .decoder
                    .searched_paths()
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(PatchError::NotFound(format!(
                    "no usable decoder; searched: {}",
                    searched
                )));
            }
        }

        let decoded = fs::read(&wav_path).map_err(|e| {
            PatchError::tool("decoder", format!("no output {}: {}", wav_path.display(), e))
        })?;

        let total_samples = ogg
            .as_ref()
            .map(OggStream::total_samples)
            .or(report.and_then(|r| r.total_samples));
        let loop_info = reconcile_loop(
            (entry.meta.loop_start, entry.meta.loop_end),
            ogg.as_ref(),
            report.as_ref(),
        );
        debug!("extract: loop {:?}, total {:?}", loop_info, total_samples);

        Ok(Extraction {
            wav: with_loop_chunk(&decoded, &loop_info)?,
            loop_info,
            total_samples,
        })
    }
}

/// The embedded Ogg file, trimmed to its last complete page.
fn embedded_ogg(entry: &[u8]) -> Option<&[u8]> {
    let start = find(entry, CAPTURE_PATTERN, 0)?;
    let pages = crate::ogg::scan_pages(&entry[start..]);
    let end = pages.last().map(|page| page.offset + page.length)?;
    Some(&entry[start..start + end])
}

/// Combines container loop bytes, embedded comments and the decoder report.
/// The container decides whether there is a loop at all; comments carry
/// exact sample positions; the report is the fallback when the byte
/// offsets do not map to a plausible range.
pub fn reconcile_loop(
    container_bytes: (u32, u32),
    ogg: Option<&OggStream<'_>>,
    report: Option<&DecoderReport>,
) -> LoopInfo {
    let (start_byte, end_byte) = container_bytes;
    let report_loop = report.and_then(|r| Some((r.loop_start?, r.loop_end?)));
    if end_byte == 0 {
        return match report_loop {
            Some((start, end)) if ogg.is_none() && end > start => {
                LoopInfo::new(start, end - 1)
            }
            _ => LoopInfo::none(),
        };
    }

    let Some(ogg) = ogg else {
        return match report_loop {
            Some((start, end)) if end > start => LoopInfo::new(start, end - 1),
            _ => LoopInfo::none(),
        };
    };

    let total = ogg.total_samples();
    if let (Some(start), Some(end)) = ogg.loop_comments() {
        if end > start && start <= total {
            return LoopInfo::new(start, end - 1);
        }
        warn!("extract: ignoring loop comments {}..{}", start, end);
    }

    let start = if start_byte == 0 {
        Some(0)
    } else {
        ogg.sample_at_offset(start_byte as usize)
    };
    let end = ogg.sample_at_offset(end_byte as usize).unwrap_or(total);
    match start {
        Some(start) if plausible(start, end, total) => LoopInfo::new(start, end - 1),
        _ => {
            warn!(
                "extract: loop bytes 0x{:X}..0x{:X} map to {:?}..{} of {}, using decoder report",
                start_byte, end_byte, start, end, total
            );
            match report_loop {
                Some((start, end)) if end > start => LoopInfo::new(start, end - 1),
                _ => LoopInfo::none(),
            }
        }
    }
}

fn plausible(start: u64, end: u64, total: u64) -> bool {
    let too_small = start > 0 && start < total / MIN_LOOP_START_DIVISOR;
    end > start && start <= total && !too_small
}
