mod common;

use common::*;
use hed_patch::builder::{BuildOptions, ContainerBuilder};
use hed_patch::extractor::ContainerExtractor;
use hed_patch::scd::ScdFile;
use hed_patch::wav::{LoopInfo, read_loop_chunk};
use hed_patch::PatchError;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn build(dir: &Path, wavs: &[Vec<u8>], template_entries: usize, options: BuildOptions) -> Vec<u8> {
    let template = scd_template(&vec![vorbis_template_entry(1); template_entries]);
    let mut sources = BTreeMap::new();
    for (index, wav) in wavs.iter().enumerate() {
        let path = dir.join(format!("source_{}.wav", index));
        fs::write(&path, wav).unwrap();
        sources.insert(index, path);
    }
    let encoder = FakeEncoder { fail_rate: None };
    ContainerBuilder::new(&encoder, options)
        .build(&template, &sources)
        .unwrap()
}

fn extract(container: &[u8]) -> (Vec<u8>, LoopInfo) {
    let decoder = FakeDecoder { available: true };
    let extraction = ContainerExtractor::new(&decoder).extract(container).unwrap();
    (extraction.wav, extraction.loop_info)
}

#[test]
fn test_untagged_round_trip_has_no_loop() {
    let dir = TempDir::new().unwrap();
    for frames in [500, 4096, 30_000] {
        let container = build(
            dir.path(),
            &[tagged_wav(44100, frames, &[])],
            1,
            BuildOptions::default(),
        );
        let (wav, info) = extract(&container);
        assert!(!info.has_loop);
        assert_eq!(read_loop_chunk(&wav).unwrap(), None);
    }
}

#[test]
fn test_loop_points_survive_round_trip() {
    let dir = TempDir::new().unwrap();
    let container = build(
        dir.path(),
        &[tagged_wav(44100, 20_000, &["LoopStart=1000", "LoopEnd=5000"])],
        1,
        BuildOptions::default(),
    );
    let (wav, info) = extract(&container);

    let smpl = read_loop_chunk(&wav).unwrap().unwrap();
    assert_eq!(smpl, info);
    assert!(smpl.start_sample.abs_diff(1000) <= SAMPLES_PER_PAGE);
    assert!(smpl.end_sample_inclusive.abs_diff(5000) <= SAMPLES_PER_PAGE);
}

#[test]
fn test_full_loop_spans_stream() {
    let dir = TempDir::new().unwrap();
    let container = build(
        dir.path(),
        &[tagged_wav(32000, 9000, &[])],
        1,
        BuildOptions { full_loop: true },
    );
    let (_, info) = extract(&container);
    assert!(info.has_loop);
    assert_eq!(info.start_sample, 0);
    assert!(info.end_sample_inclusive.abs_diff(8999) <= SAMPLES_PER_PAGE);
}

#[test]
fn test_multi_entry_layout() {
    let dir = TempDir::new().unwrap();
    let container = build(
        dir.path(),
        &[
            tagged_wav(44100, 1500, &[]),
            tagged_wav(48000, 12_345, &["LoopStart=4000", "MARK0=100"]),
        ],
        3,
        BuildOptions::default(),
    );

    let scd = ScdFile::parse(&container).unwrap();
    assert_eq!(scd.entry_count(), 3);
    assert_eq!(scd.declared_size().unwrap() as usize, container.len());
    for index in 0..2 {
        assert_eq!(scd.entry_range(index).unwrap().len() % 16, 0);
    }

    // Under 2048 samples still gets one seek point.
    let short = scd.entry(0).unwrap();
    assert_eq!(short.vorbis_extradata().unwrap().seek_table_size(), 4);

    let second = scd.entry(1).unwrap();
    assert_eq!(second.meta.sample_rate, 48000);
    let aux = second.aux.as_ref().unwrap();
    assert_eq!(aux.loop_start, 4000);
    assert_eq!(aux.loop_end, 12_345);
    assert_eq!(aux.marks, vec![100]);

    let seek_bytes = second.vorbis_extradata().unwrap().seek_table_size() as usize;
    let seek_table: Vec<u32> = second.extradata[0x20..0x20 + seek_bytes]
        .chunks(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    assert!(seek_table.len() > 1);
    assert!(seek_table.windows(2).all(|w| w[0] < w[1]));

    // The third entry had no source and is carried over untouched.
    assert_eq!(
        &container[scd.entry_range(2).unwrap()],
        &vorbis_template_entry(1)[..]
    );
}

#[test]
fn test_build_is_deterministic() {
    let dir = TempDir::new().unwrap();
    let wav = tagged_wav(44100, 7000, &["LoopStart=2000", "LoopEnd=6000"]);
    let first = build(dir.path(), &[wav.clone()], 1, BuildOptions::default());
    let second = build(dir.path(), &[wav], 1, BuildOptions::default());
    assert_eq!(first, second);
}

#[test]
fn test_extract_without_decoders_lists_paths() {
    let dir = TempDir::new().unwrap();
    let container = build(
        dir.path(),
        &[tagged_wav(44100, 3000, &[])],
        1,
        BuildOptions::default(),
    );
    let decoder = FakeDecoder { available: false };
    let err = ContainerExtractor::new(&decoder)
        .extract(&container)
        .unwrap_err();
    assert!(matches!(err, PatchError::NotFound(_)));
    let message = err.to_string();
    assert!(message.contains("tools/oggdec"));
    assert!(message.contains("tools/vgmstream-cli"));
}

#[test]
fn test_extract_file_writes_wav() {
    let dir = TempDir::new().unwrap();
    let container = build(
        dir.path(),
        &[tagged_wav(22050, 4000, &["LoopStart=2500", "LoopEnd=3500"])],
        1,
        BuildOptions::default(),
    );
    let input = dir.path().join("music.scd");
    let output = dir.path().join("music.wav");
    fs::write(&input, &container).unwrap();

    let decoder = FakeDecoder { available: true };
    let info = ContainerExtractor::new(&decoder)
        .extract_file(&input, &output)
        .unwrap();
    assert_eq!(info, LoopInfo::new(2500, 3499));
    assert_eq!(read_loop_chunk(&fs::read(&output).unwrap()).unwrap(), Some(info));
}
