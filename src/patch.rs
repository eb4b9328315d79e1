//! Rewrites an index/blob pair, swapping in assets from a patch tree.

use crate::archive::{Archive, ArchivePair};
use crate::asset::{AssetContainer, AssetEntryBuilder, AssetHeader, RAW, SubAssetSource};
use crate::binary::read_u32_at;
use crate::builder::{BuildOptions, ContainerBuilder};
use crate::cipher::{CipherParams, EgsCodec};
use crate::error::{PatchError, Result};
use crate::hed::{ContentHash, IndexEntry, content_hash, serialize_index};
use crate::names::{AUDIO_EXTENSION, NameTable, PatchTree};
use crate::tools::AudioEncoder;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::fs::{self, create_dir_all};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;

pub const DEFAULT_HANG_THRESHOLD: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct PatchOptions {
    pub cipher: CipherParams,
    /// Longest the first rebuilt entry may take before the run is abandoned.
    pub hang_threshold: Duration,
    pub build: BuildOptions,
}

impl Default for PatchOptions {
    fn default() -> Self {
        Self {
            cipher: CipherParams::default(),
            hang_threshold: DEFAULT_HANG_THRESHOLD,
            build: BuildOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    Kept,
    /// No stored bytes; the record was copied.
    Empty,
    Replaced,
    /// Injected verbatim from `raw/`.
    Raw,
    /// Replacement failed; the original bytes were re-emitted.
    Failed,
    /// A patch file with no original entry.
    Appended,
}

#[derive(Debug, Clone, Copy)]
pub struct PatchProgress<'a> {
    pub index: usize,
    pub total: usize,
    pub name: &'a str,
    pub outcome: EntryOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchReport {
    pub entries: usize,
    /// Original entries whose bytes were swapped.
    pub replaced: usize,
    /// Patch files appended as new entries.
    pub included: usize,
    /// Names of entries that fell back to their original bytes.
    pub failed: Vec<String>,
}

#[derive(Debug)]
pub struct PatchedArchive {
    pub index: Vec<IndexEntry>,
    pub blob: Vec<u8>,
    pub report: PatchReport,
}

struct EntryResult {
    bytes: Vec<u8>,
    actual_length: i32,
    outcome: EntryOutcome,
}

pub struct ArchivePatchEngine<'a> {
    names: &'a NameTable,
    tree: &'a PatchTree,
    encoder: &'a dyn AudioEncoder,
    options: PatchOptions,
    codec: EgsCodec,
}

impl<'a> ArchivePatchEngine<'a> {
    pub fn new(
        names: &'a NameTable,
        tree: &'a PatchTree,
        encoder: &'a dyn AudioEncoder,
        options: PatchOptions,
    ) -> Self {
        Self {
            names,
            tree,
            encoder,
            options,
            codec: EgsCodec::new(options.cipher),
        }
    }

    /// Patches `input` into `output`. Both files are written to temporaries
    /// and only renamed into place once every entry is resolved.
    pub fn patch_files<F>(
        &self,
        input: &ArchivePair,
        output: &ArchivePair,
        progress: F,
    ) -> Result<PatchReport>
    where
        F: FnMut(PatchProgress<'_>),
    {
        let archive = Archive::open(input)?;
        let patched = self.patch(&archive.index, &archive.blob, progress)?;
        drop(archive);

        let index_bytes = serialize_index(&patched.index)?;
        let staged_index = stage(&output.index, &index_bytes)?;
        let staged_blob = stage(&output.blob, &patched.blob)?;
        staged_index
            .persist(&output.index)
            .map_err(|e| PatchError::Io(e.error))?;
        staged_blob
            .persist(&output.blob)
            .map_err(|e| PatchError::Io(e.error))?;

        info!(
            "Wrote {} ({} entries) and {} ({} bytes)",
            output.index.display(),
            patched.index.len(),
            output.blob.display(),
            patched.blob.len()
        );
        Ok(patched.report)
    }

    /// Processes every record in order, then appends unmatched patch files.
    pub fn patch<F>(&self, index: &[IndexEntry], blob: &[u8], mut progress: F) -> Result<PatchedArchive>
    where
        F: FnMut(PatchProgress<'_>),
    {
        let total = index.len();
        let mut new_index = Vec::with_capacity(total);
        let mut new_blob = Vec::with_capacity(blob.len());
        let mut report = PatchReport {
            entries: total,
            ..PatchReport::default()
        };
        let mut timed_first = false;

        for (position, entry) in index.iter().enumerate() {
            let resolved = self.tree.resolve(self.names, &entry.hash);
            if !resolved.known {
                debug!("#{}: name unknown for {}", position, entry.hash_hex());
            }

            if entry.stored_length == 0 {
                new_index.push(*entry);
                progress(PatchProgress {
                    index: position,
                    total,
                    name: &resolved.name,
                    outcome: EntryOutcome::Empty,
                });
                continue;
            }

            let started = Instant::now();
            let result = self.process_entry(entry, &resolved.name, blob);
            let elapsed = started.elapsed();

            let result = match result {
                Ok(result) => result,
                Err(e) if e.is_fatal() => {
                    error!("#{} {}: {}", position, resolved.name, e);
                    return Err(e);
                }
                Err(e) => {
                    error!("#{} {}: {}; keeping original bytes", position, resolved.name, e);
                    report.failed.push(resolved.name.clone());
                    EntryResult {
                        bytes: blob[entry.range(blob.len() as u64)?].to_vec(),
                        actual_length: entry.actual_length,
                        outcome: EntryOutcome::Failed,
                    }
                }
            };

            if result.outcome != EntryOutcome::Kept && !timed_first {
                timed_first = true;
                if elapsed > self.options.hang_threshold {
                    return Err(PatchError::HangDetected {
                        elapsed,
                        limit: self.options.hang_threshold,
                    });
                }
            }

            if matches!(result.outcome, EntryOutcome::Replaced | EntryOutcome::Raw) {
                report.replaced += 1;
                info!(
                    "#{} {}: {} -> {} bytes",
                    position,
                    resolved.name,
                    entry.stored_length,
                    result.bytes.len()
                );
            }

            new_index.push(IndexEntry {
                hash: entry.hash,
                actual_length: result.actual_length,
                stored_length: result.bytes.len() as i32,
                offset: new_blob.len() as i64,
            });
            new_blob.extend_from_slice(&result.bytes);
            progress(PatchProgress {
                index: position,
                total,
                name: &resolved.name,
                outcome: result.outcome,
            });
        }

        let existing: HashSet<ContentHash> = index.iter().map(|entry| entry.hash).collect();
        for name in self.tree.standalone_names(&existing) {
            let hash = content_hash(&name);
            let result = match self.standalone_entry(&name) {
                Ok(result) => result,
                Err(e) => {
                    error!("new entry {}: {}", name, e);
                    report.failed.push(name);
                    continue;
                }
            };
            info!("Appending {} ({} bytes)", name, result.bytes.len());
            new_index.push(IndexEntry {
                hash,
                actual_length: result.actual_length,
                stored_length: result.bytes.len() as i32,
                offset: new_blob.len() as i64,
            });
            new_blob.extend_from_slice(&result.bytes);
            report.included += 1;
            progress(PatchProgress {
                index: new_index.len() - 1,
                total,
                name: &name,
                outcome: result.outcome,
            });
        }

        info!(
            "Patched {} entries: {} replaced, {} included, {} failed",
            report.entries,
            report.replaced,
            report.included,
            report.failed.len()
        );
        Ok(PatchedArchive {
            index: new_index,
            blob: new_blob,
            report,
        })
    }

    fn process_entry(&self, entry: &IndexEntry, name: &str, blob: &[u8]) -> Result<EntryResult> {
        let stored = &blob[entry.range(blob.len() as u64)?];

        if let Some(path) = self.tree.raw(name) {
            return raw_entry(path);
        }

        let container = AssetContainer::parse(stored)?;
        let replacement = self.main_replacement(name, &container)?;
        let sub_data = self.sub_replacements(name, &container)?;
        let replaces_sub = sub_data.iter().any(Option::is_some);

        if replacement.is_none() && !replaces_sub {
            return Ok(EntryResult {
                bytes: stored.to_vec(),
                actual_length: entry.actual_length,
                outcome: EntryOutcome::Kept,
            });
        }

        let plain = match replacement {
            Some(plain) => plain,
            None => container.decoded_payload(&self.codec)?,
        };
        let sources: Vec<SubAssetSource<'_>> = sub_data
            .iter()
            .map(|data| match data {
                Some(data) => SubAssetSource::Replace(data),
                None => SubAssetSource::Keep,
            })
            .collect();
        let built = AssetEntryBuilder::new(&self.codec).build(
            &container.header,
            &plain,
            Some(&container),
            &sources,
        )?;
        Ok(EntryResult {
            bytes: built.bytes,
            actual_length: built.actual_length,
            outcome: EntryOutcome::Replaced,
        })
    }

    /// New main payload: an `original/` file, or an audio container rebuilt
    /// from WAV sources with the current payload as template.
    fn main_replacement(&self, name: &str, container: &AssetContainer<'_>) -> Result<Option<Vec<u8>>> {
        if let Some(path) = self.tree.original(name) {
            debug!("{}: replacing from {}", name, path.display());
            return Ok(Some(fs::read(path)?));
        }
        if !name.ends_with(AUDIO_EXTENSION) {
            return Ok(None);
        }
        let sources = self.tree.audio_sources(name);
        if sources.is_empty() {
            return Ok(None);
        }
        let template = container.decoded_payload(&self.codec)?;
        let builder = ContainerBuilder::new(self.encoder, self.options.build);
        builder.build(&template, &sources).map(Some)
    }

    /// Replacement bytes per sub-asset, in table order.
    fn sub_replacements(
        &self,
        name: &str,
        container: &AssetContainer<'_>,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        let Some(files) = self.tree.remastered(name) else {
            return Ok(Vec::new());
        };
        container
            .sub_assets
            .iter()
            .map(|sub| match files.get(&sub.name) {
                Some(path) => {
                    debug!("{}: sub-asset {} from {}", name, sub.name, path.display());
                    Ok(Some(fs::read(path)?))
                }
                None => Ok(None),
            })
            .collect()
    }

    /// A patch file with no original entry, stored raw.
    fn standalone_entry(&self, name: &str) -> Result<EntryResult> {
        if let Some(path) = self.tree.raw(name) {
            let mut result = raw_entry(path)?;
            result.outcome = EntryOutcome::Appended;
            return Ok(result);
        }
        let path = self
            .tree
            .original(name)
            .ok_or_else(|| PatchError::NotFound(name.to_string()))?;
        let plain = fs::read(path)?;
        let template = AssetHeader {
            compressed_length: RAW,
            creation_date: creation_date(),
            ..AssetHeader::default()
        };
        let built = AssetEntryBuilder::new(&self.codec).build(&template, &plain, None, &[])?;
        Ok(EntryResult {
            bytes: built.bytes,
            actual_length: built.actual_length,
            outcome: EntryOutcome::Appended,
        })
    }
}

/// `raw/` files are complete entries; their first field is the actual length.
fn raw_entry(path: &Path) -> Result<EntryResult> {
    let bytes = fs::read(path)?;
    let actual_length = read_u32_at(&bytes, 0).map_err(|_| {
        PatchError::malformed(format!("{} is shorter than an entry header", path.display()))
    })? as i32;
    Ok(EntryResult {
        bytes,
        actual_length,
        outcome: EntryOutcome::Raw,
    })
}

fn creation_date() -> i32 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(since) => since.as_secs() as i32,
        Err(_) => {
            warn!("system clock is before 1970, using 0 as creation date");
            0
        }
    }
}

fn stage(target: &Path, data: &[u8]) -> Result<NamedTempFile> {
    let dir = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    create_dir_all(dir)?;
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(data)?;
    file.flush()?;
    Ok(file)
}
