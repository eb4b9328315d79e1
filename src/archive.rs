//! An opened index/blob pair: listing and unpacking.

use crate::asset::{AssetContainer, AssetHeader};
use crate::cipher::PayloadCodec;
use crate::error::{PatchError, Result};
use crate::hed::{IndexEntry, read_index_file};
use crate::names::{NameTable, fallback_name};
use log::{debug, info, warn};
use std::fs::{self, create_dir_all};
use std::path::{Path, PathBuf};

pub const INDEX_EXTENSION: &str = "hed";
pub const BLOB_EXTENSION: &str = "pkg";

/// The two files of one archive, side by side on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivePair {
    pub index: PathBuf,
    pub blob: PathBuf,
}

impl ArchivePair {
    pub fn new<P: Into<PathBuf>>(index: P, blob: P) -> Self {
        Self {
            index: index.into(),
            blob: blob.into(),
        }
    }

    /// `kh2_first` in `dir` → `dir/kh2_first.hed` + `dir/kh2_first.pkg`.
    pub fn in_dir(dir: &Path, name: &str) -> Self {
        Self {
            index: dir.join(format!("{}.{}", name, INDEX_EXTENSION)),
            blob: dir.join(format!("{}.{}", name, BLOB_EXTENSION)),
        }
    }

    /// Accepts either file of the pair and derives the other.
    pub fn from_path(path: &Path) -> Self {
        Self {
            index: path.with_extension(INDEX_EXTENSION),
            blob: path.with_extension(BLOB_EXTENSION),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEntry {
    pub entry: IndexEntry,
    pub name: String,
    pub known: bool,
    /// `None` for empty entries or headers that failed to parse.
    pub header: Option<AssetHeader>,
}

pub struct Archive {
    pub index: Vec<IndexEntry>,
    pub blob: Vec<u8>,
}

impl Archive {
    pub fn open(pair: &ArchivePair) -> Result<Self> {
        let index = read_index_file(&pair.index)?;
        if !pair.blob.is_file() {
            return Err(PatchError::NotFound(format!("blob {}", pair.blob.display())));
        }
        let blob = fs::read(&pair.blob)?;
        info!(
            "Opened {}: {} entries, {} blob bytes",
            pair.index.display(),
            index.len(),
            blob.len()
        );
        Ok(Self { index, blob })
    }

    pub fn entry_bytes(&self, entry: &IndexEntry) -> Result<&[u8]> {
        Ok(&self.blob[entry.range(self.blob.len() as u64)?])
    }

    pub fn list(&self, names: &NameTable) -> Vec<ListedEntry> {
        self.index
            .iter()
            .map(|entry| {
                let header = match entry.stored_length {
                    0 => None,
                    _ => self
                        .entry_bytes(entry)
                        .and_then(AssetContainer::parse)
                        .map(|container| container.header)
                        .map_err(|e| debug!("{}: {}", entry.hash_hex(), e))
                        .ok(),
                };
                let (name, known) = match names.get(&entry.hash) {
                    Some(name) => (name.to_string(), true),
                    None => (fallback_name(&entry.hash), false),
                };
                ListedEntry {
                    entry: *entry,
                    name,
                    known,
                    header,
                }
            })
            .collect()
    }

    /// Decodes every entry matching `target` (all entries when `None`) into
    /// `out_dir`, sub-assets under `remastered/<name>/`. Returns files written.
    pub fn unpack(
        &self,
        names: &NameTable,
        codec: &dyn PayloadCodec,
        target: Option<&str>,
        out_dir: &Path,
    ) -> Result<usize> {
        let listing = self.list(names);
        let selected: Vec<_> = listing
            .iter()
            .filter(|listed| target.is_none_or(|t| listed.name.eq_ignore_ascii_case(t)))
            .collect();
        if let (Some(target), true) = (target, selected.is_empty()) {
            return Err(PatchError::NotFound(target.to_string()));
        }

        let mut written = 0;
        for listed in selected {
            if listed.entry.stored_length == 0 {
                warn!("{} has no stored bytes, skipping", listed.name);
                continue;
            }
            let container = AssetContainer::parse(self.entry_bytes(&listed.entry)?)?;
            let payload = container.decoded_payload(codec)?;
            write_file(&out_dir.join(&listed.name), &payload)?;
            written += 1;

            for (index, sub) in container.sub_assets.iter().enumerate() {
                let data = container.decoded_sub_payload(index, codec)?;
                let path = out_dir
                    .join(crate::names::REMASTERED_DIR)
                    .join(&listed.name)
                    .join(&sub.name);
                write_file(&path, &data)?;
                written += 1;
            }
        }
        Ok(written)
    }
}

fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }
    info!("Extracting: {} ({} bytes)", path.display(), data.len());
    fs::write(path, data)?;
    Ok(())
}
