//! Hash → asset-name resolution and the on-disk patch tree.

use crate::error::{PatchError, Result};
use crate::hed::{ContentHash, content_hash};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Read-only table of names the game is known to reference.
#[derive(Debug, Default, Clone)]
pub struct NameTable {
    names: HashMap<ContentHash, String>,
}

impl NameTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names = names
            .into_iter()
            .map(|name| {
                let name = name.into();
                (content_hash(&name), name)
            })
            .collect();
        Self { names }
    }

    /// One name per line; blank lines and `#` comments are skipped.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| PatchError::NotFound(format!("name list {}: {}", path.display(), e)))?;
        let table = Self::from_names(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#')),
        );
        info!("Loaded {} known names from {}", table.len(), path.display());
        Ok(table)
    }

    pub fn get(&self, hash: &ContentHash) -> Option<&str> {
        self.names.get(hash).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedName {
    pub name: String,
    pub known: bool,
}

pub fn fallback_name(hash: &ContentHash) -> String {
    format!("{}.dat", hex::encode(hash))
}

/// A patch directory with `original/`, `raw/` and `remastered/` subtrees.
#[derive(Debug, Default)]
pub struct PatchTree {
    /// Every relative path the tree mentions, keyed by its hash.
    names: HashMap<ContentHash, String>,
    original: BTreeMap<String, PathBuf>,
    raw: BTreeMap<String, PathBuf>,
    /// Asset name → (sub-asset name → file).
    remastered: BTreeMap<String, BTreeMap<String, PathBuf>>,
}

pub const ORIGINAL_DIR: &str = "original";
pub const RAW_DIR: &str = "raw";
pub const REMASTERED_DIR: &str = "remastered";
pub const AUDIO_EXTENSION: &str = ".scd";

impl PatchTree {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn scan<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(PatchError::NotFound(format!(
                "patch directory {}",
                root.display()
            )));
        }

        let mut tree = Self::default();
        tree.original = scan_files(&root.join(ORIGINAL_DIR))?;
        tree.raw = scan_files(&root.join(RAW_DIR))?;

        for (relative, path) in scan_files(&root.join(REMASTERED_DIR))? {
            match relative.rsplit_once('/') {
                Some((asset, sub_name)) => {
                    tree.remastered
                        .entry(asset.to_string())
                        .or_default()
                        .insert(sub_name.to_string(), path);
                }
                None => warn!("remastered/{} is not inside an asset folder", relative),
            }
        }

        let mentioned: Vec<String> = tree
            .original
            .keys()
            .flat_map(|name| {
                let mut names = vec![name.clone()];
                names.extend(audio_assets_for_source(name));
                names
            })
            .chain(tree.raw.keys().cloned())
            .chain(tree.remastered.keys().cloned())
            .collect();
        for name in mentioned {
            tree.names.insert(content_hash(&name), name);
        }

        info!(
            "Patch tree {}: {} original, {} raw, {} remastered assets",
            root.display(),
            tree.original.len(),
            tree.raw.len(),
            tree.remastered.len()
        );
        Ok(tree)
    }

    /// Resolves an index hash: known table first, then the patch tree, then
    /// a `<hash>.dat` placeholder.
    pub fn resolve(&self, known: &NameTable, hash: &ContentHash) -> ResolvedName {
        if let Some(name) = known.get(hash) {
            return ResolvedName {
                name: name.to_string(),
                known: true,
            };
        }
        if let Some(name) = self.names.get(hash) {
            return ResolvedName {
                name: name.clone(),
                known: true,
            };
        }
        ResolvedName {
            name: fallback_name(hash),
            known: false,
        }
    }

    pub fn original(&self, name: &str) -> Option<&Path> {
        self.original.get(name).map(PathBuf::as_path)
    }

    pub fn raw(&self, name: &str) -> Option<&Path> {
        self.raw.get(name).map(PathBuf::as_path)
    }

    pub fn remastered(&self, name: &str) -> Option<&BTreeMap<String, PathBuf>> {
        self.remastered.get(name)
    }

    /// WAV sources for an audio container, keyed by internal entry index.
    /// `<stem>.wav` feeds entry 0, `<stem>_<n>.wav` feeds entry n.
    pub fn audio_sources(&self, name: &str) -> BTreeMap<usize, PathBuf> {
        let mut sources = BTreeMap::new();
        let Some(stem) = name.strip_suffix(AUDIO_EXTENSION) else {
            return sources;
        };
        for (relative, path) in &self.original {
            let Some(source_stem) = relative.strip_suffix(".wav") else {
                continue;
            };
            if source_stem == stem {
                sources.insert(0, path.clone());
            } else if let Some(index) = source_stem
                .strip_prefix(stem)
                .and_then(|rest| rest.strip_prefix('_'))
                .and_then(|n| n.parse::<usize>().ok())
            {
                sources.insert(index, path.clone());
            }
        }
        sources
    }

    /// `raw/` and `original/` files with no entry in `existing`. WAVs that
    /// feed an audio container in `existing` are consumed by it; any other
    /// WAV stands alone like every other file.
    pub fn standalone_names(&self, existing: &HashSet<ContentHash>) -> Vec<String> {
        let mut names: Vec<String> = self
            .raw
            .keys()
            .chain(self.original.keys())
            .filter(|name| !existing.contains(&content_hash(name)))
            .filter(|name| {
                !audio_assets_for_source(name)
                    .iter()
                    .any(|asset| existing.contains(&content_hash(asset)))
            })
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

/// Containers a WAV may feed: `bgm/music100.wav` → `bgm/music100.scd`,
/// `bgm/music100_1.wav` → `bgm/music100.scd` or `bgm/music100_1.scd`.
fn audio_assets_for_source(name: &str) -> Vec<String> {
    let Some(stem) = name.strip_suffix(".wav") else {
        return Vec::new();
    };
    let mut assets = vec![format!("{}{}", stem, AUDIO_EXTENSION)];
    if let Some((base, n)) = stem.rsplit_once('_') {
        if n.parse::<usize>().is_ok() {
            assets.push(format!("{}{}", base, AUDIO_EXTENSION));
        }
    }
    assets
}

fn scan_files(dir: &Path) -> Result<BTreeMap<String, PathBuf>> {
    let mut files = BTreeMap::new();
    if !dir.is_dir() {
        return Ok(files);
    }
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| PatchError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| PatchError::Parse(e.to_string()))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        debug!("patch file: {}", relative);
        files.insert(relative, entry.path().to_path_buf());
    }
    Ok(files)
}
