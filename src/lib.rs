//! Patching toolkit for hashed index/blob game archives and the SCD audio
//! containers stored inside them.

pub mod archive;
pub mod asset;
pub mod binary;
pub mod builder;
pub mod cipher;
pub mod error;
pub mod extractor;
pub mod hed;
pub mod names;
pub mod ogg;
pub mod patch;
pub mod scd;
pub mod tools;
pub mod wav;

pub use archive::{Archive, ArchivePair};
pub use builder::{BuildOptions, ContainerBuilder};
pub use cipher::{CipherParams, EgsCodec, PayloadCodec};
pub use error::{PatchError, Result};
pub use extractor::ContainerExtractor;
pub use names::{NameTable, PatchTree};
pub use patch::{ArchivePatchEngine, EntryOutcome, PatchOptions, PatchProgress, PatchReport};
pub use tools::{AudioDecoder, AudioEncoder, Toolchain};
pub use wav::LoopInfo;
