//! Keyed stream cipher applied to the leading window of each asset payload,
//! plus the zlib layer, composed into a per-entry [`PayloadCodec`].

use crate::asset::{AssetHeader, SEED_SIZE};
use crate::error::{PatchError, Result};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use log::debug;
use std::io::{Read, Write};

pub const KEY_SIZE: usize = 16;
pub const DEFAULT_PASS_COUNT: u32 = 10;
pub const DEFAULT_WINDOW: usize = 0x100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherParams {
    pub pass_count: u32,
    /// Number of leading payload bytes that are keyed; the rest is plain.
    pub window: usize,
}

impl Default for CipherParams {
    fn default() -> Self {
        Self {
            pass_count: DEFAULT_PASS_COUNT,
            window: DEFAULT_WINDOW,
        }
    }
}

pub type Key = [u8; KEY_SIZE];

pub fn derive_key(seed: &[u8], pass_count: u32) -> Result<Key> {
    if seed.len() < KEY_SIZE {
        return Err(PatchError::Encryption(format!(
            "seed must be at least {} bytes, got {}",
            KEY_SIZE,
            seed.len()
        )));
    }

    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&seed[..KEY_SIZE]);
    for pass in 0..pass_count {
        for (j, byte) in key.iter_mut().enumerate() {
            *byte ^= (pass as usize + j) as u8;
        }
    }
    Ok(key)
}

/// XORs the keystream over `buffer[offset..offset + min(len, window)]`.
/// Applying it twice restores the input.
pub fn transform(key: &Key, buffer: &mut [u8], offset: usize, params: CipherParams) {
    if offset >= buffer.len() {
        return;
    }
    let keyed = (buffer.len() - offset).min(params.window);

    for (block_index, block) in buffer[offset..offset + keyed]
        .chunks_mut(KEY_SIZE)
        .enumerate()
    {
        for (j, byte) in block.iter_mut().enumerate() {
            *byte ^= keystream_byte(key, block_index * KEY_SIZE + j, params.pass_count);
        }
    }
}

fn keystream_byte(key: &Key, index: usize, pass_count: u32) -> u8 {
    (0..pass_count as usize).fold(0u8, |acc, pass| acc ^ key[(index + pass) % KEY_SIZE])
}

/// Encode/decode capability for one entry's payload: a keyed layer over the
/// leading window and an optional compression layer under it.
pub trait PayloadCodec {
    fn compress(&self, plain: &[u8]) -> Result<Vec<u8>>;

    fn decompress(&self, data: &[u8], expected: usize) -> Result<Vec<u8>>;

    /// Applies (or removes, it is self-inverse) the keyed layer in place.
    fn apply_cipher(&self, header: &AssetHeader, data: &mut [u8]) -> Result<()>;

    /// Removes only the keyed layer, leaving compressed payloads compressed.
    fn decrypt(&self, header: &AssetHeader, stored: &[u8]) -> Result<Vec<u8>> {
        let mut data = stored.to_vec();
        if header.is_encrypted() {
            self.apply_cipher(header, &mut data)?;
        }
        Ok(data)
    }

    /// Fully decodes a stored payload span.
    fn decode(&self, header: &AssetHeader, stored: &[u8]) -> Result<Vec<u8>> {
        let expected = header.decompressed_length.max(0) as usize;
        let mut plain = self.decrypt(header, stored)?;
        if header.is_compressed() {
            plain = self.decompress(&plain, expected)?;
        }
        plain.truncate(expected);
        Ok(plain)
    }
}

/// zlib + windowed XOR, keyed by the serialized header.
#[derive(Debug, Clone, Copy, Default)]
pub struct EgsCodec {
    pub params: CipherParams,
}

impl EgsCodec {
    pub fn new(params: CipherParams) -> Self {
        Self { params }
    }
}

impl PayloadCodec for EgsCodec {
    fn compress(&self, plain: &[u8]) -> Result<Vec<u8>> {
        compress(plain)
    }

    fn decompress(&self, data: &[u8], expected: usize) -> Result<Vec<u8>> {
        decompress(data, expected)
    }

    fn apply_cipher(&self, header: &AssetHeader, data: &mut [u8]) -> Result<()> {
        let seed = header.to_seed()?;
        debug_assert_eq!(seed.len(), SEED_SIZE);
        let key = derive_key(&seed, self.params.pass_count)?;
        transform(&key, data, 0, self.params);
        Ok(())
    }
}

pub fn compress(plain: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(plain)
        .map_err(|e| PatchError::Compression(e.to_string()))?;
    let compressed = encoder
        .finish()
        .map_err(|e| PatchError::Compression(e.to_string()))?;
    debug!("zlib: {} -> {} bytes", plain.len(), compressed.len());
    Ok(compressed)
}

pub fn decompress(data: &[u8], expected: usize) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut plain = Vec::with_capacity(expected);
    decoder
        .read_to_end(&mut plain)
        .map_err(|e| PatchError::Compression(format!("inflate failed: {}", e)))?;
    if plain.len() < expected {
        return Err(PatchError::Compression(format!(
            "inflated {} bytes but header declares {}",
            plain.len(),
            expected
        )));
    }
    Ok(plain)
}
