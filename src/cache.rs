//! Content-keyed caches for the expensive remapping intermediates.
//!
//! Deflected-angle buffers are spectrally expensive to build and exactly
//! reproducible from their inputs, so they are memoized under a structural
//! fingerprint (deflection content + grid + band). Caches are owned by the
//! engine instance that fills them; concurrent reconstructions each own an
//! independent cache.

use indexmap::IndexMap;
use rustc_hash::{FxBuildHasher, FxHasher};
use std::hash::Hasher;
use std::path::PathBuf;

use crate::errors::DelensError;

/// A cache entry label plus the content fingerprint of its inputs.
pub type CacheKey = (&'static str, u64);

/// Cached payloads are small sets of equal-status f64 buffers (angle pairs,
/// displacement component pairs).
pub type CachedArrays = Vec<Vec<f64>>;

pub trait Cacher
{
    fn is_cached(&self, key: &CacheKey) -> bool;
    fn store(&mut self, key: CacheKey, value: CachedArrays) -> Result<(), DelensError>;
    fn load(&self, key: &CacheKey) -> Result<CachedArrays, DelensError>;
}

/// Never caches; every request recomputes.
#[derive(Default, Clone, Copy, Debug)]
pub struct NoCacher;

impl Cacher for NoCacher
{
    fn is_cached(&self, _key: &CacheKey) -> bool
    {
        false
    }

    fn store(&mut self, _key: CacheKey, _value: CachedArrays) -> Result<(), DelensError>
    {
        Ok(())
    }

    fn load(&self, _key: &CacheKey) -> Result<CachedArrays, DelensError>
    {
        Err(DelensError::CacheMiss)
    }
}

/// In-memory cache with deterministic iteration order.
#[derive(Default)]
pub struct MemCacher
{
    entries: IndexMap<CacheKey, CachedArrays, FxBuildHasher>,
}

impl MemCacher
{
    pub fn new() -> Self
    {
        Self::default()
    }

    pub fn len(&self) -> usize
    {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.entries.is_empty()
    }
}

impl Cacher for MemCacher
{
    fn is_cached(&self, key: &CacheKey) -> bool
    {
        self.entries.contains_key(key)
    }

    fn store(&mut self, key: CacheKey, value: CachedArrays) -> Result<(), DelensError>
    {
        self.entries.insert(key, value);
        Ok(())
    }

    fn load(&self, key: &CacheKey) -> Result<CachedArrays, DelensError>
    {
        self.entries.get(key).cloned().ok_or(DelensError::CacheMiss)
    }
}

/// Disk-backed cache: one lz4-compressed bincode payload per key under an
/// owned directory. Survives process restarts; stale entries are avoided by
/// the content fingerprint in the file name.
pub struct DiskCacher
{
    dir: PathBuf,
}

impl DiskCacher
{
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, DelensError>
    {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|_| DelensError::FileIOError)?;
        Ok(Self { dir })
    }

    fn path(&self, key: &CacheKey) -> PathBuf
    {
        self.dir.join(format!("{}_{:016x}.bin", key.0, key.1))
    }
}

impl Cacher for DiskCacher
{
    fn is_cached(&self, key: &CacheKey) -> bool
    {
        self.path(key).exists()
    }

    fn store(&mut self, key: CacheKey, value: CachedArrays) -> Result<(), DelensError>
    {
        let raw = bincode::serde::encode_to_vec(&value, bincode::config::standard())
            .map_err(|_| DelensError::SerializationFailed)?;
        let compressed = lz4_flex::compress_prepend_size(&raw);
        std::fs::write(self.path(&key), compressed).map_err(|_| DelensError::FileIOError)
    }

    fn load(&self, key: &CacheKey) -> Result<CachedArrays, DelensError>
    {
        let compressed = std::fs::read(self.path(key)).map_err(|_| DelensError::CacheMiss)?;
        let raw = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|_| DelensError::LZ4DecompressionFailed)?;
        let (value, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|_| DelensError::DeserializationFailed)?;
        Ok(value)
    }
}

/// Incremental structural fingerprint over heterogeneous numeric content.
#[derive(Default)]
pub struct FingerprintBuilder
{
    hasher: FxHasher,
}

impl FingerprintBuilder
{
    pub fn new() -> Self
    {
        Self::default()
    }

    pub fn with_u64(mut self, v: u64) -> Self
    {
        self.hasher.write_u64(v);
        self
    }

    pub fn with_usize(mut self, v: usize) -> Self
    {
        self.hasher.write_usize(v);
        self
    }

    pub fn with_f64s(mut self, vs: &[f64]) -> Self
    {
        for v in vs {
            self.hasher.write_u64(v.to_bits());
        }
        self
    }

    pub fn finish(self) -> u64
    {
        self.hasher.finish()
    }
}
