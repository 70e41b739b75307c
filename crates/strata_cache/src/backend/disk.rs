//! Persistent backend: one file per key under `<root>/<namespace>/`.
//!
//! ## File layout
//!
//! ```text
//! [0]      flags      (bit 0 = LZ4, payload carries its size prefix)
//! [1..9]   expiry     (u64 LE, unix millis, u64::MAX = never)
//! [9..]    payload
//! ```
//!
//! Writes go to a temporary file and are renamed into place. Corrupt or
//! expired files are deleted on read and reported as misses.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use lz4_flex::{compress_prepend_size, decompress_size_prepended};

use super::{expiry_ms, CacheBackend, PutOptions};
use crate::error::{CacheError, CacheResult};

const FLAG_LZ4: u8 = 0b0000_0001;
const HEADER_LEN: usize = 9;
const ENTRY_EXT: &str = "entry";

/// Directory-backed persistent cache.
#[derive(Debug, Clone)]
pub struct DiskCacheBackend {
    root: PathBuf,
}

impl DiskCacheBackend {
    /// Opens (creating if needed) a cache rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Io` if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> CacheResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| CacheError::io(&root, e))?;
        Ok(Self { root })
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of entry files in `namespace`.
    ///
    /// # Errors
    ///
    /// Directory listing failures.
    pub fn len(&self, namespace: &str) -> CacheResult<usize> {
        Ok(self.list_entries(&self.namespace_dir(namespace)?)?.len())
    }

    fn namespace_dir(&self, namespace: &str) -> CacheResult<PathBuf> {
        if namespace.is_empty() {
            return Err(CacheError::InvalidKey("empty namespace".into()));
        }
        Ok(self.root.join(encode_component(namespace)))
    }

    fn entry_path(&self, namespace: &str, key: &str) -> CacheResult<PathBuf> {
        if key.is_empty() {
            return Err(CacheError::InvalidKey("empty key".into()));
        }
        let mut path = self.namespace_dir(namespace)?.join(encode_component(key));
        path.set_extension(ENTRY_EXT);
        Ok(path)
    }

    fn list_entries(&self, dir: &Path) -> CacheResult<Vec<(SystemTime, PathBuf)>> {
        let listing = match fs::read_dir(dir) {
            Ok(listing) => listing,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CacheError::io(dir, e)),
        };
        let mut entries = Vec::new();
        for item in listing {
            let item = item.map_err(|e| CacheError::io(dir, e))?;
            let path = item.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(ENTRY_EXT) {
                continue;
            }
            let modified = item
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(UNIX_EPOCH);
            entries.push((modified, path));
        }
        Ok(entries)
    }

    fn trim(&self, dir: &Path, max_entries: usize) -> CacheResult<()> {
        if max_entries == 0 {
            return Ok(());
        }
        let mut entries = self.list_entries(dir)?;
        if entries.len() <= max_entries {
            return Ok(());
        }
        entries.sort();
        let excess = entries.len() - max_entries;
        for (_, path) in entries.into_iter().take(excess) {
            remove_quietly(&path);
        }
        tracing::trace!(dir = %dir.display(), removed = excess, "disk cache trimmed");
        Ok(())
    }
}

impl CacheBackend for DiskCacheBackend {
    fn get(&self, namespace: &str, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let path = self.entry_path(namespace, key)?;
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::io(&path, e)),
        };

        match decode(&path, &raw, unix_millis()) {
            Ok(Some(value)) => Ok(Some(value)),
            Ok(None) => {
                remove_quietly(&path);
                Ok(None)
            }
            Err(err @ CacheError::Corrupt { .. }) => {
                tracing::warn!(error = %err, "dropping corrupt disk cache entry");
                remove_quietly(&path);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn put(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
        options: &PutOptions,
    ) -> CacheResult<()> {
        let path = self.entry_path(namespace, key)?;
        let dir = self.namespace_dir(namespace)?;
        fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))?;

        let encoded = encode(&value, expiry_ms(unix_millis(), options.ttl), options.compressed);
        let staging = path.with_extension("tmp");
        fs::write(&staging, &encoded).map_err(|e| CacheError::io(&staging, e))?;
        fs::rename(&staging, &path).map_err(|e| CacheError::io(&path, e))?;

        self.trim(&dir, options.max_entries)
    }

    fn remove(&self, namespace: &str, key: &str) -> CacheResult<bool> {
        let path = self.entry_path(namespace, key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CacheError::io(&path, e)),
        }
    }
}

fn encode(value: &[u8], expires_at_ms: u64, compressed: bool) -> Vec<u8> {
    let payload = if compressed {
        compress_prepend_size(value)
    } else {
        value.to_vec()
    };
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(if compressed { FLAG_LZ4 } else { 0 });
    out.extend_from_slice(&expires_at_ms.to_le_bytes());
    out.extend_from_slice(&payload);
    out
}

/// `Ok(None)` means expired.
fn decode(path: &Path, raw: &[u8], now_ms: u64) -> CacheResult<Option<Vec<u8>>> {
    if raw.len() < HEADER_LEN {
        return Err(CacheError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("{} byte file is shorter than the header", raw.len()),
        });
    }
    let flags = raw[0];
    let mut expiry = [0u8; 8];
    expiry.copy_from_slice(&raw[1..HEADER_LEN]);
    if u64::from_le_bytes(expiry) <= now_ms {
        return Ok(None);
    }

    let payload = &raw[HEADER_LEN..];
    if flags & FLAG_LZ4 == 0 {
        return Ok(Some(payload.to_vec()));
    }
    decompress_size_prepended(payload)
        .map(Some)
        .map_err(|e| CacheError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// File-name-safe form of a namespace or key. Plain names pass through with
/// a `k_` prefix; anything else is hex encoded under `h_`.
fn encode_component(raw: &str) -> String {
    let plain = raw
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if plain && raw.len() <= 120 {
        return format!("k_{raw}");
    }
    let mut out = String::with_capacity(2 + raw.len() * 2);
    out.push_str("h_");
    for byte in raw.bytes() {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!(path = %path.display(), error = %e, "failed to remove cache file");
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(1, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX - 1).max(1))
}
