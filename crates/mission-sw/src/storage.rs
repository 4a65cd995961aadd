//! Durable cache storage (the `caches` global).
//!
//! [`CacheStorage`] is the platform service the manager consumes: open a
//! generation by name, match and put entries, list and delete generations.
//! Each call is atomic on its own; the manager does no locking of its own.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hashbrown::HashMap;
use mission_net::Request;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::cache::{Cache, CacheEntry, RequestKey};

/// Errors raised by a storage backend.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Invalid cache name: {0:?}")]
    InvalidName(String),

    #[error("Cache not found: {0}")]
    NotFound(String),

    #[error("Corrupt cache data: {0}")]
    Corrupt(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Named cache generations keyed by request identity.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a cache, creating it if absent.
    async fn open(&self, name: &str) -> Result<(), StorageError>;

    /// Check if cache exists.
    async fn has(&self, name: &str) -> Result<bool, StorageError>;

    /// Delete a cache. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool, StorageError>;

    /// All cache names, sorted.
    async fn keys(&self) -> Result<Vec<String>, StorageError>;

    /// Look a request up in one cache. A missing cache is a miss.
    async fn match_request(
        &self,
        name: &str,
        request: &Request,
    ) -> Result<Option<CacheEntry>, StorageError>;

    /// Store one entry, creating the cache if absent.
    async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), StorageError>;

    /// Store several entries; either all land or none do.
    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<(), StorageError>;

    /// Request identities stored in one cache.
    async fn entry_keys(&self, name: &str) -> Result<Vec<RequestKey>, StorageError>;
}

fn validate_name(name: &str) -> Result<(), StorageError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidName(name.to_string()))
    }
}

// ==================== Memory ====================

/// In-process storage; contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    caches: RwLock<HashMap<String, Cache>>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<(), StorageError> {
        validate_name(name)?;
        self.caches
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name));
        Ok(())
    }

    async fn has(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.caches.read().await.contains_key(name))
    }

    async fn delete(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.caches.write().await.remove(name).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn match_request(
        &self,
        name: &str,
        request: &Request,
    ) -> Result<Option<CacheEntry>, StorageError> {
        Ok(self
            .caches
            .read()
            .await
            .get(name)
            .and_then(|cache| cache.match_request(request))
            .cloned())
    }

    async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), StorageError> {
        self.put_all(name, vec![entry]).await
    }

    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<(), StorageError> {
        validate_name(name)?;
        let mut caches = self.caches.write().await;
        let cache = caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name));
        for entry in entries {
            cache.put(entry);
        }
        Ok(())
    }

    async fn entry_keys(&self, name: &str) -> Result<Vec<RequestKey>, StorageError> {
        self.caches
            .read()
            .await
            .get(name)
            .map(Cache::keys)
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }
}

// ==================== File ====================

/// Index of one generation: entry file stem → request identity.
type EntryIndex = HashMap<String, RequestKey>;

const INDEX_FILE: &str = "index.json";

/// One directory per generation under a root directory.
///
/// Each request identity gets its own JSON file (named by the SHA-256 of the
/// key) holding its stored variants, so a lookup reads only that file. The
/// generation's `index.json` lists the identities and marks the generation as
/// existing. Every file is written to a temporary path and renamed into place,
/// and writers serialize on an internal lock.
#[derive(Debug)]
pub struct FileCacheStorage {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCacheStorage {
    /// Use `dir`, creating it if needed.
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        debug!(dir = %dir.display(), "Opened cache storage");
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding every variant stored for `key` in generation `name`.
    pub fn entry_path(&self, name: &str, key: &RequestKey) -> Result<PathBuf, StorageError> {
        Ok(self.generation_dir(name)?.join(format!("{}.json", entry_file_stem(key))))
    }

    fn generation_dir(&self, name: &str) -> Result<PathBuf, StorageError> {
        validate_name(name)?;
        Ok(self.dir.join(name))
    }

    fn index_path(&self, name: &str) -> Result<PathBuf, StorageError> {
        Ok(self.generation_dir(name)?.join(INDEX_FILE))
    }

    async fn load_index(&self, name: &str) -> Result<Option<EntryIndex>, StorageError> {
        read_json(&self.index_path(name)?).await
    }

    async fn load_variants(
        &self,
        name: &str,
        key: &RequestKey,
    ) -> Result<Vec<CacheEntry>, StorageError> {
        Ok(read_json(&self.entry_path(name, key)?)
            .await?
            .unwrap_or_default())
    }
}

fn entry_file_stem(key: &RequestKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    match tokio::fs::read(path).await {
        Ok(contents) => Ok(Some(serde_json::from_slice(&contents)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write `value` next to `path`; the caller renames it into place.
async fn stage_json<T: Serialize>(path: &Path, value: &T) -> Result<PathBuf, StorageError> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, serde_json::to_vec(value)?).await?;
    Ok(tmp)
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let tmp = stage_json(path, value).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl CacheStorage for FileCacheStorage {
    async fn open(&self, name: &str) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let index_path = self.index_path(name)?;
        if !tokio::fs::try_exists(&index_path).await? {
            tokio::fs::create_dir_all(self.generation_dir(name)?).await?;
            write_json(&index_path, &EntryIndex::new()).await?;
        }
        Ok(())
    }

    async fn has(&self, name: &str) -> Result<bool, StorageError> {
        Ok(tokio::fs::try_exists(self.index_path(name)?).await?)
    }

    async fn delete(&self, name: &str) -> Result<bool, StorageError> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_dir_all(self.generation_dir(name)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_name(&name).is_ok()
                && tokio::fs::try_exists(entry.path().join(INDEX_FILE)).await?
            {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn match_request(
        &self,
        name: &str,
        request: &Request,
    ) -> Result<Option<CacheEntry>, StorageError> {
        let key = RequestKey::from_request(request);
        let variants = self.load_variants(name, &key).await?;
        Ok(variants.into_iter().find(|entry| entry.matches(request)))
    }

    async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), StorageError> {
        self.put_all(name, vec![entry]).await
    }

    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(self.generation_dir(name)?).await?;
        let mut index = self.load_index(name).await?.unwrap_or_default();

        let mut updated: HashMap<String, (RequestKey, Vec<CacheEntry>)> = HashMap::new();
        for entry in entries {
            let stem = entry_file_stem(&entry.key);
            let (_, variants) = match updated.entry(stem) {
                hashbrown::hash_map::Entry::Occupied(slot) => slot.into_mut(),
                hashbrown::hash_map::Entry::Vacant(slot) => {
                    let variants = self.load_variants(name, &entry.key).await?;
                    slot.insert((entry.key.clone(), variants))
                }
            };
            variants.retain(|existing| !existing.same_variant(&entry));
            variants.push(entry);
        }

        // Stage everything first so a failed write leaves the generation untouched
        let mut staged = Vec::with_capacity(updated.len());
        for (stem, (key, variants)) in &updated {
            let path = self.entry_path(name, key)?;
            staged.push((stage_json(&path, variants).await?, path));
            index.insert(stem.clone(), key.clone());
        }
        for (tmp, path) in staged {
            tokio::fs::rename(&tmp, &path).await?;
        }
        write_json(&self.index_path(name)?, &index).await?;

        trace!(cache = %name, written = updated.len(), entries = index.len(), "Saved cache entries");
        Ok(())
    }

    async fn entry_keys(&self, name: &str) -> Result<Vec<RequestKey>, StorageError> {
        let index = self
            .load_index(name)
            .await?
            .ok_or_else(|| StorageError::NotFound(name.to_string()))?;
        let mut keys: Vec<RequestKey> = index.into_values().collect();
        keys.sort();
        Ok(keys)
    }
}
