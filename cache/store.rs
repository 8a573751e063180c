use dashmap::DashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache entry '{0}' was not found")]
    NotFound(String),

    #[error("'{0}' cannot be used as a cache key")]
    InvalidKey(String),

    #[error("I/O error on cache entry '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode cache entry '{key}': {source}")]
    Encode {
        key: String,
        #[source]
        source: toml::ser::Error,
    },

    #[error("failed to decode cache entry '{key}': {source}")]
    Decode {
        key: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("cache entry '{0}' is not valid UTF-8")]
    NotUtf8(String),
}

impl CacheError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Opaque key to blob persistence.
///
/// `save` must be atomic with respect to `exists` and `load`: a reader either sees
/// no entry or the complete payload.
pub trait CacheStore: Send + Sync {
    fn save(&self, key: &str, payload: &[u8]) -> Result<(), CacheError>;
    fn load(&self, key: &str) -> Result<Vec<u8>, CacheError>;
    fn exists(&self, key: &str) -> bool;
    /// All complete entries, in no particular order.
    fn keys(&self) -> Result<Vec<String>, CacheError>;
}

fn validate_key(key: &str) -> Result<(), CacheError> {
    let invalid = key.is_empty()
        || key == "."
        || key == ".."
        || key.contains(['/', '\\', '\0'])
        || key.ends_with(PARTIAL_SUFFIX);
    if invalid {
        return Err(CacheError::InvalidKey(key.to_string()));
    }
    Ok(())
}

// ========================================================================================
//                                    Disk store
// ========================================================================================

/// One file per key under a cache directory.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    /// Opens (and creates if needed) a cache directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| CacheError::Io {
            key: root.display().to_string(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, CacheError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

impl CacheStore for DiskStore {
    fn save(&self, key: &str, payload: &[u8]) -> Result<(), CacheError> {
        let path = self.path_for(key)?;
        // Written beside the target and renamed into place so pollers never read a
        // half-written artifact.
        let partial = self.root.join(format!(
            "{key}.{}.{:?}{PARTIAL_SUFFIX}",
            std::process::id(),
            std::thread::current().id()
        ));
        let io_err = |source| CacheError::Io {
            key: key.to_string(),
            source,
        };
        fs::write(&partial, payload).map_err(io_err)?;
        fs::rename(&partial, &path).map_err(io_err)?;
        log::debug!("Cached '{}' ({} bytes)", key, payload.len());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        let path = self.path_for(key)?;
        fs::read(&path).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => CacheError::NotFound(key.to_string()),
            _ => CacheError::Io {
                key: key.to_string(),
                source,
            },
        })
    }

    fn exists(&self, key: &str) -> bool {
        self.path_for(key).is_ok_and(|path| path.is_file())
    }

    fn keys(&self) -> Result<Vec<String>, CacheError> {
        let io_err = |source| CacheError::Io {
            key: self.root.display().to_string(),
            source,
        };
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            if !entry.file_type().map_err(io_err)?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.ends_with(PARTIAL_SUFFIX) {
                    keys.push(name.to_string());
                }
            }
        }
        Ok(keys)
    }
}

// ========================================================================================
//                                   Memory store
// ========================================================================================

/// Concurrent in-process store for single-process runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }
}

impl CacheStore for MemoryStore {
    fn save(&self, key: &str, payload: &[u8]) -> Result<(), CacheError> {
        validate_key(key)?;
        self.entries.insert(key.to_string(), payload.to_vec());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        self.entries
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CacheError::NotFound(key.to_string()))
    }

    fn exists(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn keys(&self) -> Result<Vec<String>, CacheError> {
        Ok(self.entries.iter().map(|entry| entry.key().clone()).collect())
    }
}
