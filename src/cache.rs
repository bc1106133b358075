//! Content-addressed cache of pipeline outputs.
//!
//! Entries are keyed by the MD5 digest of the raw input image bytes, so a
//! renamed or moved image still hits. The whole index lives in memory and is
//! rewritten to `cache_index.json` on every mutation. The cache has a single
//! writer: it is owned by the pipeline and mutated through `&mut self`.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const INDEX_FILE_NAME: &str = "cache_index.json";
const HASH_CHUNK_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache index {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("cannot encode cache index: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("IO error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

/// Outputs recorded for one input image.
///
/// Field names on disk (`prediction_path`, `obj_files`) are kept compatible
/// with existing index files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(rename = "prediction_path", default)]
    pub prediction_output_path: Option<PathBuf>,
    #[serde(rename = "obj_files", default)]
    pub mesh_assets: Vec<(u16, PathBuf)>,
    #[serde(default)]
    pub timestamp: Option<NaiveDateTime>,
}

impl CacheEntry {
    pub fn new(prediction_output_path: impl Into<PathBuf>, mesh_assets: Vec<(u16, PathBuf)>) -> Self {
        Self {
            prediction_output_path: Some(prediction_output_path.into()),
            mesh_assets,
            timestamp: None,
        }
    }

    /// An entry is usable only while every mesh it lists is still on disk.
    /// The prediction output may be gone.
    fn missing_mesh(&self) -> Option<&Path> {
        self.mesh_assets
            .iter()
            .map(|(_, path)| path.as_path())
            .find(|path| !path.exists())
    }
}

pub struct ResultCache {
    index_path: PathBuf,
    entries: BTreeMap<String, CacheEntry>,
}

impl ResultCache {
    /// Open the cache stored in `cache_dir`, creating the directory if needed.
    ///
    /// A missing index file yields an empty cache.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Corrupt`] if an index exists but cannot be parsed.
    pub fn open(cache_dir: impl AsRef<Path>) -> Result<Self, CacheError> {
        let cache_dir = cache_dir.as_ref();
        fs::create_dir_all(cache_dir).map_err(|source| CacheError::Io {
            path: cache_dir.to_path_buf(),
            source,
        })?;
        let index_path = cache_dir.join(INDEX_FILE_NAME);

        let entries = match fs::read_to_string(&index_path) {
            Ok(text) => serde_json::from_str(&text).map_err(|source| CacheError::Corrupt {
                path: index_path.clone(),
                source,
            })?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => {
                return Err(CacheError::Io {
                    path: index_path,
                    source,
                });
            }
        };
        debug!(path = %index_path.display(), entries = entries.len(), "cache index loaded");

        Ok(Self {
            index_path,
            entries,
        })
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hex MD5 of the file contents, streamed in fixed-size chunks.
    pub fn content_key(image_path: impl AsRef<Path>) -> Result<String, CacheError> {
        let path = image_path.as_ref();
        let io_err = |source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut file = File::open(path).map_err(io_err)?;
        let mut hasher = Md5::new();
        let mut chunk = [0u8; HASH_CHUNK_SIZE];
        loop {
            let read = file.read(&mut chunk).map_err(io_err)?;
            if read == 0 {
                break;
            }
            hasher.update(&chunk[..read]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    pub fn is_cached(&self, image_path: impl AsRef<Path>) -> Result<bool, CacheError> {
        let key = Self::content_key(image_path)?;
        Ok(self.lookup(&key).is_some())
    }

    /// Entry stored for the image, valid or not; check [`Self::is_cached`] first.
    pub fn get(&self, image_path: impl AsRef<Path>) -> Result<Option<&CacheEntry>, CacheError> {
        let key = Self::content_key(image_path)?;
        Ok(self.entries.get(&key))
    }

    /// Valid entry for an already computed content key.
    pub fn lookup(&self, key: &str) -> Option<&CacheEntry> {
        let entry = self.entries.get(key)?;
        if let Some(missing) = entry.missing_mesh() {
            info!(key, missing = %missing.display(), "cached mesh missing, treating as miss");
            return None;
        }
        Some(entry)
    }

    pub fn save(&mut self, image_path: impl AsRef<Path>, entry: CacheEntry) -> Result<(), CacheError> {
        let key = Self::content_key(image_path)?;
        self.insert(key, entry)
    }

    /// Stamp `entry` with the current local time and store it under `key`,
    /// replacing any previous entry.
    pub fn insert(&mut self, key: String, mut entry: CacheEntry) -> Result<(), CacheError> {
        entry.timestamp = Some(Local::now().naive_local());
        self.entries.insert(key, entry);
        self.persist()
    }

    pub fn clear(&mut self) -> Result<(), CacheError> {
        self.entries.clear();
        self.persist()
    }

    // Written to a sibling temp file and renamed over the index so a crash
    // never leaves a truncated index behind.
    fn persist(&self) -> Result<(), CacheError> {
        let tmp_path = self.index_path.with_extension("json.tmp");
        let io_err = |source| CacheError::Io {
            path: tmp_path.clone(),
            source,
        };

        let json = serde_json::to_vec_pretty(&self.entries)?;
        let mut file = File::create(&tmp_path).map_err(io_err)?;
        file.write_all(&json).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;

        fs::rename(&tmp_path, &self.index_path).map_err(|source| CacheError::Io {
            path: self.index_path.clone(),
            source,
        })
    }
}
