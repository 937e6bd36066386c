//! Recognition cache
//!
//! Text recognized in earlier runs, keyed by absolute image path. An entry is
//! only trusted while the file's size and modification time still match.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Identity of a file's content as far as the cache is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub size: u64,
    pub modified_secs: u64,
    pub modified_nanos: u32,
}

impl Fingerprint {
    /// Read size and mtime; `None` if either is unavailable
    pub fn of(path: &Path) -> Option<Self> {
        let metadata = std::fs::metadata(path).ok()?;
        let modified = metadata.modified().ok()?.duration_since(UNIX_EPOCH).ok()?;
        Some(Self {
            size: metadata.len(),
            modified_secs: modified.as_secs(),
            modified_nanos: modified.subsec_nanos(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub text: String,
    #[serde(default)]
    pub dimensions: Option<(u32, u32)>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    entries: HashMap<String, CacheEntry>,
}

/// Recognized text persisted between runs
#[derive(Debug, Default)]
pub struct RecognitionCache {
    /// Backing file; `None` keeps the cache in memory only
    path: Option<PathBuf>,
    entries: HashMap<String, CacheEntry>,
    dirty: bool,
}

impl RecognitionCache {
    /// Cache that never touches disk
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load from `path`; a missing or unreadable file starts an empty cache
    pub fn load(path: PathBuf) -> Self {
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<CacheFile>(&content) {
                Ok(file) => {
                    info!("Loaded {} cached recognitions from {:?}", file.entries.len(), path);
                    file.entries
                }
                Err(e) => {
                    warn!("Ignoring unreadable recognition cache {:?}: {}", path, e);
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!("Could not read recognition cache {:?}: {}", path, e);
                HashMap::new()
            }
        };

        Self {
            path: Some(path),
            entries,
            dirty: false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cached entry for `image` if the file is unchanged since it was stored
    pub fn lookup(&self, image: &Path) -> Option<&CacheEntry> {
        let entry = self.entries.get(&key(image))?;
        let current = Fingerprint::of(image)?;
        if current == entry.fingerprint {
            Some(entry)
        } else {
            debug!("Cache entry for {:?} is stale", image);
            None
        }
    }

    /// Remember recognized text for `image`
    pub fn store(&mut self, image: &Path, text: &str, dimensions: Option<(u32, u32)>) {
        let Some(fingerprint) = Fingerprint::of(image) else {
            return;
        };
        self.entries.insert(
            key(image),
            CacheEntry {
                fingerprint,
                text: text.to_string(),
                dimensions,
            },
        );
        self.dirty = true;
    }

    /// Write back to disk if anything changed
    pub fn save(&mut self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = CacheFile {
            entries: self.entries.clone(),
        };
        std::fs::write(path, serde_json::to_string(&file)?)?;
        self.dirty = false;
        debug!("Saved {} cached recognitions to {:?}", self.entries.len(), path);
        Ok(())
    }
}

fn key(image: &Path) -> String {
    std::path::absolute(image)
        .unwrap_or_else(|_| image.to_path_buf())
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("a.png");
        std::fs::write(&image, b"pixels").unwrap();

        let mut cache = RecognitionCache::in_memory();
        assert!(cache.lookup(&image).is_none());

        cache.store(&image, "Chapter One", Some((10, 20)));
        let entry = cache.lookup(&image).unwrap();
        assert_eq!(entry.text, "Chapter One");
        assert_eq!(entry.dimensions, Some((10, 20)));
    }

    #[test]
    fn test_changed_file_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("a.png");
        std::fs::write(&image, b"pixels").unwrap();

        let mut cache = RecognitionCache::in_memory();
        cache.store(&image, "old", None);

        std::fs::write(&image, b"different pixels").unwrap();
        assert!(cache.lookup(&image).is_none());
    }

    #[test]
    fn test_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("a.png");
        std::fs::write(&image, b"pixels").unwrap();
        let cache_path = dir.path().join("cache").join("recognition_cache.json");

        let mut cache = RecognitionCache::load(cache_path.clone());
        assert!(cache.is_empty());
        cache.store(&image, "persisted", None);
        cache.save().unwrap();

        let reloaded = RecognitionCache::load(cache_path);
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.lookup(&image).unwrap().text, "persisted");
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("cache.json");
        std::fs::write(&cache_path, b"{ not json").unwrap();

        let cache = RecognitionCache::load(cache_path);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_in_memory_save_is_noop() {
        let mut cache = RecognitionCache::in_memory();
        assert!(cache.save().is_ok());
    }
}
