//! Offline artifact resolution.
//!
//! The TTS engine asks for model files by `(collection, filename)`. Instead of
//! downloading them, [`LocalArtifactResolver`] answers from a local model
//! directory laid out like a hub cache (`models--<org>--<model>`), optionally
//! with `snapshots/<id>/` revisions and a `voices/` subtree.
//!
//! Search order, first existing path wins:
//! 1. cached answer for the same key
//! 2. `root/filename`
//! 3. `root/basename(filename)`
//! 4. `root/filename` again for `voices/` requests
//! 5. `root/snapshots/<max snapshot name>/filename`
//! 6. an entry directly under `root` named `filename` or ending in its basename

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tracing::debug;

const VOICES_PREFIX: &str = "voices/";
const SNAPSHOTS_DIR: &str = "snapshots";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("file not found in local model directory {}: {filename}", root.display())]
    NotFound { filename: String, root: PathBuf },
    #[error("failed to read model directory {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Answers artifact fetches for the TTS engine. Implementations must not touch
/// the network.
pub trait ArtifactResolver: Send + Sync {
    fn resolve(&self, collection: &str, filename: &str) -> Result<PathBuf, ResolveError>;
}

pub struct LocalArtifactResolver {
    root: PathBuf,
    cache: Mutex<HashMap<(String, String), PathBuf>>,
}

impl LocalArtifactResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn cached(&self, collection: &str, filename: &str) -> Option<PathBuf> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(collection.to_string(), filename.to_string()))
            .cloned()
    }

    fn search(&self, filename: &str) -> Result<PathBuf, ResolveError> {
        let base = basename(filename);

        let mut candidates = vec![self.root.join(filename), self.root.join(base)];
        if filename.starts_with(VOICES_PREFIX) {
            candidates.push(self.root.join(filename));
        }
        if let Some(latest) = self.latest_snapshot()? {
            candidates.push(latest.join(filename));
        }

        if let Some(found) = candidates.into_iter().find(|p| p.exists()) {
            return Ok(found);
        }

        let mut names: Vec<String> = fs::read_dir(&self.root)
            .map_err(|source| ResolveError::Io {
                path: self.root.clone(),
                source,
            })?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();

        names
            .into_iter()
            .find(|name| name == filename || name.ends_with(base))
            .map(|name| self.root.join(name))
            .ok_or_else(|| ResolveError::NotFound {
                filename: filename.to_string(),
                root: self.root.clone(),
            })
    }

    /// The lexicographically greatest directory under `root/snapshots`, if any.
    fn latest_snapshot(&self) -> Result<Option<PathBuf>, ResolveError> {
        let snapshots = self.root.join(SNAPSHOTS_DIR);
        if !snapshots.is_dir() {
            return Ok(None);
        }

        let entries = fs::read_dir(&snapshots).map_err(|source| ResolveError::Io {
            path: snapshots.clone(),
            source,
        })?;

        let latest = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .map(|entry| entry.file_name())
            .max();

        Ok(latest.map(|name| snapshots.join(name)))
    }
}

impl ArtifactResolver for LocalArtifactResolver {
    fn resolve(&self, collection: &str, filename: &str) -> Result<PathBuf, ResolveError> {
        if let Some(hit) = self.cached(collection, filename) {
            return Ok(hit);
        }

        let path = self.search(filename)?;
        debug!("Resolved {collection}/{filename} -> {}", path.display());

        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((collection.to_string(), filename.to_string()), path.clone());

        Ok(path)
    }
}

fn basename(filename: &str) -> &str {
    filename.rsplit('/').next().unwrap_or(filename)
}
