//! Cache store for transient MP3 artifacts
//!
//! Manages a single cache directory shared by all conversion jobs and the
//! background sweep:
//! - `ensure_directory()`: idempotent creation of the cache root
//! - `claim()`: allocate a unique output path for one job and register it
//!   as in-flight so the sweep never touches a file that is mid-write
//! - `sweep()`: age-based eviction, run on a fixed interval by `spawn_sweeper`
//!
//! Output paths are namespaced with a per-job random identifier so two videos
//! whose titles sanitize to the same string never share a path.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Strip a human-readable title down to a filesystem-safe stem.
///
/// Keeps alphanumeric characters only, dropping whitespace and punctuation,
/// which rules out path traversal and filesystem-illegal characters.
/// `"My Song!"` becomes `"MySong"`. An empty result falls back to `"audio"`.
pub fn sanitize_title(title: &str) -> String {
    let stem: String = title.chars().filter(|c| c.is_alphanumeric()).collect();
    if stem.is_empty() {
        "audio".to_string()
    } else {
        stem
    }
}

/// Cache directory manager
pub struct CacheStore {
    root: PathBuf,
    /// Output paths owned by live jobs, excluded from sweep eligibility
    in_flight: Mutex<HashSet<PathBuf>>,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Cache root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the cache root if it does not exist. Idempotent.
    pub async fn ensure_directory(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Error::Storage(format!("Cannot create cache directory {}: {}", self.root.display(), e)))
    }

    /// Allocate a unique output path for one conversion job.
    ///
    /// The path is registered as in-flight until the returned claim is
    /// dropped; the sweep skips registered paths.
    pub fn claim(self: &Arc<Self>, title: &str) -> OutputClaim {
        let filename = format!("{}-{}.mp3", sanitize_title(title), Uuid::new_v4().simple());
        let path = self.root.join(filename);
        self.in_flight.lock().unwrap().insert(path.clone());
        OutputClaim {
            store: Arc::clone(self),
            path,
        }
    }

    fn release(&self, path: &Path) {
        self.in_flight.lock().unwrap().remove(path);
    }

    fn is_in_flight(&self, path: &Path) -> bool {
        self.in_flight.lock().unwrap().contains(path)
    }

    /// Delete every cache entry older than `max_age`, skipping in-flight
    /// paths. Per-entry failures are logged and skipped, never fatal to the
    /// sweep. Returns the number of entries removed.
    pub async fn sweep(&self, max_age: Duration) -> usize {
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!("Cache sweep cannot list {}: {}", self.root.display(), e);
                return 0;
            }
        };

        let now = std::time::SystemTime::now();
        let mut removed = 0;

        loop {
            let entry = match dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Cache sweep stopped early: {}", e);
                    break;
                }
            };

            let path = entry.path();
            if self.is_in_flight(&path) {
                debug!("Cache sweep skipping in-flight entry {}", path.display());
                continue;
            }

            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    warn!("Cache sweep cannot stat {}: {}", path.display(), e);
                    continue;
                }
            };

            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age > max_age {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("Cache sweep cannot remove {}: {}", path.display(), e),
                }
            }
        }

        if removed > 0 {
            info!("Cache sweep removed {} expired entries", removed);
        }
        removed
    }
}

/// One job's exclusive hold on an output path.
///
/// Dropping the claim releases the path back to sweep eligibility; it does
/// not delete the file.
pub struct OutputClaim {
    store: Arc<CacheStore>,
    path: PathBuf,
}

impl OutputClaim {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for OutputClaim {
    fn drop(&mut self) {
        self.store.release(&self.path);
    }
}

/// Run the age-based sweep on a fixed interval equal to `period`.
///
/// Independent of any live job; runs for the lifetime of the process.
pub fn spawn_sweeper(store: Arc<CacheStore>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // An interval's first tick fires immediately; skip it so the first
        // sweep happens one full period after startup.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            store.sweep(period).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_punctuation_and_whitespace() {
        assert_eq!(sanitize_title("My Song!"), "MySong");
        assert_eq!(sanitize_title("a/b\\c:d"), "abcd");
        assert_eq!(sanitize_title("../../etc/passwd"), "etcpasswd");
    }

    #[test]
    fn sanitize_empty_falls_back() {
        assert_eq!(sanitize_title(""), "audio");
        assert_eq!(sanitize_title("!!!"), "audio");
    }

    #[test]
    fn claims_for_identical_titles_do_not_collide() {
        let store = Arc::new(CacheStore::new("/tmp/mp3ify-test"));
        let a = store.claim("My Song!");
        let b = store.claim("My Song!");
        assert_ne!(a.path(), b.path());
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CacheStore::new(dir.path()));

        let old_a = dir.path().join("old_a.mp3");
        let old_b = dir.path().join("old_b.mp3");
        tokio::fs::write(&old_a, b"a").await.unwrap();
        tokio::fs::write(&old_b, b"b").await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;

        let fresh = dir.path().join("fresh.mp3");
        tokio::fs::write(&fresh, b"c").await.unwrap();

        let removed = store.sweep(Duration::from_millis(150)).await;
        assert_eq!(removed, 2);
        assert!(!old_a.exists());
        assert!(!old_b.exists());
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn sweep_skips_in_flight_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CacheStore::new(dir.path()));

        let claim = store.claim("Live Job");
        tokio::fs::write(claim.path(), b"partial").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let removed = store.sweep(Duration::ZERO).await;
        assert_eq!(removed, 0);
        assert!(claim.path().exists());

        // Once the claim is dropped the entry ages out normally
        let path = claim.path().to_path_buf();
        drop(claim);
        let removed = store.sweep(Duration::ZERO).await;
        assert_eq!(removed, 1);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn ensure_directory_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("cache"));
        store.ensure_directory().await.unwrap();
        store.ensure_directory().await.unwrap();
        assert!(store.root().is_dir());
    }
}
