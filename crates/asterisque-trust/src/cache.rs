//! Lazy filesystem cache keyed on (mtime, size) snapshots.
//!
//! Used by the trust context to observe `ca/` and `blocked/` without parsing
//! PEM on every `verify` call: the transformed value is rebuilt only when a
//! member file changes or the set of files in the directory changes, and a
//! minimum refresh interval rate-limits the stat pass itself.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;

/// One file's identity: path, mtime, size.
type Stamp = (PathBuf, SystemTime, u64);

struct CacheState<T> {
    value: Arc<T>,
    snapshot: Vec<Stamp>,
    checked_at: Option<Instant>,
    initialized: bool,
}

/// Maps a filesystem path (a file, or a directory of files) to a transformed
/// value. `get()` returns the value for the current contents, or the default
/// when the path does not exist.
pub struct Cache<T> {
    path: PathBuf,
    min_refresh: Duration,
    default: Arc<T>,
    transform: Box<dyn Fn(&[PathBuf]) -> T + Send + Sync>,
    state: Mutex<CacheState<T>>,
}

impl<T> Cache<T> {
    /// `transform` receives the sorted member files of the path (a single
    /// element for a plain file) and builds the cached value.
    pub fn new<F>(path: &Path, min_refresh_ms: u64, default: T, transform: F) -> Cache<T>
    where
        F: Fn(&[PathBuf]) -> T + Send + Sync + 'static,
    {
        let default = Arc::new(default);
        Cache {
            path: path.to_path_buf(),
            min_refresh: Duration::from_millis(min_refresh_ms),
            default: default.clone(),
            transform: Box::new(transform),
            state: Mutex::new(CacheState {
                value: default,
                snapshot: Vec::new(),
                checked_at: None,
                initialized: false,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The transformed value for the current contents of the path.
    pub fn get(&self) -> Arc<T> {
        let mut state = self.state.lock();
        let now = Instant::now();
        if let Some(checked_at) = state.checked_at {
            if now.duration_since(checked_at) < self.min_refresh {
                return state.value.clone();
            }
        }
        state.checked_at = Some(now);

        let snapshot = take_snapshot(&self.path);
        if state.initialized && snapshot == state.snapshot {
            return state.value.clone();
        }

        let files: Vec<PathBuf> = snapshot.iter().map(|(p, _, _)| p.clone()).collect();
        let value = if !self.path.exists() {
            self.default.clone()
        } else {
            Arc::new((self.transform)(&files))
        };
        state.snapshot = snapshot;
        state.value = value.clone();
        state.initialized = true;
        value
    }
}

/// Stat the path into a deterministic snapshot. A missing path yields an
/// empty snapshot; a plain file yields one entry.
fn take_snapshot(path: &Path) -> Vec<Stamp> {
    let mut out = Vec::new();
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(_) => return out,
    };
    if meta.is_dir() {
        let entries = match std::fs::read_dir(path) {
            Ok(entries) => entries,
            Err(_) => return out,
        };
        for entry in entries.flatten() {
            let child = entry.path();
            if let Ok(meta) = entry.metadata() {
                if meta.is_file() {
                    let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                    out.push((child, mtime, meta.len()));
                }
            }
        }
        out.sort();
    } else {
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        out.push((path.to_path_buf(), mtime, meta.len()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn missing_path_yields_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope");
        let cache = Cache::new(&missing, 0, 42usize, |_| 0usize);
        assert_eq!(*cache.get(), 42);
    }

    #[test]
    fn rebuilds_when_directory_contents_change() {
        let dir = tempfile::tempdir().expect("tempdir");
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let cache = Cache::new(dir.path(), 0, 0usize, move |files| {
            c.fetch_add(1, Ordering::SeqCst);
            files.len()
        });

        assert_eq!(*cache.get(), 0);
        std::fs::write(dir.path().join("a.pem"), b"one").expect("write");
        assert_eq!(*cache.get(), 1);
        std::fs::write(dir.path().join("b.pem"), b"two").expect("write");
        assert_eq!(*cache.get(), 2);
        std::fs::remove_file(dir.path().join("a.pem")).expect("remove");
        assert_eq!(*cache.get(), 1);
    }

    #[test]
    fn unchanged_contents_are_not_retransformed() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a.pem"), b"one").expect("write");
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let cache = Cache::new(dir.path(), 0, 0usize, move |files| {
            c.fetch_add(1, Ordering::SeqCst);
            files.len()
        });

        cache.get();
        cache.get();
        cache.get();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn refresh_interval_rate_limits_stats() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = Cache::new(dir.path(), 60_000, 0usize, |files| files.len());
        assert_eq!(*cache.get(), 0);
        // The new file is invisible until the refresh interval elapses.
        std::fs::write(dir.path().join("a.pem"), b"one").expect("write");
        assert_eq!(*cache.get(), 0);
    }

    #[test]
    fn plain_file_is_snapshotted_as_single_member() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("k.pem");
        std::fs::write(&file, b"data").expect("write");
        let cache = Cache::new(&file, 0, 0usize, |files| files.len());
        assert_eq!(*cache.get(), 1);
    }
}
