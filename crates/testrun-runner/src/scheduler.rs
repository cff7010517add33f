//! Failing-tests-first scheduling.
//!
//! Files that failed in the previous run are moved to the front of the next
//! one. The list lives in `<cache_dir>/failing-tests.json` as a JSON array of
//! absolute paths. Nothing is read or written under CI or with caching off,
//! and cache problems never affect the run.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use testrun_core::TestFile;

/// Name of the cache file inside the cache directory.
pub const FAILING_TESTS_FILE: &str = "failing-tests.json";

/// Reads and writes the failing-tests list.
#[derive(Debug, Clone)]
pub struct SchedulerCache {
    cache_dir: Option<PathBuf>,
    enabled: bool,
    ci: bool,
}

impl SchedulerCache {
    pub fn new(cache_dir: Option<PathBuf>, enabled: bool, ci: bool) -> Self {
        Self {
            cache_dir,
            enabled,
            ci,
        }
    }

    /// Path of the cache file, when the cache is in use.
    pub fn cache_file(&self) -> Option<PathBuf> {
        if self.ci || !self.enabled {
            return None;
        }
        self.cache_dir.as_ref().map(|dir| dir.join(FAILING_TESTS_FILE))
    }

    /// Move previously failing files to the front, keeping relative order otherwise.
    pub fn reorder(&self, files: Vec<TestFile>) -> Vec<TestFile> {
        let Some(failing) = self.load() else {
            return files;
        };

        let (mut first, rest): (Vec<_>, Vec<_>) =
            files.into_iter().partition(|file| failing.contains(file));
        debug!(failing = first.len(), "Scheduling previously failing files first");
        first.extend(rest);
        first
    }

    /// Record `failing` for the next run. Errors are logged and swallowed.
    pub fn persist(&self, failing: &[TestFile]) {
        let Some(path) = self.cache_file() else {
            return;
        };

        match write_list(&path, failing) {
            Ok(()) => debug!(path = %path.display(), failing = failing.len(), "Persisted failing tests"),
            Err(e) => warn!(error = %e, path = %path.display(), "Failed to persist failing tests"),
        }
    }

    fn load(&self) -> Option<HashSet<TestFile>> {
        let path = self.cache_file()?;
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(error = %e, path = %path.display(), "Failed to read failing tests");
                return None;
            }
        };

        match serde_json::from_str::<Vec<PathBuf>>(&contents) {
            Ok(paths) => Some(paths.into_iter().filter_map(|path| TestFile::new(path).ok()).collect()),
            Err(e) => {
                warn!(error = %e, path = %path.display(), "Ignoring corrupt failing tests file");
                None
            }
        }
    }
}

fn write_list(path: &Path, failing: &[TestFile]) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(failing)?;
    atomic_write(path, &json)
}

/// Write to a sibling temp file, sync it, then rename over `path`.
fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "cache path has no parent"))?;
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(FAILING_TESTS_FILE);
    let temp_path = parent.join(format!(".{file_name}.tmp-{}", Uuid::new_v4()));
    {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        e
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str) -> TestFile {
        TestFile::new(format!("/repo/{name}")).unwrap()
    }

    #[test]
    fn test_reorder_is_stable_partition() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SchedulerCache::new(Some(dir.path().to_path_buf()), true, false);
        cache.persist(&[file("d"), file("b")]);

        let ordered = cache.reorder(vec![file("a"), file("b"), file("c"), file("d"), file("e")]);
        assert_eq!(ordered, vec![file("b"), file("d"), file("a"), file("c"), file("e")]);
    }

    #[test]
    fn test_missing_or_corrupt_cache_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SchedulerCache::new(Some(dir.path().to_path_buf()), true, false);
        let files = vec![file("b"), file("a")];
        assert_eq!(cache.reorder(files.clone()), files);

        fs::write(dir.path().join(FAILING_TESTS_FILE), "{not json").unwrap();
        assert_eq!(cache.reorder(files.clone()), files);
    }

    #[test]
    fn test_ci_and_disabled_never_touch_disk() {
        let dir = tempfile::tempdir().unwrap();
        for cache in [
            SchedulerCache::new(Some(dir.path().to_path_buf()), true, true),
            SchedulerCache::new(Some(dir.path().to_path_buf()), false, false),
        ] {
            assert!(cache.cache_file().is_none());
            cache.persist(&[file("a")]);
        }
        assert!(!dir.path().join(FAILING_TESTS_FILE).exists());
    }

    #[test]
    fn test_persist_creates_directory_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("node_modules/.cache/testrun");
        let cache = SchedulerCache::new(Some(nested.clone()), true, false);

        cache.persist(&[file("a")]);
        cache.persist(&[]);

        let contents = fs::read_to_string(nested.join(FAILING_TESTS_FILE)).unwrap();
        let paths: Vec<PathBuf> = serde_json::from_str(&contents).unwrap();
        assert!(paths.is_empty());
        let leftovers = fs::read_dir(&nested).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
