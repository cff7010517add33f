//! Test file identity.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// An absolute path to a test file.
///
/// Used as the key that ties worker events, timeouts and the failing-tests
/// cache back to a file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestFile(PathBuf);

impl TestFile {
    /// Create a TestFile, rejecting relative paths.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let path = path.into();
        if !path.is_absolute() {
            return Err(CoreError::RelativeTestFile(path.display().to_string()));
        }
        Ok(Self(path))
    }

    /// Get the path.
    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Lossy string form of the path, used for sorting and persistence.
    pub fn to_string_lossy(&self) -> String {
        self.0.to_string_lossy().into_owned()
    }

    /// Consume and return the inner path.
    pub fn into_inner(self) -> PathBuf {
        self.0
    }
}

impl fmt::Display for TestFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl AsRef<Path> for TestFile {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_relative_paths() {
        let err = TestFile::new("tests/foo.rs").unwrap_err();
        assert!(matches!(err, CoreError::RelativeTestFile(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_accepts_absolute_paths() {
        let file = TestFile::new("/repo/tests/foo.rs").unwrap();
        assert_eq!(file.to_string(), "/repo/tests/foo.rs");
        assert_eq!(file.path(), Path::new("/repo/tests/foo.rs"));
    }
}
