//! Run configuration.

use std::env;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use serde_json::Value;

use testrun_core::Shard;

use crate::error::RunError;
use crate::shard::FileOrder;

/// Environment variable holding the 0-based shard index.
pub const SHARD_INDEX_ENV: &str = "TESTRUN_SHARD_INDEX";

/// Environment variable holding the shard count.
pub const SHARD_TOTAL_ENV: &str = "TESTRUN_SHARD_TOTAL";

/// Concurrency used under CI when none is configured.
const CI_CONCURRENCY_CAP: usize = 2;

/// Run configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Maximum number of workers running at once. 0 picks a default.
    pub concurrency: usize,

    /// Run one file at a time.
    pub serial: bool,

    /// Stop dispatching after the first failure.
    pub fail_fast: bool,

    /// Inactivity timeout for the whole run. `None` disables it.
    pub timeout: Option<Duration>,

    /// Debug mode disables the inactivity timeout.
    pub debug: bool,

    /// Only run this shard of the sorted file list.
    pub shard: Option<Shard>,

    /// Where the failing-tests cache lives.
    pub cache_dir: Option<PathBuf>,

    /// Whether the failing-tests cache is read and written.
    pub cache_enabled: bool,

    /// Running under continuous integration.
    pub ci: bool,

    /// Opaque payload forwarded to every unit in its options.
    pub worker_options: Value,

    /// Order applied before sharding. Natural path order when unset.
    pub sort: Option<FileOrder>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency: 0,
            serial: false,
            fail_fast: false,
            timeout: Some(Duration::from_secs(10)),
            debug: false,
            shard: None,
            cache_dir: None,
            cache_enabled: true,
            ci: false,
            worker_options: Value::Null,
            sort: None,
        }
    }
}

impl RunConfig {
    /// Defaults plus CI detection and the shard environment variables.
    pub fn from_env() -> Result<Self, RunError> {
        let mut config = Self {
            ci: is_ci(),
            ..Self::default()
        };

        if let (Some(index), Some(total)) = (env_usize(SHARD_INDEX_ENV)?, env_usize(SHARD_TOTAL_ENV)?) {
            config.shard = Some(Shard::new(index, total)?);
        }
        Ok(config)
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_serial(mut self, serial: bool) -> Self {
        self.serial = serial;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_shard(mut self, shard: Shard) -> Self {
        self.shard = Some(shard);
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn with_cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn with_ci(mut self, ci: bool) -> Self {
        self.ci = ci;
        self
    }

    pub fn with_worker_options(mut self, options: Value) -> Self {
        self.worker_options = options;
        self
    }

    pub fn with_sort(mut self, order: FileOrder) -> Self {
        self.sort = Some(order);
        self
    }

    /// Number of workers allowed to run at once.
    pub fn resolve_concurrency(&self) -> usize {
        if self.serial {
            return 1;
        }
        if self.concurrency > 0 {
            return self.concurrency;
        }

        let available = thread::available_parallelism().map_or(1, |n| n.get());
        if self.ci {
            available.min(CI_CONCURRENCY_CAP)
        } else {
            available
        }
    }

    /// The inactivity timeout, unless disabled.
    pub fn effective_timeout(&self) -> Option<Duration> {
        if self.debug {
            None
        } else {
            self.timeout.filter(|timeout| !timeout.is_zero())
        }
    }
}

/// Returns true when a CI environment is detected.
pub fn is_ci() -> bool {
    ["CI", "CONTINUOUS_INTEGRATION", "BUILD_NUMBER", "RUN_ID"]
        .iter()
        .any(|key| env_truthy(key))
}

fn env_truthy(key: &str) -> bool {
    matches!(
        env::var(key),
        Ok(value) if !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false")
    )
}

fn env_usize(key: &'static str) -> Result<Option<usize>, RunError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| RunError::InvalidEnv { key, value }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RunConfig::default();
        assert_eq!(config.timeout, Some(Duration::from_secs(10)));
        assert!(config.cache_enabled);
        assert!(!config.fail_fast);
        assert!(config.shard.is_none());
    }

    #[test]
    fn test_resolve_concurrency() {
        assert_eq!(RunConfig::default().with_serial(true).with_concurrency(8).resolve_concurrency(), 1);
        assert_eq!(RunConfig::default().with_concurrency(3).resolve_concurrency(), 3);

        let ci = RunConfig::default().with_ci(true).resolve_concurrency();
        assert!((1..=CI_CONCURRENCY_CAP).contains(&ci));
        assert!(RunConfig::default().resolve_concurrency() >= 1);
    }

    #[test]
    fn test_effective_timeout() {
        assert!(RunConfig::default().with_debug(true).effective_timeout().is_none());
        assert!(RunConfig::default().with_timeout(None).effective_timeout().is_none());
        assert!(RunConfig::default()
            .with_timeout(Some(Duration::ZERO))
            .effective_timeout()
            .is_none());
        assert_eq!(
            RunConfig::default().effective_timeout(),
            Some(Duration::from_secs(10))
        );
    }
}
