//! Host configuration
//!
//! Loaded from an optional toml/yaml/json file (format picked from the
//! extension) layered with `SHADOWPLUG_*` environment variables. Nested keys
//! use a double underscore, e.g. `SHADOWPLUG_REAP__MAX_ATTEMPTS=3`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::HostResult;
use crate::shadow::RetryPolicy;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "SHADOWPLUG";

/// Plugin host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Directory that contains the plugin directory
    pub base_dir: PathBuf,
    /// Plugin directory name under `base_dir`
    pub plugins_dir: String,
    /// Scratch directory name under the plugin directory
    pub shadow_dir: String,
    /// Extension of loadable binaries, without the dot
    pub extension: String,
    /// Retry policy for deleting scratch directories
    pub reap: RetryPolicy,
    /// Upper bound on waiting for unloaded sandboxes to be reclaimed
    pub reclaim_timeout_ms: u64,
    /// Poll interval while waiting for reclamation
    pub reclaim_poll_ms: u64,
    /// Delete scratch directories left behind by earlier runs on start
    pub sweep_on_start: bool,
    /// Capacity of the host event channel
    pub event_capacity: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            plugins_dir: "Plugins".to_string(),
            shadow_dir: "ShadowCopy".to_string(),
            extension: std::env::consts::DLL_EXTENSION.to_string(),
            reap: RetryPolicy::default(),
            reclaim_timeout_ms: 5_000,
            reclaim_poll_ms: 25,
            sweep_on_start: true,
            event_capacity: 256,
        }
    }
}

fn default_base_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

impl HostConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from an optional file plus environment overrides
    pub fn load(path: Option<&Path>) -> HostResult<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            debug!("Loading host configuration from {:?}", path);
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Set the base directory
    pub fn with_base_dir<P: AsRef<Path>>(mut self, base_dir: P) -> Self {
        self.base_dir = base_dir.as_ref().to_path_buf();
        self
    }

    /// Set the binary extension filter
    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.trim_start_matches('.').to_string();
        self
    }

    /// Set the reaper retry policy
    pub fn with_reap_policy(mut self, policy: RetryPolicy) -> Self {
        self.reap = policy;
        self
    }

    /// Set the reclamation timeout
    pub fn with_reclaim_timeout(mut self, timeout: Duration) -> Self {
        self.reclaim_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Enable/disable the start-up sweep of stale scratch directories
    pub fn with_sweep_on_start(mut self, enabled: bool) -> Self {
        self.sweep_on_start = enabled;
        self
    }

    /// `<base>/Plugins`
    pub fn plugins_path(&self) -> PathBuf {
        self.base_dir.join(&self.plugins_dir)
    }

    /// `<base>/Plugins/ShadowCopy`
    pub fn shadow_root(&self) -> PathBuf {
        self.plugins_path().join(&self.shadow_dir)
    }

    pub fn reclaim_timeout(&self) -> Duration {
        Duration::from_millis(self.reclaim_timeout_ms)
    }

    pub fn reclaim_poll(&self) -> Duration {
        Duration::from_millis(self.reclaim_poll_ms.max(1))
    }

    /// Whether `path` carries the configured binary extension
    pub fn is_candidate(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(&self.extension))
    }
}
