//! Typed errors raised by plugin code.

use thiserror::Error;

/// Errors a plugin reports back to the host.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PluginError {
    /// The plugin type could not be constructed.
    #[error("Plugin construction failed: {0}")]
    ConstructionFailed(String),

    /// Releasing the plugin's presentation or resources failed.
    #[error("Plugin close failed: {0}")]
    CloseFailed(String),

    /// Plugin code panicked; the panic was caught inside the plugin binary.
    #[error("Plugin panicked: {0}")]
    Panicked(String),

    /// An I/O error surfaced inside the plugin.
    #[error("Plugin I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Catch-all for errors that don't fit the above categories.
    #[error("{0}")]
    Other(String),
}

/// Result type for plugin operations
pub type PluginResult<T> = Result<T, PluginError>;
