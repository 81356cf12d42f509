//! Error taxonomy of the plugin lifecycle
//!
//! Stage, load and instantiate failures are per-candidate: the registry logs
//! them and moves on. Reap and dispose failures are per-resource: they are
//! logged and never stop an unload pass.
//!
//! Errors raised by plugin code are rendered to owned messages at the
//! boundary, so no error value keeps pointing into a binary after it unloads.

use std::path::PathBuf;
use thiserror::Error;

/// A binary could not be staged into its scratch directory
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Source binary not found: {0}")]
    SourceMissing(PathBuf),

    #[error("Failed to create scratch directory {path}: {source}")]
    ScratchDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to copy {from} to {to}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid source path: {0}")]
    InvalidPath(PathBuf),
}

/// A staged binary could not be loaded into its sandbox
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Failed to load library {path}: {source}")]
    Library {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("Failed to resolve bundled dependency {path}: {source}")]
    Dependency {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("Missing plugin declaration in {path}: {source}")]
    MissingDeclaration {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("API version mismatch in {path}: expected {expected}, got {actual}")]
    VersionMismatch {
        path: PathBuf,
        expected: u32,
        actual: u32,
    },

    #[error("SDK version mismatch in {path}: host {host}, plugin {plugin}")]
    SdkMismatch {
        path: PathBuf,
        host: String,
        plugin: String,
    },

    #[error("Not a loadable module: {0}")]
    Malformed(PathBuf),

    #[error("Sandbox {0} is not open")]
    SandboxClosed(u64),

    #[error("Module registration failed in {path}: {message}")]
    Registration { path: PathBuf, message: String },

    #[error("Loader thread panicked for {0}")]
    Panicked(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A discovered plugin type failed to construct
#[derive(Debug, Error)]
pub enum InstantiateError {
    #[error("Constructor of {type_name} failed: {message}")]
    Failed { type_name: String, message: String },

    #[error("Constructor of {type_name} panicked: {message}")]
    Panicked { type_name: String, message: String },

    #[error("Sandbox {0} is not open")]
    SandboxClosed(u64),

    #[error("Sandbox {sandbox} declares no plugin type at index {index}")]
    UnknownType { sandbox: u64, index: usize },
}

/// A scratch directory survived every deletion attempt
#[derive(Debug, Error)]
pub enum ReapError {
    #[error("Failed to delete {dir} after {attempts} attempts: {source}")]
    Exhausted {
        dir: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Refusing to delete {0}: outside the shadow root")]
    OutsideRoot(PathBuf),
}

/// A plugin's close operation failed during unload
#[derive(Debug, Error)]
pub enum DisposeError {
    #[error("Plugin {name} failed to close: {message}")]
    Failed { name: String, message: String },

    #[error("Plugin {name} panicked while closing: {message}")]
    Panicked { name: String, message: String },
}

/// A plugin's activate operation panicked
#[derive(Debug, Error)]
pub enum ActivateError {
    #[error("Plugin {name} panicked while activating: {message}")]
    Panicked { name: String, message: String },
}

/// Top-level host error
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HostError {
    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    #[error("Instantiate error: {0}")]
    Instantiate(#[from] InstantiateError),

    #[error("Reap error: {0}")]
    Reap(#[from] ReapError),

    #[error("Dispose error: {0}")]
    Dispose(#[from] DisposeError),

    #[error("Activate error: {0}")]
    Activate(#[from] ActivateError),

    #[error("Cannot {operation} while registry is {state}")]
    InvalidTransition {
        operation: &'static str,
        state: crate::registry::RegistryState,
    },

    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for host operations
pub type HostResult<T> = Result<T, HostError>;
