//! Host lifecycle events
//!
//! Broadcast to any number of observers (a presentation layer refreshing its
//! view of the activation surface, a log sink, tests).

use std::path::PathBuf;

use crate::registry::PluginKey;

#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum HostEvent {
    /// A plugin instance was created and registered
    PluginLoaded {
        key: PluginKey,
        name: String,
        source: PathBuf,
    },
    /// A candidate binary or type was skipped
    LoadFailed { path: PathBuf, error: String },
    /// Every plugin was disposed and every sandbox closed
    Unloaded { plugins: usize, sandboxes: usize },
    /// A reload finished; `restored` plugins were re-shown
    Reloaded { plugins: usize, restored: usize },
    /// The activation surface was regenerated
    SurfaceChanged { items: usize },
    /// A background reaping pass finished
    ReapFinished {
        deleted: usize,
        orphaned: usize,
        abandoned: usize,
    },
}
