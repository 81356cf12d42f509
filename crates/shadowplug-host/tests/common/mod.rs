//! Shared fixtures for host integration tests

#![allow(dead_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use shadowplug_host::sdk::{Plugin, PluginError, PluginResult, TypeDescriptor};
use shadowplug_host::{
    DependencyResolver, DirRemover, HostConfig, InProcessLoader, LoadError, ModuleImage,
    ModuleLoader, PluginHost, RetryPolicy,
};
use tempfile::TempDir;

pub const SLOTS: usize = 32;

static CONSTRUCTED: [AtomicUsize; SLOTS] = [const { AtomicUsize::new(0) }; SLOTS];
static DROPPED: [AtomicUsize; SLOTS] = [const { AtomicUsize::new(0) }; SLOTS];
static SURFACES: [AtomicUsize; SLOTS] = [const { AtomicUsize::new(0) }; SLOTS];

/// Instances of `Tracked<ID>` created so far
pub fn constructed(id: usize) -> usize {
    CONSTRUCTED[id].load(Ordering::SeqCst)
}

/// Instances of `Tracked<ID>` dropped so far
pub fn dropped(id: usize) -> usize {
    DROPPED[id].load(Ordering::SeqCst)
}

/// Presentation surfaces `Tracked<ID>` has created
pub fn surfaces(id: usize) -> usize {
    SURFACES[id].load(Ordering::SeqCst)
}

/// Plugin with per-type counters; give every test its own `ID`
pub struct Tracked<const ID: usize> {
    name: String,
    visible: bool,
}

impl<const ID: usize> Default for Tracked<ID> {
    fn default() -> Self {
        CONSTRUCTED[ID].fetch_add(1, Ordering::SeqCst);
        Self {
            name: format!("Tracked{ID}"),
            visible: false,
        }
    }
}

impl<const ID: usize> Plugin for Tracked<ID> {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_visible(&self) -> bool {
        self.visible
    }

    fn activate(&mut self) {
        if !self.visible {
            self.visible = true;
            SURFACES[ID].fetch_add(1, Ordering::SeqCst);
        }
    }

    fn close(&mut self) -> PluginResult<()> {
        self.visible = false;
        Ok(())
    }
}

impl<const ID: usize> Drop for Tracked<ID> {
    fn drop(&mut self) {
        DROPPED[ID].fetch_add(1, Ordering::SeqCst);
    }
}

/// Plugins that all share one display name
#[derive(Default)]
pub struct Twin<const ID: usize> {
    visible: bool,
}

impl<const ID: usize> Plugin for Twin<ID> {
    fn name(&self) -> &str {
        "Twin"
    }

    fn is_visible(&self) -> bool {
        self.visible
    }

    fn activate(&mut self) {
        self.visible = true;
    }

    fn close(&mut self) -> PluginResult<()> {
        self.visible = false;
        Ok(())
    }
}

/// Fails to close and panics when shown
#[derive(Default)]
pub struct Stubborn;

impl Plugin for Stubborn {
    fn name(&self) -> &str {
        "Stubborn"
    }

    fn is_visible(&self) -> bool {
        false
    }

    fn activate(&mut self) {
        panic!("no window for you");
    }

    fn close(&mut self) -> PluginResult<()> {
        Err(PluginError::CloseFailed("handle still in use".to_string()))
    }
}

fn refuse_construction() -> PluginResult<Box<dyn Plugin>> {
    Err(PluginError::ConstructionFailed("missing resource".to_string()))
}

/// Type whose constructor always fails
pub fn broken_type() -> TypeDescriptor {
    TypeDescriptor::fallible("Broken", refuse_construction)
}

/// Temporary base directory and a matching config
pub fn fixture() -> (TempDir, HostConfig) {
    let temp = tempfile::tempdir().unwrap();
    let config = HostConfig::new()
        .with_base_dir(temp.path())
        .with_extension("so")
        .with_reap_policy(RetryPolicy::no_retry());
    std::fs::create_dir_all(config.plugins_path()).unwrap();
    (temp, config)
}

/// Drop a fake binary named `file` into the plugin directory
pub fn deploy(config: &HostConfig, file: &str) -> PathBuf {
    let path = config.plugins_path().join(file);
    std::fs::write(&path, format!("binary {file}")).unwrap();
    path
}

pub fn host(config: HostConfig, loader: InProcessLoader) -> PluginHost {
    PluginHost::with_loader(config, Arc::new(loader))
}

/// Loader that remembers every path it was asked to load
pub struct RecordingLoader {
    inner: InProcessLoader,
    seen: Mutex<Vec<PathBuf>>,
}

impl RecordingLoader {
    pub fn new(inner: InProcessLoader) -> Self {
        Self {
            inner,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<PathBuf> {
        self.seen.lock().clone()
    }
}

impl ModuleLoader for RecordingLoader {
    fn load(&self, path: &Path, resolver: &DependencyResolver) -> Result<ModuleImage, LoadError> {
        self.seen.lock().push(path.to_path_buf());
        self.inner.load(path, resolver)
    }
}

/// Refuses to delete any scratch directory containing `marker`, and fails
/// the first `failures` attempts on every other directory
pub struct StickyRemover {
    marker: Option<String>,
    failures_left: AtomicUsize,
    pub calls: AtomicUsize,
}

impl StickyRemover {
    pub fn flaky(failures: usize) -> Self {
        Self {
            marker: None,
            failures_left: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn holding(marker: &str) -> Self {
        Self {
            marker: Some(marker.to_string()),
            failures_left: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }
}

impl DirRemover for StickyRemover {
    fn remove_dir_all(&self, dir: &Path) -> io::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(marker) = &self.marker {
            if dir.join(marker).exists() {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "held open"));
            }
        }
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "locked"));
        }
        std::fs::remove_dir_all(dir)
    }
}
