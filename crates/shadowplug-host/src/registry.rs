//! Plugin registry
//!
//! Owns every live [`PluginDescriptor`] and every open [`Sandbox`] (paired with
//! the [`ShadowCopyJob`] it loaded from) and drives the
//! `Empty -> Loading -> Ready -> Unloading -> Empty` cycle. Nothing outside the
//! registry ever holds a plugin instance: callers address plugins by
//! [`PluginKey`], and a key from an earlier load generation simply no longer
//! resolves.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::HostConfig;
use crate::error::{HostError, HostResult};
use crate::events::HostEvent;
use crate::sandbox::{ModuleLoader, PluginInstance, Sandbox, SandboxId, SandboxState};
use crate::shadow::{ShadowCopyJob, ShadowCopyManager};

/// Lifecycle of the whole plugin set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RegistryState {
    Empty,
    Loading,
    Ready,
    Unloading,
}

impl std::fmt::Display for RegistryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryState::Empty => write!(f, "Empty"),
            RegistryState::Loading => write!(f, "Loading"),
            RegistryState::Ready => write!(f, "Ready"),
            RegistryState::Unloading => write!(f, "Unloading"),
        }
    }
}

/// Handle to one descriptor within one load generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PluginKey {
    pub generation: u64,
    pub index: usize,
}

impl std::fmt::Display for PluginKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.generation, self.index)
    }
}

/// Identity of a plugin that survives a reload
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PluginIdentity {
    /// File name of the deployed binary
    pub file_name: String,
    /// Type name within that binary
    pub type_name: String,
}

impl std::fmt::Display for PluginIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.file_name, self.type_name)
    }
}

/// Binds one plugin instance to its owning sandbox and shadow copy
pub struct PluginDescriptor {
    key: PluginKey,
    name: String,
    source_path: PathBuf,
    shadow_path: PathBuf,
    sandbox: SandboxId,
    instance: PluginInstance,
}

impl PluginDescriptor {
    pub fn key(&self) -> PluginKey {
        self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_name(&self) -> &str {
        self.instance.type_name()
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn shadow_path(&self) -> &Path {
        &self.shadow_path
    }

    pub fn sandbox(&self) -> SandboxId {
        self.sandbox
    }

    pub fn is_visible(&self) -> bool {
        self.instance.is_visible()
    }

    pub fn identity(&self) -> PluginIdentity {
        PluginIdentity {
            file_name: self
                .source_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            type_name: self.instance.type_name().to_string(),
        }
    }
}

impl std::fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("source_path", &self.source_path)
            .field("sandbox", &self.sandbox)
            .field("visible", &self.is_visible())
            .finish()
    }
}

/// An open sandbox and the scratch copy it loaded
struct SandboxSlot {
    sandbox: Sandbox,
    job: ShadowCopyJob,
}

/// A candidate binary or type that was skipped
#[derive(Debug, Clone, Serialize)]
pub struct LoadFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Outcome of a load pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub loaded: Vec<PluginKey>,
    pub failures: Vec<LoadFailure>,
}

/// Outcome of an unload pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct UnloadReport {
    /// Descriptors whose instance was closed and dropped
    pub disposed: usize,
    /// Descriptors whose `close` failed (still dropped)
    pub dispose_failures: usize,
    pub sandboxes_closed: usize,
    /// Sandboxes that had not been reclaimed when the wait timed out
    pub unreclaimed: Vec<SandboxId>,
    /// Scratch directories handed to the reaper
    pub scheduled: Vec<PathBuf>,
}

/// Outcome of a reload
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReloadReport {
    pub unload: UnloadReport,
    pub load: LoadReport,
    /// Plugins shown again because they were visible before the reload
    pub restored: Vec<PluginKey>,
    /// Previously visible plugins that are gone after the reload
    pub dropped: Vec<String>,
}

/// Diagnostic view of one descriptor
#[derive(Debug, Clone, Serialize)]
pub struct PluginSummary {
    pub key: PluginKey,
    pub name: String,
    pub type_name: String,
    pub source_path: PathBuf,
    pub shadow_path: PathBuf,
    pub sandbox: SandboxId,
    pub visible: bool,
}

/// Diagnostic view of one sandbox
#[derive(Debug, Clone, Serialize)]
pub struct SandboxSummary {
    pub id: SandboxId,
    pub state: SandboxState,
    pub binary: PathBuf,
    pub source_path: PathBuf,
    pub scratch_dir: PathBuf,
    pub live_instances: usize,
}

/// Snapshot produced by [`Registry::list`]
#[derive(Debug, Clone, Serialize)]
pub struct RegistryListing {
    pub state: RegistryState,
    pub generation: u64,
    pub plugins: Vec<PluginSummary>,
    pub sandboxes: Vec<SandboxSummary>,
}

impl RegistryListing {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// One fact per line
    pub fn lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.plugins.len() + self.sandboxes.len() + 1);
        lines.push(format!(
            "registry {} (generation {}): {} plugins, {} sandboxes",
            self.state,
            self.generation,
            self.plugins.len(),
            self.sandboxes.len()
        ));
        for plugin in &self.plugins {
            lines.push(format!(
                "plugin [{}] {} ({}) from {} in {}{}",
                plugin.key,
                plugin.name,
                plugin.type_name,
                plugin.source_path.display(),
                plugin.sandbox,
                if plugin.visible { ", visible" } else { "" }
            ));
        }
        for sandbox in &self.sandboxes {
            lines.push(format!(
                "{} [{}] {} ({} live instances)",
                sandbox.id,
                sandbox.state,
                sandbox.binary.display(),
                sandbox.live_instances
            ));
        }
        lines
    }
}

/// Owner of the live plugin set
pub struct Registry {
    /// Host configuration
    config: HostConfig,
    /// Turns staged binaries into module images
    loader: Arc<dyn ModuleLoader>,
    /// Stages binaries and reaps their scratch directories
    shadow: Arc<ShadowCopyManager>,
    /// Event broadcaster
    events: broadcast::Sender<HostEvent>,
    state: RegistryState,
    generation: u64,
    next_sandbox: u64,
    sandboxes: BTreeMap<SandboxId, SandboxSlot>,
    /// Load order
    descriptors: Vec<PluginDescriptor>,
}

impl Registry {
    pub fn new(
        config: HostConfig,
        loader: Arc<dyn ModuleLoader>,
        shadow: Arc<ShadowCopyManager>,
        events: broadcast::Sender<HostEvent>,
    ) -> Self {
        Self {
            config,
            loader,
            shadow,
            events,
            state: RegistryState::Empty,
            generation: 0,
            next_sandbox: 0,
            sandboxes: BTreeMap::new(),
            descriptors: Vec::new(),
        }
    }

    pub fn state(&self) -> RegistryState {
        self.state
    }

    /// Incremented by every load pass
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn descriptors(&self) -> &[PluginDescriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, key: PluginKey) -> Option<&PluginDescriptor> {
        self.descriptors.iter().find(|d| d.key == key)
    }

    pub fn sandbox_count(&self) -> usize {
        self.sandboxes.len()
    }

    /// Scratch directories backing open sandboxes
    pub fn protected_dirs(&self) -> HashSet<PathBuf> {
        self.sandboxes
            .values()
            .map(|slot| slot.job.scratch_dir.clone())
            .collect()
    }

    /// Stage, sandbox, load and instantiate every candidate binary.
    ///
    /// Failures are per candidate (or per type) and never abort the pass.
    pub async fn load_all(&mut self) -> HostResult<LoadReport> {
        match self.state {
            RegistryState::Empty | RegistryState::Unloading => {}
            state => {
                return Err(HostError::InvalidTransition {
                    operation: "load plugins",
                    state,
                });
            }
        }

        self.state = RegistryState::Loading;
        self.generation += 1;
        let mut report = LoadReport::default();

        let plugins_dir = self.config.plugins_path();
        info!("Loading plugins from {:?}", plugins_dir);

        for path in candidates(&plugins_dir, &self.config).await {
            if let Err(e) = self.load_binary(&path, &mut report).await {
                self.record_failure(&mut report, &path, e.to_string());
            }
        }

        self.flag_name_collisions();
        self.state = RegistryState::Ready;

        info!(
            loaded = report.loaded.len(),
            failed = report.failures.len(),
            sandboxes = self.sandboxes.len(),
            "plugin load pass finished"
        );
        Ok(report)
    }

    async fn load_binary(&mut self, path: &Path, report: &mut LoadReport) -> HostResult<()> {
        let job = self.shadow.stage(path).await?;

        self.next_sandbox += 1;
        let id = SandboxId(self.next_sandbox);
        let mut sandbox = Sandbox::open(id, &job.shadow_path);

        if let Err(e) = sandbox.load(self.loader.clone()).await {
            sandbox.close();
            self.shadow.schedule([job]);
            return Err(e.into());
        }

        let mut instantiated = 0;
        for (index, type_name) in sandbox.discover().into_iter().enumerate() {
            let instance = match sandbox.instantiate(index) {
                Ok(instance) => instance,
                Err(e) => {
                    self.record_failure(report, path, e.to_string());
                    continue;
                }
            };

            let key = PluginKey {
                generation: self.generation,
                index: self.descriptors.len(),
            };
            let name = instance.name().to_string();
            info!("Loaded plugin {} ({}) from {:?}", name, type_name, path);
            let _ = self.events.send(HostEvent::PluginLoaded {
                key,
                name: name.clone(),
                source: path.to_path_buf(),
            });

            self.descriptors.push(PluginDescriptor {
                key,
                name,
                source_path: path.to_path_buf(),
                shadow_path: job.shadow_path.clone(),
                sandbox: id,
                instance,
            });
            report.loaded.push(key);
            instantiated += 1;
        }

        if instantiated == 0 {
            debug!("No plugin types instantiated from {:?}, closing {}", path, id);
            sandbox.close();
            self.shadow.schedule([job]);
            return Ok(());
        }

        self.sandboxes.insert(id, SandboxSlot { sandbox, job });
        Ok(())
    }

    fn record_failure(&self, report: &mut LoadReport, path: &Path, error: String) {
        warn!("Error loading plugin from {:?}: {}", path, error);
        let _ = self.events.send(HostEvent::LoadFailed {
            path: path.to_path_buf(),
            error: error.clone(),
        });
        report.failures.push(LoadFailure {
            path: path.to_path_buf(),
            error,
        });
    }

    fn flag_name_collisions(&self) {
        let mut seen: HashMap<&str, &PluginDescriptor> = HashMap::new();
        for descriptor in &self.descriptors {
            if let Some(first) = seen.insert(descriptor.name(), descriptor) {
                warn!(
                    "Plugin name {:?} is used by both {} and {}",
                    descriptor.name(),
                    first.identity(),
                    descriptor.identity()
                );
            }
        }
    }

    /// Dispose every plugin, close every sandbox, wait for reclamation and
    /// hand the scratch directories to the reaper.
    pub async fn unload_all(&mut self) -> HostResult<UnloadReport> {
        match self.state {
            RegistryState::Ready | RegistryState::Unloading => {}
            RegistryState::Empty => return Ok(UnloadReport::default()),
            state => {
                return Err(HostError::InvalidTransition {
                    operation: "unload plugins",
                    state,
                });
            }
        }

        self.state = RegistryState::Unloading;
        let mut report = UnloadReport::default();
        info!(
            plugins = self.descriptors.len(),
            sandboxes = self.sandboxes.len(),
            "unloading plugins"
        );

        for mut descriptor in std::mem::take(&mut self.descriptors) {
            if let Err(e) = descriptor.instance.close() {
                warn!("{}", e);
                report.dispose_failures += 1;
            }
            debug!("Disposed plugin {} [{}]", descriptor.name, descriptor.key);
            drop(descriptor);
            report.disposed += 1;
        }

        for slot in self.sandboxes.values_mut() {
            slot.sandbox.close();
            report.sandboxes_closed += 1;
        }

        report.unreclaimed = self.await_reclamation().await;

        let jobs: Vec<ShadowCopyJob> = std::mem::take(&mut self.sandboxes)
            .into_values()
            .map(|slot| slot.job)
            .collect();
        report.scheduled = jobs.iter().map(|job| job.scratch_dir.clone()).collect();
        self.shadow.schedule(jobs);

        self.state = RegistryState::Empty;
        let _ = self.events.send(HostEvent::Unloaded {
            plugins: report.disposed,
            sandboxes: report.sandboxes_closed,
        });
        info!(
            disposed = report.disposed,
            sandboxes = report.sandboxes_closed,
            "plugins unloaded"
        );
        Ok(report)
    }

    /// Poll closed sandboxes until each reports `Unloaded` or the timeout expires
    async fn await_reclamation(&mut self) -> Vec<SandboxId> {
        let deadline = Instant::now() + self.config.reclaim_timeout();
        let poll = self.config.reclaim_poll();

        loop {
            let pending: Vec<SandboxId> = self
                .sandboxes
                .values_mut()
                .filter_map(|slot| (!slot.sandbox.try_reclaim()).then(|| slot.sandbox.id()))
                .collect();

            if pending.is_empty() {
                return pending;
            }
            if Instant::now() >= deadline {
                for id in &pending {
                    warn!("{} was not reclaimed within {:?}", id, self.config.reclaim_timeout());
                }
                return pending;
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Unload everything, load fresh copies and re-show what was visible
    pub async fn reload(&mut self) -> HostResult<ReloadReport> {
        let visible: Vec<PluginIdentity> = self
            .descriptors
            .iter()
            .filter(|d| d.is_visible())
            .map(PluginDescriptor::identity)
            .collect();

        info!("Reloading plugins ({} visible)", visible.len());

        let unload = self.unload_all().await?;
        let load = self.load_all().await?;
        let mut report = ReloadReport {
            unload,
            load,
            ..Default::default()
        };

        for identity in visible {
            let Some(descriptor) = self
                .descriptors
                .iter_mut()
                .find(|d| d.identity() == identity)
            else {
                debug!("Previously visible plugin {} is gone", identity);
                report.dropped.push(identity.to_string());
                continue;
            };

            match descriptor.instance.activate() {
                Ok(()) => report.restored.push(descriptor.key),
                Err(e) => warn!("Failed to restore {}: {}", identity, e),
            }
        }

        let _ = self.events.send(HostEvent::Reloaded {
            plugins: self.descriptors.len(),
            restored: report.restored.len(),
        });
        Ok(report)
    }

    /// Read-only snapshot of descriptors and open sandboxes
    pub fn list(&self) -> RegistryListing {
        RegistryListing {
            state: self.state,
            generation: self.generation,
            plugins: self
                .descriptors
                .iter()
                .map(|d| PluginSummary {
                    key: d.key,
                    name: d.name.clone(),
                    type_name: d.type_name().to_string(),
                    source_path: d.source_path.clone(),
                    shadow_path: d.shadow_path.clone(),
                    sandbox: d.sandbox,
                    visible: d.is_visible(),
                })
                .collect(),
            sandboxes: self
                .sandboxes
                .values()
                .map(|slot| SandboxSummary {
                    id: slot.sandbox.id(),
                    state: slot.sandbox.state(),
                    binary: slot.sandbox.binary().to_path_buf(),
                    source_path: slot.job.source_path.clone(),
                    scratch_dir: slot.job.scratch_dir.clone(),
                    live_instances: slot.sandbox.live_instances(),
                })
                .collect(),
        }
    }

    /// Forward `activate` to the plugin behind `key`
    pub async fn activate(&mut self, key: PluginKey) -> HostResult<()> {
        let descriptor = self.descriptor_mut(key)?;
        descriptor.instance.activate()?;
        debug!("Activated plugin {} [{}]", descriptor.name, key);
        Ok(())
    }

    /// Forward `close` to the plugin behind `key` without unloading it
    pub async fn close(&mut self, key: PluginKey) -> HostResult<()> {
        let descriptor = self.descriptor_mut(key)?;
        descriptor.instance.close()?;
        debug!("Closed plugin {} [{}]", descriptor.name, key);
        Ok(())
    }

    fn descriptor_mut(&mut self, key: PluginKey) -> HostResult<&mut PluginDescriptor> {
        self.descriptors
            .iter_mut()
            .find(|d| d.key == key)
            .ok_or_else(|| HostError::PluginNotFound(key.to_string()))
    }
}

/// Candidate binaries in the plugin directory, sorted by file name
async fn candidates(dir: &Path, config: &HostConfig) -> Vec<PathBuf> {
    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        warn!("Failed to create plugin directory {:?}: {}", dir, e);
        return Vec::new();
    }

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Failed to read plugin directory {:?}: {}", dir, e);
            return Vec::new();
        }
    };

    let mut candidates = Vec::new();
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let path = entry.path();
                let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
                if is_file && config.is_candidate(&path) {
                    candidates.push(path);
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read plugin directory entry: {}", e);
                break;
            }
        }
    }

    candidates.sort();
    candidates
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("descriptors", &self.descriptors)
            .field("sandboxes", &self.sandboxes.len())
            .finish()
    }
}
