//! Plugin host
//!
//! Clonable handle that serializes every control operation through one async
//! mutex around the [`Registry`], keeps the activation surface in step with it
//! and runs the shadow-copy reaper in the background.

use std::future::Future;
use std::sync::{Arc, Weak};

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{self, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::HostConfig;
use crate::error::HostResult;
use crate::events::HostEvent;
use crate::registry::{
    LoadReport, PluginKey, Registry, RegistryListing, RegistryState, ReloadReport, UnloadReport,
};
use crate::sandbox::{ModuleLoader, NativeLoader};
use crate::shadow::{ReapReport, ShadowCopyManager};
use crate::surface::{Action, ActivationItem, ActivationSurface, ItemKind};

struct HostInner {
    /// Host configuration
    config: HostConfig,
    /// Plugin registry; the lock serializes load / unload / reload
    registry: sync::Mutex<Registry>,
    /// Shadow-copy manager shared with the registry
    shadow: Arc<ShadowCopyManager>,
    /// Event broadcaster
    events: broadcast::Sender<HostEvent>,
    /// Current activation surface
    surface: RwLock<ActivationSurface>,
    /// Background reaping passes
    reapers: Mutex<Vec<JoinHandle<ReapReport>>>,
}

/// Plugin host handle
#[derive(Clone)]
pub struct PluginHost {
    inner: Arc<HostInner>,
}

impl PluginHost {
    /// Create a host that loads native plugin binaries
    pub fn new(config: HostConfig) -> Self {
        Self::with_loader(config, Arc::new(NativeLoader::new()))
    }

    /// Create a host with a custom module loader
    pub fn with_loader(config: HostConfig, loader: Arc<dyn ModuleLoader>) -> Self {
        let shadow = ShadowCopyManager::new(config.shadow_root(), config.reap.clone());
        Self::with_parts(config, loader, shadow)
    }

    /// Create a host with a custom loader and shadow-copy manager
    pub fn with_parts(
        config: HostConfig,
        loader: Arc<dyn ModuleLoader>,
        shadow: ShadowCopyManager,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let shadow = Arc::new(shadow);
        let registry = Registry::new(config.clone(), loader, shadow.clone(), events.clone());

        let host = Self {
            inner: Arc::new(HostInner {
                config,
                registry: sync::Mutex::new(registry),
                shadow,
                events,
                surface: RwLock::new(ActivationSurface::default()),
                reapers: Mutex::new(Vec::new()),
            }),
        };
        *host.inner.surface.write() = host.build_surface(&[]);
        host
    }

    pub fn config(&self) -> &HostConfig {
        &self.inner.config
    }

    /// Subscribe to host events
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.inner.events.subscribe()
    }

    /// Create the plugin and scratch directories, sweep stale scratch copies
    /// left by an earlier process, then load every plugin.
    pub async fn start(&self) -> HostResult<LoadReport> {
        let shadow_root = self.inner.config.shadow_root();
        info!("Starting plugin host in {:?}", self.inner.config.plugins_path());
        tokio::fs::create_dir_all(&shadow_root).await?;

        if self.inner.config.sweep_on_start {
            let protected = self.inner.registry.lock().await.protected_dirs();
            self.inner.shadow.sweep_orphans(&protected).await;
        }

        self.load_all().await
    }

    pub async fn load_all(&self) -> HostResult<LoadReport> {
        let mut registry = self.inner.registry.lock().await;
        let result = registry.load_all().await;
        self.after_operation(&registry);
        result
    }

    pub async fn unload_all(&self) -> HostResult<UnloadReport> {
        let mut registry = self.inner.registry.lock().await;
        let result = registry.unload_all().await;
        self.after_operation(&registry);
        result
    }

    pub async fn reload(&self) -> HostResult<ReloadReport> {
        let mut registry = self.inner.registry.lock().await;
        let result = registry.reload().await;
        self.after_operation(&registry);
        result
    }

    /// Diagnostic snapshot of descriptors and sandboxes
    pub async fn list(&self) -> RegistryListing {
        self.inner.registry.lock().await.list()
    }

    pub async fn state(&self) -> RegistryState {
        self.inner.registry.lock().await.state()
    }

    pub async fn activate(&self, key: PluginKey) -> HostResult<()> {
        self.inner.registry.lock().await.activate(key).await
    }

    /// Close one plugin's presentation; the plugin stays loaded
    pub async fn close(&self, key: PluginKey) -> HostResult<()> {
        self.inner.registry.lock().await.close(key).await
    }

    /// Snapshot of the current activation surface
    pub fn activation_items(&self) -> ActivationSurface {
        self.inner.surface.read().clone()
    }

    /// Scratch directories still queued for deletion
    pub fn pending_reaps(&self) -> Vec<std::path::PathBuf> {
        self.inner.shadow.pending()
    }

    /// Wait for every background reaping pass started so far
    pub async fn wait_for_reaper(&self) -> ReapReport {
        let handles = std::mem::take(&mut *self.inner.reapers.lock());
        let mut total = ReapReport::default();
        for handle in handles {
            match handle.await {
                Ok(report) => total.absorb(report),
                Err(e) => warn!("Reaper task failed: {}", e),
            }
        }
        total
    }

    /// Run reaping passes in the foreground until the queue drains or
    /// `passes` runs out
    pub async fn reap_pending(&self, passes: u32) -> ReapReport {
        self.wait_for_reaper().await;
        self.inner.shadow.reap_until_clean(passes).await
    }

    /// Unload everything and wait for the reaper
    pub async fn shutdown(&self) -> HostResult<ReapReport> {
        info!("Shutting down plugin host");
        self.unload_all().await?;
        Ok(self.wait_for_reaper().await)
    }

    fn after_operation(&self, registry: &Registry) {
        let keys: Vec<(PluginKey, String)> = registry
            .descriptors()
            .iter()
            .map(|d| (d.key(), d.name().to_string()))
            .collect();
        let surface = self.build_surface(&keys);
        let items = surface.len();
        *self.inner.surface.write() = surface;
        let _ = self.inner.events.send(HostEvent::SurfaceChanged { items });

        self.spawn_reaper();
    }

    fn build_surface(&self, plugins: &[(PluginKey, String)]) -> ActivationSurface {
        let weak = Arc::downgrade(&self.inner);

        let mut items = vec![
            ActivationItem::new(
                "Reload",
                ItemKind::Reload,
                host_action(&weak, |host| async move {
                    if let Err(e) = host.reload().await {
                        warn!("Reload failed: {}", e);
                    }
                }),
            ),
            ActivationItem::new(
                "Unload",
                ItemKind::Unload,
                host_action(&weak, |host| async move {
                    if let Err(e) = host.unload_all().await {
                        warn!("Unload failed: {}", e);
                    }
                }),
            ),
            ActivationItem::new(
                "List",
                ItemKind::List,
                host_action(&weak, |host| async move {
                    for line in host.list().await.lines() {
                        info!("{}", line);
                    }
                }),
            ),
        ];

        for (key, name) in plugins {
            let key = *key;
            items.push(ActivationItem::new(
                name.clone(),
                ItemKind::Plugin(key),
                host_action(&weak, move |host| async move {
                    if let Err(e) = host.activate(key).await {
                        debug!("Activation of {} skipped: {}", key, e);
                    }
                }),
            ));
        }

        ActivationSurface::new(items)
    }

    fn spawn_reaper(&self) {
        if self.inner.shadow.pending().is_empty() {
            return;
        }

        let shadow = self.inner.shadow.clone();
        let events = self.inner.events.clone();
        let handle = tokio::spawn(async move {
            let report = shadow.reap_pending().await;
            let _ = events.send(HostEvent::ReapFinished {
                deleted: report.deleted.len(),
                orphaned: report.orphaned.len(),
                abandoned: report.abandoned.len(),
            });
            report
        });

        let mut reapers = self.inner.reapers.lock();
        reapers.retain(|h| !h.is_finished());
        reapers.push(handle);
    }
}

/// Wrap `f` as an action that runs against the host if it is still alive
fn host_action<F, Fut>(weak: &Weak<HostInner>, f: F) -> Action
where
    F: Fn(PluginHost) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let weak = weak.clone();
    Arc::new(move || {
        let pending = weak.upgrade().map(|inner| f(PluginHost { inner }));
        async move {
            match pending {
                Some(fut) => fut.await,
                None => debug!("Plugin host is gone, ignoring action"),
            }
        }
        .boxed()
    })
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("plugins_path", &self.inner.config.plugins_path())
            .field("surface", &self.inner.surface.read().labels())
            .finish()
    }
}
