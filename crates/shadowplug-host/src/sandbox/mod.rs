//! Module sandbox
//!
//! An independently unloadable boundary around one staged binary. The sandbox
//! and every [`PluginInstance`] it produced share ownership of the loaded
//! [`ModuleImage`]; the native code is unmapped when the last of them lets go.
//! [`Sandbox::close`] gives up the sandbox's share, so once the registry has
//! dropped the instances the image is released deterministically.

mod loader;
mod resolver;

pub use loader::{InProcessLoader, ModuleImage, ModuleLoader, NativeLoader};
pub use resolver::DependencyResolver;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use serde::Serialize;
use shadowplug_sdk::{GuardedPlugin, PluginError};
use tracing::{debug, warn};

use crate::error::{ActivateError, DisposeError, InstantiateError, LoadError};

/// Stable identifier of a sandbox within one host process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SandboxId(pub u64);

impl std::fmt::Display for SandboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sandbox-{}", self.0)
    }
}

/// Sandbox lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SandboxState {
    /// Accepting new instances
    Open,
    /// Closed; waiting for outstanding instances to drop
    Unloading,
    /// Image released
    Unloaded,
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxState::Open => write!(f, "Open"),
            SandboxState::Unloading => write!(f, "Unloading"),
            SandboxState::Unloaded => write!(f, "Unloaded"),
        }
    }
}

/// A plugin object together with a share of the image holding its code
pub struct PluginInstance {
    // Field order matters: `plugin` must drop before `image`.
    plugin: Box<dyn GuardedPlugin>,
    image: Arc<ModuleImage>,
    sandbox: SandboxId,
    type_name: String,
}

impl PluginInstance {
    pub fn name(&self) -> &str {
        self.plugin.name()
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn is_visible(&self) -> bool {
        self.plugin.is_visible()
    }

    pub fn sandbox(&self) -> SandboxId {
        self.sandbox
    }

    /// Forward `activate`; a panic in plugin code comes back as an error
    pub fn activate(&mut self) -> Result<(), ActivateError> {
        self.plugin
            .activate()
            .map_err(|e| ActivateError::Panicked {
                name: self.plugin.name().to_string(),
                message: plugin_message(e),
            })
    }

    /// Forward `close`, keeping reported failures apart from panics
    pub fn close(&mut self) -> Result<(), DisposeError> {
        match self.plugin.close() {
            Ok(()) => Ok(()),
            Err(PluginError::Panicked(message)) => Err(DisposeError::Panicked {
                name: self.plugin.name().to_string(),
                message,
            }),
            Err(e) => Err(DisposeError::Failed {
                name: self.plugin.name().to_string(),
                message: e.to_string(),
            }),
        }
    }
}

fn plugin_message(error: PluginError) -> String {
    match error {
        PluginError::Panicked(message) => message,
        other => other.to_string(),
    }
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("name", &self.plugin.name())
            .field("type_name", &self.type_name)
            .field("sandbox", &self.sandbox)
            .field("image", &self.image.path())
            .finish()
    }
}

/// Isolated load boundary for one staged binary
pub struct Sandbox {
    id: SandboxId,
    binary: PathBuf,
    resolver: DependencyResolver,
    state: SandboxState,
    image: Option<Arc<ModuleImage>>,
    /// Observes the image after `close` to detect reclamation
    released: Weak<ModuleImage>,
}

impl Sandbox {
    /// Open a sandbox whose resolver is rooted at the staged binary's directory
    pub fn open(id: SandboxId, shadow_path: &Path) -> Self {
        debug!("Opening {} for {:?}", id, shadow_path);
        Self {
            id,
            binary: shadow_path.to_path_buf(),
            resolver: DependencyResolver::new(shadow_path),
            state: SandboxState::Open,
            image: None,
            released: Weak::new(),
        }
    }

    pub fn id(&self) -> SandboxId {
        self.id
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn is_loaded(&self) -> bool {
        self.image.is_some()
    }

    /// Instances still holding the image (excludes the sandbox's own share)
    pub fn live_instances(&self) -> usize {
        let total = self.released.strong_count();
        total.saturating_sub(usize::from(self.image.is_some()))
    }

    /// Load the staged binary through `loader`, off the calling thread
    pub async fn load(&mut self, loader: Arc<dyn ModuleLoader>) -> Result<(), LoadError> {
        if self.state != SandboxState::Open {
            return Err(LoadError::SandboxClosed(self.id.0));
        }
        if self.image.is_some() {
            return Ok(());
        }

        let path = self.binary.clone();
        let resolver = self.resolver.clone();
        let image = tokio::task::spawn_blocking(move || loader.load(&path, &resolver))
            .await
            .map_err(|_| LoadError::Panicked(self.binary.clone()))??;

        let image = Arc::new(image);
        self.released = Arc::downgrade(&image);
        self.image = Some(image);
        Ok(())
    }

    /// Names of the plugin types the loaded binary declares; empty once closed
    pub fn discover(&self) -> Vec<String> {
        match (&self.image, self.state) {
            (Some(image), SandboxState::Open) => image.type_names().map(str::to_string).collect(),
            _ => Vec::new(),
        }
    }

    /// Construct the type at `index` in [`Sandbox::discover`] order.
    ///
    /// Constructor errors and panics come back as [`InstantiateError`].
    pub fn instantiate(&self, index: usize) -> Result<PluginInstance, InstantiateError> {
        let image = match (&self.image, self.state) {
            (Some(image), SandboxState::Open) => image.clone(),
            _ => return Err(InstantiateError::SandboxClosed(self.id.0)),
        };

        let type_name = image
            .type_names()
            .nth(index)
            .map(str::to_string)
            .ok_or(InstantiateError::UnknownType {
                sandbox: self.id.0,
                index,
            })?;

        let plugin = match image.instantiate(index) {
            Some(Ok(plugin)) => plugin,
            Some(Err(PluginError::Panicked(message))) => {
                return Err(InstantiateError::Panicked { type_name, message });
            }
            Some(Err(e)) => {
                return Err(InstantiateError::Failed {
                    type_name,
                    message: e.to_string(),
                });
            }
            None => {
                return Err(InstantiateError::UnknownType {
                    sandbox: self.id.0,
                    index,
                });
            }
        };

        Ok(PluginInstance {
            plugin,
            image,
            sandbox: self.id,
            type_name,
        })
    }

    /// Stop handing out instances and give up the sandbox's share of the image
    pub fn close(&mut self) {
        if self.state != SandboxState::Open {
            return;
        }
        self.state = SandboxState::Unloading;
        self.image = None;
        if self.live_instances() > 0 {
            debug!(
                "{} closing with {} live instances",
                self.id,
                self.live_instances()
            );
        }
        self.try_reclaim();
    }

    /// Move to `Unloaded` once nothing references the image any more
    pub fn try_reclaim(&mut self) -> bool {
        if self.state == SandboxState::Unloading && self.released.strong_count() == 0 {
            self.state = SandboxState::Unloaded;
            debug!("{} reclaimed", self.id);
        }
        self.state == SandboxState::Unloaded
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if self.state == SandboxState::Open {
            warn!("{} dropped while open: {:?}", self.id, self.binary);
        }
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("binary", &self.binary)
            .field("state", &self.state)
            .field("live_instances", &self.live_instances())
            .finish()
    }
}
