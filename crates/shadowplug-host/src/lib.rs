//! Plugin host with shadow-copied, independently unloadable plugin binaries
//!
//! Provides:
//! - Shadow copies of plugin binaries, so deployed files are never held open
//! - One sandbox per binary with its own dependency resolution
//! - Load / unload / reload of the whole plugin set, restoring visibility
//! - Background reaping of scratch copies with bounded retries
//! - An activation surface for presentation layers
//!
//! # Example
//!
//! ```no_run
//! use shadowplug_host::{HostConfig, PluginHost};
//!
//! # async fn run() -> shadowplug_host::HostResult<()> {
//! let host = PluginHost::new(HostConfig::load(None)?);
//! host.start().await?;
//!
//! for item in host.activation_items().items() {
//!     println!("{}", item.label());
//! }
//!
//! host.reload().await?;
//! host.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod host;
pub mod registry;
pub mod sandbox;
pub mod shadow;
pub mod surface;

pub use config::{ENV_PREFIX, HostConfig};
pub use error::{
    ActivateError, DisposeError, HostError, HostResult, InstantiateError, LoadError, ReapError,
    StageError,
};
pub use events::HostEvent;
pub use host::PluginHost;
pub use registry::{
    LoadFailure, LoadReport, PluginDescriptor, PluginIdentity, PluginKey, PluginSummary, Registry,
    RegistryListing, RegistryState, ReloadReport, SandboxSummary, UnloadReport,
};
pub use sandbox::{
    DependencyResolver, InProcessLoader, ModuleImage, ModuleLoader, NativeLoader, PluginInstance,
    Sandbox, SandboxId, SandboxState,
};
pub use shadow::{DirRemover, FsRemover, ReapReport, RetryPolicy, ShadowCopyJob, ShadowCopyManager};
pub use surface::{Action, ActivationItem, ActivationSurface, ItemKind};

pub use shadowplug_sdk as sdk;
