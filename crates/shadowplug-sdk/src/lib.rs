//! Shadowplug SDK
//!
//! The capability contract every plugin binary implements, and the glue a
//! binary uses to publish its plugin types to the host:
//! - [`Plugin`]: display name, visibility, activate, close
//! - [`TypeDescriptor`]: a named constructor for one plugin type
//! - [`GuardedPlugin`]: what the host actually holds; plugin panics are caught
//!   inside the plugin binary and come back as [`PluginError::Panicked`]
//! - [`PluginDeclaration`]: the table a binary exports under
//!   [`DECLARATION_SYMBOL`]
//! - [`declare_plugin!`]: emits the declaration for a list of types
//!
//! A plugin crate is built as a `cdylib` and only needs:
//!
//! ```rust,ignore
//! use shadowplug_sdk::{Plugin, PluginResult, declare_plugin};
//!
//! #[derive(Default)]
//! struct Greeter { visible: bool }
//!
//! impl Plugin for Greeter {
//!     fn name(&self) -> &str { "Greeter" }
//!     fn is_visible(&self) -> bool { self.visible }
//!     fn activate(&mut self) { self.visible = true; }
//!     fn close(&mut self) -> PluginResult<()> { self.visible = false; Ok(()) }
//! }
//!
//! declare_plugin!(Greeter);
//! ```

mod declaration;
mod error;
mod guard;

pub use declaration::{
    API_VERSION, DECLARATION_SYMBOL, PluginDeclaration, PluginRegistrar, SDK_VERSION,
    TypeDescriptor,
};
pub use error::{PluginError, PluginResult};
pub use guard::{Guarded, GuardedPlugin, contain};

/// Core plugin trait
///
/// The host creates exactly one instance per registered type, drives it through
/// `activate`/`close`, and drops it before the binary that holds its code is
/// unloaded.
pub trait Plugin: Send {
    /// Display name, stable for the lifetime of the instance
    fn name(&self) -> &str;

    /// Whether the plugin's own presentation is currently shown
    fn is_visible(&self) -> bool;

    /// Show the plugin, or bring it to the foreground if it is already shown.
    ///
    /// Calling this twice without an intervening [`Plugin::close`] must not
    /// create a second presentation.
    fn activate(&mut self);

    /// Release the presentation and any held resources.
    ///
    /// Must succeed on an instance that was never activated.
    fn close(&mut self) -> PluginResult<()>;
}
