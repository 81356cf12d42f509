//! Panic containment on the plugin side of the boundary
//!
//! A plugin binary links its own copy of the standard library, and a panic
//! raised there cannot unwind into the host: the host's `catch_unwind` sees a
//! foreign exception and aborts. Every call the host makes into plugin code
//! therefore goes through a [`GuardedPlugin`] whose vtable is built inside the
//! plugin binary, so the unwind is caught by the runtime that started it.

use std::mem::ManuallyDrop;
use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::{Plugin, PluginError, PluginResult};

/// Host-facing view of a plugin. Calls return instead of unwinding.
pub trait GuardedPlugin: Send {
    /// Display name; falls back to the type name if the plugin panics
    fn name(&self) -> &str;

    /// Visibility; a panicking plugin reports itself hidden
    fn is_visible(&self) -> bool;

    fn activate(&mut self) -> PluginResult<()>;

    fn close(&mut self) -> PluginResult<()>;
}

/// A plugin wrapped so that none of its panics leave the binary it lives in
pub struct Guarded {
    type_name: &'static str,
    plugin: ManuallyDrop<Box<dyn Plugin>>,
}

impl Guarded {
    pub fn new(type_name: &'static str, plugin: Box<dyn Plugin>) -> Self {
        Self {
            type_name,
            plugin: ManuallyDrop::new(plugin),
        }
    }
}

impl GuardedPlugin for Guarded {
    fn name(&self) -> &str {
        let plugin = &self.plugin;
        catch_unwind(AssertUnwindSafe(|| plugin.name())).unwrap_or(self.type_name)
    }

    fn is_visible(&self) -> bool {
        let plugin = &self.plugin;
        catch_unwind(AssertUnwindSafe(|| plugin.is_visible())).unwrap_or(false)
    }

    fn activate(&mut self) -> PluginResult<()> {
        let plugin = &mut self.plugin;
        contain(|| plugin.activate())
    }

    fn close(&mut self) -> PluginResult<()> {
        let plugin = &mut self.plugin;
        contain(|| plugin.close())?
    }
}

impl Drop for Guarded {
    fn drop(&mut self) {
        // SAFETY: `plugin` is taken exactly once and never touched afterwards.
        let plugin = unsafe { ManuallyDrop::take(&mut self.plugin) };
        // The panic hook has already reported the message.
        let _ = contain(move || drop(plugin));
    }
}

/// Run plugin code, turning a panic into [`PluginError::Panicked`]
pub fn contain<R>(f: impl FnOnce() -> R) -> PluginResult<R> {
    catch_unwind(AssertUnwindSafe(f))
        .map_err(|payload| PluginError::Panicked(panic_message(payload.as_ref())))
}

/// Render a caught panic payload
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
