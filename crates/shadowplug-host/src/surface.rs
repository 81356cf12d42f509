//! Activation surface
//!
//! The ordered list of labelled actions a presentation layer shows: host
//! entries first, then one entry per loaded plugin in load order. It is a
//! projection of registry state and is rebuilt wholesale after every load,
//! unload and reload; items carry no identity across rebuilds.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::registry::PluginKey;

/// What an item acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Reload,
    Unload,
    List,
    Plugin(PluginKey),
}

/// Zero-argument action behind an item
pub type Action = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// One labelled, invocable entry
#[derive(Clone)]
pub struct ActivationItem {
    label: String,
    kind: ItemKind,
    action: Action,
}

impl ActivationItem {
    pub fn new(label: impl Into<String>, kind: ItemKind, action: Action) -> Self {
        Self {
            label: label.into(),
            kind,
            action,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    pub fn is_plugin(&self) -> bool {
        matches!(self.kind, ItemKind::Plugin(_))
    }

    /// Run the action
    pub fn invoke(&self) -> BoxFuture<'static, ()> {
        (self.action)()
    }
}

impl std::fmt::Debug for ActivationItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivationItem")
            .field("label", &self.label)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Snapshot of every item, in display order
#[derive(Debug, Clone, Default)]
pub struct ActivationSurface {
    items: Vec<ActivationItem>,
}

impl ActivationSurface {
    pub fn new(items: Vec<ActivationItem>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[ActivationItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ActivationItem> {
        self.items.get(index)
    }

    /// First item with the given label
    pub fn find(&self, label: &str) -> Option<&ActivationItem> {
        self.items.iter().find(|item| item.label == label)
    }

    pub fn plugin_items(&self) -> impl Iterator<Item = &ActivationItem> {
        self.items.iter().filter(|item| item.is_plugin())
    }

    pub fn labels(&self) -> Vec<&str> {
        self.items.iter().map(|item| item.label.as_str()).collect()
    }
}
