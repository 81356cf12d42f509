//! Activation surface as seen by a presentation layer

mod common;

use common::*;
use shadowplug_host::sdk::TypeDescriptor;
use shadowplug_host::{HostEvent, InProcessLoader, ItemKind, RegistryState};

#[tokio::test]
async fn test_surface_lists_host_items_then_plugins_in_load_order() {
    let (_temp, config) = fixture();
    deploy(&config, "b.so");
    deploy(&config, "a.so");
    let host = host(
        config,
        InProcessLoader::new()
            .with_module("b", vec![TypeDescriptor::of::<Tracked<11>>()])
            .with_module(
                "a",
                vec![TypeDescriptor::of::<Tracked<12>>(), TypeDescriptor::of::<Tracked<13>>()],
            ),
    );
    host.start().await.unwrap();

    let surface = host.activation_items();
    assert_eq!(
        surface.labels(),
        vec!["Reload", "Unload", "List", "Tracked12", "Tracked13", "Tracked11"]
    );
    assert_eq!(surface.get(0).map(|i| i.kind()), Some(ItemKind::Reload));
    assert_eq!(surface.get(1).map(|i| i.kind()), Some(ItemKind::Unload));
    assert_eq!(surface.get(2).map(|i| i.kind()), Some(ItemKind::List));

    // Plugin entries correspond 1:1 with descriptors
    let listing = host.list().await;
    let keys: Vec<ItemKind> = surface.plugin_items().map(|i| i.kind()).collect();
    let expected: Vec<ItemKind> = listing.plugins.iter().map(|p| ItemKind::Plugin(p.key)).collect();
    assert_eq!(keys, expected);
}

#[tokio::test]
async fn test_plugin_item_activates_plugin() {
    let (_temp, config) = fixture();
    deploy(&config, "clock.so");
    let host = host(
        config,
        InProcessLoader::new().with_module("clock", vec![TypeDescriptor::of::<Tracked<24>>()]),
    );
    host.start().await.unwrap();

    let item = host.activation_items().find("Tracked24").cloned().unwrap();
    item.invoke().await;
    item.invoke().await;

    assert!(host.list().await.plugins[0].visible);
    assert_eq!(surfaces(24), 1);
}

#[tokio::test]
async fn test_stale_item_after_reload_is_inert() {
    let (_temp, config) = fixture();
    deploy(&config, "clock.so");
    let host = host(
        config,
        InProcessLoader::new().with_module("clock", vec![TypeDescriptor::of::<Tracked<25>>()]),
    );
    host.start().await.unwrap();
    let stale = host.activation_items().find("Tracked25").cloned().unwrap();

    host.reload().await.unwrap();
    stale.invoke().await;

    assert!(!host.list().await.plugins[0].visible);
    assert_eq!(surfaces(25), 0);
    assert_eq!(dropped(25), 1);
}

#[tokio::test]
async fn test_host_items_drive_the_registry() {
    let (_temp, config) = fixture();
    deploy(&config, "clock.so");
    let host = host(
        config,
        InProcessLoader::new().with_module("clock", vec![TypeDescriptor::of::<Tracked<26>>()]),
    );
    host.start().await.unwrap();
    host.activation_items().find("Tracked26").unwrap().invoke().await;

    host.activation_items().find("Reload").unwrap().invoke().await;
    assert_eq!(constructed(26), 2);
    assert!(host.list().await.plugins[0].visible);

    host.activation_items().find("List").unwrap().invoke().await;

    host.activation_items().find("Unload").unwrap().invoke().await;
    assert_eq!(host.state().await, RegistryState::Empty);
    assert_eq!(host.activation_items().labels(), vec!["Reload", "Unload", "List"]);
}

#[tokio::test]
async fn test_surface_changes_are_announced() {
    let (_temp, config) = fixture();
    deploy(&config, "clock.so");
    let host = host(
        config,
        InProcessLoader::new().with_module("clock", vec![TypeDescriptor::of::<Tracked<27>>()]),
    );
    let mut events = host.subscribe();

    host.start().await.unwrap();
    host.unload_all().await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }

    assert!(matches!(seen[0], HostEvent::PluginLoaded { ref name, .. } if name == "Tracked27"));
    assert!(seen.contains(&HostEvent::SurfaceChanged { items: 4 }));
    assert!(seen.contains(&HostEvent::Unloaded {
        plugins: 1,
        sandboxes: 1
    }));
    assert!(seen.contains(&HostEvent::SurfaceChanged { items: 3 }));
}
