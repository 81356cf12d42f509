//! Shadow copies and reaping of scratch directories

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use shadowplug_host::sdk::TypeDescriptor;
use shadowplug_host::{InProcessLoader, PluginHost, RetryPolicy, ShadowCopyManager};

#[tokio::test]
async fn test_only_staged_copies_are_loaded() {
    let (_temp, config) = fixture();
    let source = deploy(&config, "lantern.so");
    let shadow_root = config.shadow_root();
    let loader = Arc::new(RecordingLoader::new(
        InProcessLoader::new().with_module("lantern", vec![TypeDescriptor::of::<Tracked<16>>()]),
    ));
    let host = PluginHost::with_loader(config, loader.clone());

    host.start().await.unwrap();
    host.reload().await.unwrap();

    let seen = loader.seen();
    assert_eq!(seen.len(), 2);
    for path in &seen {
        assert_ne!(path, &source);
        assert!(path.starts_with(&shadow_root));
        assert_eq!(path.file_name(), source.file_name());
    }
    // A fresh scratch directory per load
    assert_ne!(seen[0].parent(), seen[1].parent());
}

#[tokio::test]
async fn test_original_can_be_deleted_or_replaced_while_loaded() {
    let (_temp, config) = fixture();
    let source = deploy(&config, "lantern.so");
    let host = host(
        config,
        InProcessLoader::new().with_module("lantern", vec![TypeDescriptor::of::<Tracked<17>>()]),
    );
    host.start().await.unwrap();
    let plugin = host.list().await.plugins[0].clone();

    std::fs::write(&source, b"rebuilt").unwrap();
    assert_eq!(
        std::fs::read(&plugin.shadow_path).unwrap(),
        b"binary lantern.so".to_vec()
    );

    std::fs::remove_file(&source).unwrap();
    host.activate(plugin.key).await.unwrap();
    assert!(host.list().await.plugins[0].visible);

    let report = host.reload().await.unwrap();
    assert!(report.load.failures.is_empty());
    assert!(host.list().await.plugins.is_empty());
}

#[tokio::test]
async fn test_scratch_dirs_are_reaped_after_unload() {
    let (_temp, config) = fixture();
    deploy(&config, "one.so");
    deploy(&config, "two.so");
    let host = host(
        config,
        InProcessLoader::new()
            .with_module("one", vec![TypeDescriptor::of::<Tracked<18>>()])
            .with_module("two", vec![TypeDescriptor::of::<Tracked<19>>()]),
    );
    host.start().await.unwrap();
    let dirs: Vec<_> = host
        .list()
        .await
        .sandboxes
        .iter()
        .map(|s| s.scratch_dir.clone())
        .collect();
    assert_eq!(dirs.len(), 2);

    let unload = host.unload_all().await.unwrap();
    assert_eq!(unload.scheduled.len(), 2);

    let report = host.wait_for_reaper().await;
    assert_eq!(report.deleted.len(), 2);
    assert!(report.is_clean());
    for dir in dirs {
        assert!(!dir.exists());
    }
    assert!(host.pending_reaps().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reaper_converges_on_delayed_release() {
    let (_temp, config) = fixture();
    deploy(&config, "slow.so");
    // Two attempts per pass; five failures take three passes
    let remover = Arc::new(StickyRemover::flaky(5));
    let shadow = ShadowCopyManager::new(
        config.shadow_root(),
        RetryPolicy::fixed(2, Duration::from_millis(50)),
    )
    .with_remover(remover.clone());
    let loader =
        InProcessLoader::new().with_module("slow", vec![TypeDescriptor::of::<Tracked<20>>()]);
    let host = PluginHost::with_parts(config, Arc::new(loader), shadow);

    host.start().await.unwrap();
    let dir = host.list().await.sandboxes[0].scratch_dir.clone();
    host.unload_all().await.unwrap();

    let first = host.wait_for_reaper().await;
    assert_eq!(first.orphaned, vec![dir.clone()]);
    assert_eq!(host.pending_reaps(), vec![dir.clone()]);
    assert!(dir.exists());

    let rest = host.reap_pending(5).await;
    assert_eq!(rest.deleted, vec![dir.clone()]);
    assert!(rest.is_clean());
    assert!(!dir.exists());
    assert_eq!(remover.calls.load(Ordering::SeqCst), 6);
}

#[tokio::test(start_paused = true)]
async fn test_reaper_gives_up_on_held_directory() {
    let (_temp, config) = fixture();
    deploy(&config, "free.so");
    deploy(&config, "held.so");
    let shadow = ShadowCopyManager::new(
        config.shadow_root(),
        RetryPolicy::fixed(3, Duration::from_millis(100)),
    )
    .with_remover(Arc::new(StickyRemover::holding("held.so")));
    let loader = InProcessLoader::new()
        .with_module("free", vec![TypeDescriptor::of::<Tracked<21>>()])
        .with_module("held", vec![TypeDescriptor::of::<Tracked<22>>()]);
    let host = PluginHost::with_parts(config, Arc::new(loader), shadow);

    host.start().await.unwrap();
    let listing = host.list().await;
    let held_dir = listing
        .sandboxes
        .iter()
        .find(|s| s.source_path.ends_with("held.so"))
        .map(|s| s.scratch_dir.clone())
        .unwrap();

    host.unload_all().await.unwrap();
    host.wait_for_reaper().await;
    let report = host.reap_pending(3).await;

    assert_eq!(report.orphaned, vec![held_dir.clone()]);
    assert!(held_dir.exists());
    assert_eq!(host.pending_reaps(), vec![held_dir]);
    let leftovers = std::fs::read_dir(host.config().shadow_root()).unwrap().count();
    assert_eq!(leftovers, 1);
}

#[tokio::test]
async fn test_start_sweeps_scratch_dirs_of_earlier_runs() {
    let (_temp, config) = fixture();
    deploy(&config, "keep.so");
    let stale = config.shadow_root().join("00000000-0000-0000-0000-000000000000");
    std::fs::create_dir_all(&stale).unwrap();
    std::fs::write(stale.join("keep.so"), b"old").unwrap();

    let host = host(
        config,
        InProcessLoader::new().with_module("keep", vec![TypeDescriptor::of::<Tracked<23>>()]),
    );
    host.start().await.unwrap();

    assert!(!stale.exists());
    let live = host.list().await.sandboxes[0].scratch_dir.clone();
    assert!(live.exists());
}

#[tokio::test]
async fn test_sweep_can_be_disabled() {
    let (_temp, config) = fixture();
    let stale = config.shadow_root().join("left-behind");
    std::fs::create_dir_all(&stale).unwrap();

    let host = host(config.with_sweep_on_start(false), InProcessLoader::new());
    host.start().await.unwrap();

    assert!(stale.exists());
}
