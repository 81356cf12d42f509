//! Real plugin binaries through the native loader
//!
//! Builds the `shadowplug-fixtures` cdylib once into a private target
//! directory and deploys copies of it.

use std::env::consts::{DLL_EXTENSION, DLL_PREFIX, DLL_SUFFIX};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, OnceLock};

use shadowplug_host::{
    ActivateError, DependencyResolver, HostConfig, HostError, ModuleLoader, NativeLoader,
    PluginHost, PluginKey, RegistryListing, RegistryState, RetryPolicy, Sandbox, SandboxId,
    SandboxState,
};
use tempfile::TempDir;

fn fixture_binary() -> &'static Path {
    static BUILT: OnceLock<PathBuf> = OnceLock::new();
    BUILT.get_or_init(|| {
        let target_dir = Path::new(env!("CARGO_TARGET_TMPDIR")).join("fixture-plugins");
        let status = Command::new(env!("CARGO"))
            .args(["build", "--quiet", "-p", "shadowplug-fixtures", "--target-dir"])
            .arg(&target_dir)
            .current_dir(env!("CARGO_MANIFEST_DIR"))
            .status()
            .unwrap();
        assert!(status.success(), "building shadowplug-fixtures failed");

        target_dir
            .join("debug")
            .join(format!("{DLL_PREFIX}shadowplug_fixtures{DLL_SUFFIX}"))
    })
}

fn native_fixture() -> (TempDir, HostConfig) {
    let temp = tempfile::tempdir().unwrap();
    let config = HostConfig::new()
        .with_base_dir(temp.path())
        .with_reap_policy(RetryPolicy::no_retry());
    std::fs::create_dir_all(config.plugins_path()).unwrap();
    (temp, config)
}

fn deploy_native(config: &HostConfig, stem: &str) -> PathBuf {
    let path = config.plugins_path().join(format!("{stem}.{DLL_EXTENSION}"));
    std::fs::copy(fixture_binary(), &path).unwrap();
    path
}

fn key_of(listing: &RegistryListing, name: &str) -> PluginKey {
    listing
        .plugins
        .iter()
        .find(|p| p.name == name)
        .map(|p| p.key)
        .unwrap()
}

#[tokio::test]
async fn test_native_load_activate_reload_unload() {
    let (_temp, config) = native_fixture();
    deploy_native(&config, "beacons");
    let host = PluginHost::new(config);

    let report = host.start().await.unwrap();
    assert_eq!(report.loaded.len(), 2);
    assert!(report.failures.is_empty());

    let listing = host.list().await;
    assert_eq!(listing.sandboxes.len(), 1);
    assert!(listing.plugins[0].type_name.ends_with("::Beacon"));
    host.activate(key_of(&listing, "Beacon")).await.unwrap();

    let reloaded = host.reload().await.unwrap();
    assert_eq!(reloaded.unload.sandboxes_closed, 1);
    assert!(reloaded.unload.unreclaimed.is_empty());
    assert_eq!(reloaded.restored.len(), 1);

    let listing = host.list().await;
    let beacon = listing.plugins.iter().find(|p| p.name == "Beacon").unwrap();
    assert!(beacon.visible);
    assert_eq!(beacon.key.generation, 2);

    let unloaded = host.unload_all().await.unwrap();
    assert_eq!(unloaded.disposed, 2);
    assert!(unloaded.unreclaimed.is_empty());
    assert_eq!(host.state().await, RegistryState::Empty);

    let reaped = host.reap_pending(3).await;
    assert!(reaped.is_clean());
    assert!(host.pending_reaps().is_empty());
}

#[tokio::test]
async fn test_native_plugin_panics_stay_inside_the_plugin() {
    let (_temp, config) = native_fixture();
    deploy_native(&config, "volatile");
    let host = PluginHost::new(config);
    host.start().await.unwrap();

    let listing = host.list().await;
    let err = host.activate(key_of(&listing, "Bomb")).await.unwrap_err();
    assert!(matches!(
        err,
        HostError::Activate(ActivateError::Panicked { ref message, .. }) if message == "bomb went off"
    ));

    // The host keeps working after the panic
    host.activate(key_of(&listing, "Beacon")).await.unwrap();
    assert_eq!(host.list().await.plugins.len(), 2);

    let unloaded = host.unload_all().await.unwrap();
    assert_eq!(unloaded.disposed, 2);
    assert_eq!(unloaded.dispose_failures, 1);
    assert!(unloaded.unreclaimed.is_empty());
}

#[tokio::test]
async fn test_bundled_dependency_preloaded_and_released_after_plugin() {
    let (_temp, config) = native_fixture();
    let source = deploy_native(&config, "bundled");
    let deps = config.plugins_path().join("bundled.deps");
    std::fs::create_dir_all(&deps).unwrap();
    std::fs::copy(fixture_binary(), deps.join(format!("{DLL_PREFIX}helper{DLL_SUFFIX}"))).unwrap();

    let scratch = tempfile::tempdir().unwrap();
    let staged = scratch.path().join(source.file_name().unwrap());
    std::fs::copy(&source, &staged).unwrap();
    let helper = scratch.path().join(format!("{DLL_PREFIX}helper{DLL_SUFFIX}"));
    std::fs::copy(fixture_binary(), &helper).unwrap();

    let image = NativeLoader::new()
        .load(&staged, &DependencyResolver::new(&staged))
        .unwrap();

    assert_eq!(image.library_count(), 2);
    let released: Vec<&Path> = image.library_paths().collect();
    assert_eq!(released, vec![staged.as_path(), helper.as_path()]);
    assert_eq!(image.type_count(), 2);

    // Same layout through the host: the companion directory is staged too
    let host = PluginHost::new(config);
    let report = host.start().await.unwrap();
    assert_eq!(report.loaded.len(), 2);
    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_discovered_names_outlive_the_sandbox() {
    let scratch = tempfile::tempdir().unwrap();
    let staged = scratch.path().join(format!("names.{DLL_EXTENSION}"));
    std::fs::copy(fixture_binary(), &staged).unwrap();

    let mut sandbox = Sandbox::open(SandboxId(1), &staged);
    sandbox.load(Arc::new(NativeLoader::new())).await.unwrap();
    let names = sandbox.discover();
    let instance = sandbox.instantiate(0).unwrap();
    let type_name = instance.type_name().to_string();

    drop(instance);
    sandbox.close();
    assert_eq!(sandbox.state(), SandboxState::Unloaded);

    assert_eq!(names.len(), 2);
    assert!(names[0].ends_with("::Beacon"));
    assert!(names[1].ends_with("::Bomb"));
    assert_eq!(type_name, names[0]);
}
