//! Module loaders
//!
//! Turn a staged binary into a [`ModuleImage`]: the loaded code plus the table
//! of plugin types it declares. The table never leaves the image: names are
//! handed out as borrows and instances are built through the owning sandbox,
//! so nothing outlives the mapped code.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use libloading::{Library, Symbol};
use shadowplug_sdk::{
    API_VERSION, DECLARATION_SYMBOL, GuardedPlugin, PluginDeclaration, PluginResult, SDK_VERSION,
    TypeDescriptor,
};
use tracing::{debug, info};

use super::resolver::DependencyResolver;
use crate::error::LoadError;

/// One mapped native library
struct LoadedLibrary {
    path: PathBuf,
    library: Library,
}

/// A loaded binary and the plugin types it declares
pub struct ModuleImage {
    path: PathBuf,
    /// Constructors point into `libraries`, so they are dropped first
    types: Vec<TypeDescriptor>,
    /// Plugin binary first, then bundled dependencies in reverse load order
    libraries: Vec<LoadedLibrary>,
}

impl ModuleImage {
    /// Image for types linked into the host process
    pub fn in_process<P: AsRef<Path>>(path: P, types: Vec<TypeDescriptor>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            types,
            libraries: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    /// Declared type names, in declaration order
    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.iter().map(TypeDescriptor::type_name)
    }

    /// Construct the type at `index`; `None` if there is no such type
    pub(crate) fn instantiate(
        &self,
        index: usize,
    ) -> Option<PluginResult<Box<dyn GuardedPlugin>>> {
        self.types.get(index).map(TypeDescriptor::instantiate)
    }

    /// Number of native libraries mapped for this image
    pub fn library_count(&self) -> usize {
        self.libraries.len()
    }

    /// Mapped libraries in the order they are released
    pub fn library_paths(&self) -> impl Iterator<Item = &Path> {
        self.libraries.iter().map(|l| l.path.as_path())
    }
}

impl Drop for ModuleImage {
    fn drop(&mut self) {
        debug!("Unloading module image: {:?}", self.path);
        self.types.clear();
        for loaded in self.libraries.drain(..) {
            debug!("Releasing library {:?}", loaded.path);
            drop(loaded.library);
        }
    }
}

impl std::fmt::Debug for ModuleImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleImage")
            .field("path", &self.path)
            .field("types", &self.types)
            .field("libraries", &self.libraries.len())
            .finish()
    }
}

/// Loads a staged binary inside a sandbox
pub trait ModuleLoader: Send + Sync {
    fn load(&self, path: &Path, resolver: &DependencyResolver) -> Result<ModuleImage, LoadError>;
}

/// Loads real shared libraries with a local symbol scope
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeLoader;

impl NativeLoader {
    pub fn new() -> Self {
        Self
    }

    /// Open a library without leaking its symbols into the global namespace.
    ///
    /// # Safety
    /// Runs the library's initialisers.
    unsafe fn open(path: &Path) -> Result<Library, libloading::Error> {
        #[cfg(unix)]
        {
            use libloading::os::unix::{Library as UnixLibrary, RTLD_LOCAL, RTLD_NOW};
            unsafe { UnixLibrary::open(Some(path), RTLD_NOW | RTLD_LOCAL).map(Into::into) }
        }

        #[cfg(windows)]
        {
            use libloading::os::windows::{
                LOAD_LIBRARY_SEARCH_DEFAULT_DIRS, LOAD_LIBRARY_SEARCH_DLL_LOAD_DIR,
                Library as WindowsLibrary,
            };
            unsafe {
                WindowsLibrary::load_with_flags(
                    path,
                    LOAD_LIBRARY_SEARCH_DLL_LOAD_DIR | LOAD_LIBRARY_SEARCH_DEFAULT_DIRS,
                )
                .map(Into::into)
            }
        }

        #[cfg(not(any(unix, windows)))]
        {
            unsafe { Library::new(path) }
        }
    }

    /// Load the sandbox's bundled dependencies ahead of the plugin binary.
    ///
    /// Bundles may depend on each other, so failed entries are retried while
    /// each pass makes progress.
    fn preload_dependencies(
        &self,
        resolver: &DependencyResolver,
    ) -> Result<Vec<LoadedLibrary>, LoadError> {
        let mut remaining = resolver.bundled()?;
        let mut loaded = Vec::new();
        if !remaining.is_empty() {
            debug!(
                "Preloading {} bundled dependencies from {:?}",
                remaining.len(),
                resolver.root()
            );
        }

        while !remaining.is_empty() {
            let before = remaining.len();
            let mut failed = Vec::new();
            let mut last_error = None;

            for path in remaining.drain(..) {
                match unsafe { Self::open(&path) } {
                    Ok(library) => {
                        debug!("Loaded bundled dependency {:?}", path);
                        loaded.push(LoadedLibrary { path, library });
                    }
                    Err(e) => {
                        last_error = Some(e);
                        failed.push(path);
                    }
                }
            }

            if failed.len() == before {
                let path = failed.swap_remove(0);
                return Err(match last_error {
                    Some(source) => LoadError::Dependency { path, source },
                    None => LoadError::Malformed(path),
                });
            }
            remaining = failed;
        }

        Ok(loaded)
    }
}

impl ModuleLoader for NativeLoader {
    fn load(&self, path: &Path, resolver: &DependencyResolver) -> Result<ModuleImage, LoadError> {
        let dependencies = self.preload_dependencies(resolver)?;

        // SAFETY: Loading a plugin binary runs foreign initialisers; plugins are trusted code.
        let library = unsafe { Self::open(path) }.map_err(|source| LoadError::Library {
            path: path.to_path_buf(),
            source,
        })?;

        let types = {
            // SAFETY: The symbol is the `PluginDeclaration` static emitted by `declare_plugin!`.
            let symbol: Symbol<*const PluginDeclaration> = unsafe { library.get(DECLARATION_SYMBOL) }
                .map_err(|source| LoadError::MissingDeclaration {
                    path: path.to_path_buf(),
                    source,
                })?;
            if symbol.is_null() {
                return Err(LoadError::Malformed(path.to_path_buf()));
            }
            // SAFETY: Non-null and valid for as long as `library` is loaded.
            let declaration = unsafe { &**symbol };

            if declaration.api_version != API_VERSION {
                return Err(LoadError::VersionMismatch {
                    path: path.to_path_buf(),
                    expected: API_VERSION,
                    actual: declaration.api_version,
                });
            }
            if declaration.sdk_version != SDK_VERSION {
                return Err(LoadError::SdkMismatch {
                    path: path.to_path_buf(),
                    host: SDK_VERSION.to_string(),
                    plugin: declaration.sdk_version.to_string(),
                });
            }

            declaration
                .collect()
                .map_err(|e| LoadError::Registration {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })?
        };

        info!(
            "Loaded plugin binary {:?} ({} types, {} bundled dependencies)",
            path,
            types.len(),
            dependencies.len()
        );

        let mut libraries = Vec::with_capacity(dependencies.len() + 1);
        libraries.push(LoadedLibrary {
            path: path.to_path_buf(),
            library,
        });
        libraries.extend(dependencies.into_iter().rev());

        Ok(ModuleImage {
            path: path.to_path_buf(),
            types,
            libraries,
        })
    }
}

/// Serves plugin types linked into the host, keyed by binary file stem.
///
/// Lets an embedding application (or a test) drive the full stage / sandbox /
/// registry pipeline without native binaries. Files with an unknown stem are
/// rejected as malformed.
#[derive(Debug, Default, Clone)]
pub struct InProcessLoader {
    modules: HashMap<String, Vec<TypeDescriptor>>,
}

impl InProcessLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the types served for binaries named `<stem>.<ext>`
    pub fn with_module(mut self, stem: &str, types: Vec<TypeDescriptor>) -> Self {
        self.modules.insert(stem.to_string(), types);
        self
    }
}

impl ModuleLoader for InProcessLoader {
    fn load(&self, path: &Path, _resolver: &DependencyResolver) -> Result<ModuleImage, LoadError> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| LoadError::Malformed(path.to_path_buf()))?;

        self.modules
            .get(stem)
            .map(|types| ModuleImage::in_process(path, types.clone()))
            .ok_or_else(|| LoadError::Malformed(path.to_path_buf()))
    }
}
