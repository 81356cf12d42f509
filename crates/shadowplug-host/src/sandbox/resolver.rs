//! Per-sandbox dependency resolution
//!
//! A plugin's own dependency binaries live next to its staged copy and are
//! preloaded from there before the plugin itself, so a plugin may ship its own
//! versions of shared libraries.

use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct DependencyResolver {
    root: PathBuf,
    module: PathBuf,
}

impl DependencyResolver {
    /// Resolver rooted at the directory containing `module`
    pub fn new(module: &Path) -> Self {
        let root = module
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            root,
            module: module.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sibling binaries shipped alongside the module, sorted by file name
    pub fn bundled(&self) -> io::Result<Vec<PathBuf>> {
        let extension = self.module.extension();
        let mut bundled = Vec::new();

        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path == self.module || !path.is_file() {
                continue;
            }
            if path.extension() == extension {
                bundled.push(path);
            }
        }

        bundled.sort();
        Ok(bundled)
    }
}
