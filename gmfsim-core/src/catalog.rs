//! Module catalog - parsed definitions keyed by path.
//!
//! A catalog opened on a directory indexes every `*.json` file below it.
//! The key of a file is its path relative to the root without the
//! extension, with `/` separators, so `medications/otc_antihistamine.json`
//! is the submodule `medications/otc_antihistamine`. Files are parsed on
//! first use and shared as `Arc<ModuleDefinition>` afterwards.

use crate::definition::ModuleDefinition;
use crate::error::CoreError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Lazily populated set of module definitions.
#[derive(Default)]
pub struct ModuleCatalog {
    /// Directory the catalog was opened on.
    root: Option<PathBuf>,

    /// Known files by key.
    paths: BTreeMap<String, PathBuf>,

    /// Parsed definitions by key.
    modules: DashMap<String, Arc<ModuleDefinition>>,
}

impl ModuleCatalog {
    /// Creates an empty catalog; definitions are added with [`put_module`](Self::put_module).
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes every module file below `root` without parsing any of them.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, CoreError> {
        let root = root.as_ref().to_path_buf();
        let mut paths = BTreeMap::new();
        index_dir(&root, &root, &mut paths)?;
        debug!("Indexed {} module files under {}", paths.len(), root.display());

        Ok(Self {
            root: Some(root),
            paths,
            modules: DashMap::new(),
        })
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Returns the definition for `key`, parsing its file on first use.
    pub fn get(&self, key: &str) -> Result<Arc<ModuleDefinition>, CoreError> {
        if let Some(module) = self.modules.get(key) {
            return Ok(module.clone());
        }
        let path = self.paths.get(key).ok_or_else(|| CoreError::ModuleNotFound {
            module: key.to_string(),
        })?;

        // the shard lock is held while parsing so each file is read once
        match self.modules.entry(key.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let bytes = fs::read(path).map_err(|source| CoreError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                let module = Arc::new(ModuleDefinition::from_slice(key, &bytes)?);
                for warning in module.validate() {
                    warn!("Module '{}': {}", key, warning);
                }
                debug!(
                    "Loaded module '{}' ({} states, checksum {})",
                    key,
                    module.len(),
                    module.checksum
                );
                entry.insert(module.clone());
                Ok(module)
            }
        }
    }

    /// Adds a parsed definition.
    ///
    /// Adding a definition with the same checksum as the loaded one is a
    /// no-op; different content under an existing key is a conflict.
    pub fn put_module(&self, module: ModuleDefinition) -> Result<Arc<ModuleDefinition>, CoreError> {
        match self.modules.entry(module.key.clone()) {
            Entry::Occupied(entry) => {
                if entry.get().checksum == module.checksum {
                    Ok(entry.get().clone())
                } else {
                    Err(CoreError::ModuleConflict { module: module.key })
                }
            }
            Entry::Vacant(entry) => {
                let module = Arc::new(module);
                entry.insert(module.clone());
                Ok(module)
            }
        }
    }

    /// Parses every indexed file and checks that each referenced submodule
    /// exists. Returns the top-level modules in key order.
    pub fn load_all(&self) -> Result<Vec<Arc<ModuleDefinition>>, CoreError> {
        let mut top_level = Vec::new();
        for key in self.keys() {
            let module = self.get(&key)?;
            for submodule in module.submodule_references() {
                if !self.contains(submodule) {
                    return Err(CoreError::invalid(
                        &key,
                        format!("submodule '{}' does not exist", submodule),
                    ));
                }
            }
            if !module.submodule {
                top_level.push(module);
            }
        }
        Ok(top_level)
    }

    /// Returns whether `key` is indexed or loaded.
    pub fn contains(&self, key: &str) -> bool {
        self.paths.contains_key(key) || self.modules.contains_key(key)
    }

    /// All known keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.paths.keys().cloned().collect();
        for entry in self.modules.iter() {
            if !self.paths.contains_key(entry.key()) {
                keys.push(entry.key().clone());
            }
        }
        keys.sort();
        keys
    }

    /// Keys of the modules that run on their own, sorted.
    pub fn top_level(&self) -> Vec<String> {
        self.keys().into_iter().filter(|k| !k.contains('/')).collect()
    }

    /// Number of parsed definitions.
    pub fn loaded(&self) -> usize {
        self.modules.len()
    }
}

fn index_dir(
    root: &Path,
    dir: &Path,
    paths: &mut BTreeMap<String, PathBuf>,
) -> Result<(), CoreError> {
    let io_err = |source| CoreError::Io {
        path: dir.display().to_string(),
        source,
    };
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.is_dir() {
            index_dir(root, &path, paths)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
            if let Some(key) = module_key(root, &path) {
                paths.insert(key, path);
            }
        }
    }
    Ok(())
}

/// `root/a/b.json` -> `a/b`.
fn module_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?.with_extension("");
    let parts: Vec<&str> = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<_>>()?;
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn module(name: &str, submodule: Option<&str>) -> serde_json::Value {
        let mut states = json!({
            "Initial": {"type": "Initial", "direct_transition": "Terminal"},
            "Terminal": {"type": "Terminal"}
        });
        if let Some(key) = submodule {
            states["Initial"]["direct_transition"] = json!("Call");
            states["Call"] = json!({"type": "CallSubmodule", "submodule": key, "direct_transition": "Terminal"});
        }
        json!({"name": name, "states": states})
    }

    fn write(dir: &Path, relative: &str, value: &serde_json::Value) {
        let path = dir.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, serde_json::to_vec_pretty(value).unwrap()).unwrap();
    }

    fn tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "asthma.json", &module("Asthma", Some("medications/inhaler")));
        write(dir.path(), "medications/inhaler.json", &module("Inhaler", None));
        write(dir.path(), "notes.txt", &json!("ignored"));
        dir
    }

    #[test]
    fn test_open_indexes_keys() {
        let dir = tree();
        let catalog = ModuleCatalog::open(dir.path()).unwrap();
        assert_eq!(catalog.keys(), vec!["asthma", "medications/inhaler"]);
        assert_eq!(catalog.top_level(), vec!["asthma"]);
        assert_eq!(catalog.loaded(), 0);
    }

    #[test]
    fn test_lazy_load_once() {
        let dir = tree();
        let catalog = ModuleCatalog::open(dir.path()).unwrap();
        let first = catalog.get("medications/inhaler").unwrap();
        assert!(first.submodule);
        assert_eq!(catalog.loaded(), 1);

        // later reads are served from memory even if the file goes away
        fs::remove_file(dir.path().join("medications/inhaler.json")).unwrap();
        let second = catalog.get("medications/inhaler").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_unknown_key() {
        let catalog = ModuleCatalog::new();
        assert!(matches!(
            catalog.get("nope"),
            Err(CoreError::ModuleNotFound { .. })
        ));
    }

    #[test]
    fn test_invalid_file_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "broken.json",
            &json!({"name": "Broken", "states": {"Initial": {"type": "Initial", "direct_transition": "Gone"}}}),
        );
        let catalog = ModuleCatalog::open(dir.path()).unwrap();
        let err = catalog.get("broken").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_load_all_checks_submodules() {
        let dir = tree();
        let catalog = ModuleCatalog::open(dir.path()).unwrap();
        let top = catalog.load_all().unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].name, "Asthma");
        assert_eq!(catalog.loaded(), 2);

        let dir = TempDir::new().unwrap();
        write(dir.path(), "asthma.json", &module("Asthma", Some("medications/missing")));
        let catalog = ModuleCatalog::open(dir.path()).unwrap();
        assert!(matches!(
            catalog.load_all(),
            Err(CoreError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn test_put_module_idempotent() {
        let catalog = ModuleCatalog::new();
        let json = module("Asthma", None);
        let a = catalog
            .put_module(ModuleDefinition::from_json("asthma", &json).unwrap())
            .unwrap();
        let b = catalog
            .put_module(ModuleDefinition::from_json("asthma", &json).unwrap())
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let other = module("Asthma v2", None);
        let err = catalog
            .put_module(ModuleDefinition::from_json("asthma", &other).unwrap())
            .unwrap_err();
        assert!(matches!(err, CoreError::ModuleConflict { .. }));
    }
}
