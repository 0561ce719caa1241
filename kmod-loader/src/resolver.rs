// Dependency resolver: which modules to load, and in what order

use crate::error::ResolveError;
use kmod_depfile::{normalize_name, strip_module_suffix, DepTable, LoadedModule};
use log::{debug, warn};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Load state of a module as far as the resolver knows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModState {
    Unloaded,
    /// On the current resolution path
    Loading,
    Loaded,
    Builtin,
}

#[derive(Debug, Clone)]
pub struct Dependency {
    pub state: ModState,
    pub deps: Vec<PathBuf>,
}

/// Module path -> state and direct dependencies, with paths made absolute
/// against the module directory.
#[derive(Debug, Default)]
pub struct DependencyMap {
    modules: HashMap<PathBuf, Dependency>,
    names: HashMap<String, PathBuf>,
}

impl DependencyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the map from a parsed modules.dep living in `module_dir`
    pub fn from_table(table: &DepTable, module_dir: &Path) -> Self {
        let mut map = Self::new();
        for record in table.iter() {
            let deps = record
                .deps
                .iter()
                .map(|d| join_module_path(module_dir, d))
                .collect();
            map.insert(join_module_path(module_dir, &record.path), deps);
        }
        debug!(
            "dependency map: {} modules under {}",
            map.len(),
            module_dir.display()
        );
        map
    }

    /// Add a module. An existing entry keeps its state but takes the new deps.
    pub fn insert(&mut self, path: PathBuf, deps: Vec<PathBuf>) {
        self.index_name(&path);
        match self.modules.entry(path) {
            Entry::Occupied(mut e) => e.get_mut().deps = deps,
            Entry::Vacant(e) => {
                e.insert(Dependency {
                    state: ModState::Unloaded,
                    deps,
                });
            }
        }
    }

    /// Mark modules.builtin entries (relative to `module_dir`) as built in
    pub fn mark_builtin<S: AsRef<str>>(&mut self, module_dir: &Path, paths: &[S]) {
        for path in paths {
            let path = join_module_path(module_dir, path.as_ref());
            self.index_name(&path);
            self.modules
                .entry(path)
                .or_insert(Dependency {
                    state: ModState::Unloaded,
                    deps: Vec::new(),
                })
                .state = ModState::Builtin;
        }
    }

    /// Mark modules listed in /proc/modules as loaded. Returns how many were
    /// matched; names without a known path are skipped.
    pub fn mark_loaded(&mut self, loaded: &[LoadedModule]) -> usize {
        let mut matched = 0;
        for module in loaded {
            let path = match self.find_path(&module.name) {
                Ok(path) => path.to_path_buf(),
                Err(_) => {
                    warn!("loaded module {} has no path in modules.dep", module.name);
                    continue;
                }
            };
            if self.set_state(&path, ModState::Loaded) {
                matched += 1;
            }
        }
        matched
    }

    /// Find a module's path by name. `-` and `_` are interchangeable.
    pub fn find_path(&self, name: &str) -> Result<&Path, ResolveError> {
        self.names
            .get(&normalize_name(name))
            .map(PathBuf::as_path)
            .ok_or_else(|| ResolveError::ModuleNotFound(name.to_string()))
    }

    pub fn get(&self, path: &Path) -> Option<&Dependency> {
        self.modules.get(path)
    }

    pub fn state(&self, path: &Path) -> Option<ModState> {
        self.modules.get(path).map(|d| d.state)
    }

    /// Returns false if `path` is not in the map
    pub fn set_state(&mut self, path: &Path, state: ModState) -> bool {
        match self.modules.get_mut(path) {
            Some(dep) => {
                dep.state = state;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Modules that must be loaded for `target`, dependencies first and the
    /// target last.
    ///
    /// Loaded and built-in modules are left out together with everything
    /// beneath them. Each module appears once. On error every state is put
    /// back the way it was.
    pub fn load_order(&mut self, target: &Path) -> Result<Vec<PathBuf>, ResolveError> {
        let mut walk = Walk::default();
        let result = self.visit(target, &mut walk);

        for path in &walk.stack {
            self.set_state(path, ModState::Unloaded);
        }

        result.map(|()| walk.order)
    }

    fn visit(&mut self, path: &Path, walk: &mut Walk) -> Result<(), ResolveError> {
        if walk.planned.contains(path) {
            return Ok(());
        }

        let dep = self
            .modules
            .get_mut(path)
            .ok_or_else(|| ResolveError::MissingDependency(path.to_path_buf()))?;

        match dep.state {
            ModState::Loaded | ModState::Builtin => return Ok(()),
            ModState::Loading => return Err(ResolveError::CircularDependency(path.to_path_buf())),
            ModState::Unloaded => {}
        }

        dep.state = ModState::Loading;
        let deps = dep.deps.clone();
        walk.stack.push(path.to_path_buf());

        for d in &deps {
            self.visit(d, walk)?;
        }

        walk.stack.pop();
        self.set_state(path, ModState::Unloaded);
        walk.planned.insert(path.to_path_buf());
        walk.order.push(path.to_path_buf());
        Ok(())
    }

    /// Index `path` under its module name, using the same suffix rules as
    /// [`DepTable::find_by_name`]. The first path indexed for a name wins.
    fn index_name(&mut self, path: &Path) {
        let Some(name) = path.to_str().and_then(strip_module_suffix) else {
            return;
        };
        self.names
            .entry(normalize_name(name))
            .or_insert_with(|| path.to_path_buf());
    }
}

#[derive(Default)]
struct Walk {
    order: Vec<PathBuf>,
    planned: HashSet<PathBuf>,
    stack: Vec<PathBuf>,
}

/// Join a modules.dep entry onto the module directory. Leading slashes are
/// dropped so entries never escape `module_dir`.
fn join_module_path(module_dir: &Path, entry: &str) -> PathBuf {
    module_dir.join(entry.trim().trim_start_matches('/'))
}
