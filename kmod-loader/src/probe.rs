// Probing: load a module by name together with everything it depends on

use crate::error::ProbeError;
use crate::loader::{DeleteFlags, InitFlags, LinuxLoader, ModuleLoader};
use crate::resolver::{DependencyMap, ModState};
use kmod_depfile::{module_name, normalize_name, parse_builtin, parse_proc_modules, DepTable};
use log::{debug, info, warn};
use std::ffi::CStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Loaded modules as reported by the kernel
pub const PROC_MODULES: &str = "/proc/modules";

/// Module trees, relative to the root directory, in search order
pub const MODULE_DIRS: [&str; 2] = ["lib/modules", "usr/lib/modules"];

/// Options for a probe. The default describes the running system.
#[derive(Debug, Clone)]
pub struct ProbeOpts {
    /// Root the module tree is looked up under
    pub root_dir: PathBuf,
    /// Kernel release; `uname -r` when unset
    pub kernel_release: Option<String>,
    /// Do not consult /proc/modules for already loaded modules
    pub ignore_proc_modules: bool,
    pub proc_modules: PathBuf,
    /// Resolve only; nothing is loaded
    pub dry_run: bool,
}

impl Default for ProbeOpts {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/"),
            kernel_release: None,
            ignore_proc_modules: false,
            proc_modules: PathBuf::from(PROC_MODULES),
            dry_run: false,
        }
    }
}

impl ProbeOpts {
    pub fn release(&self) -> Result<String, ProbeError> {
        match &self.kernel_release {
            Some(release) => Ok(release.trim().to_string()),
            None => kernel_release().map_err(ProbeError::KernelRelease),
        }
    }

    /// Module directory these options point at
    pub fn module_dir(&self) -> Result<PathBuf, ProbeError> {
        Ok(module_dir(&self.root_dir, &self.release()?))
    }
}

/// Release of the running kernel (`uname -r`)
pub fn kernel_release() -> io::Result<String> {
    // SAFETY: utsname is plain old data and uname(2) fills it in.
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: the kernel NUL-terminates every utsname field.
    let release = unsafe { CStr::from_ptr(uts.release.as_ptr()) };
    Ok(release.to_string_lossy().trim().to_string())
}

/// First existing `<root>/<dir>/<release>` of [`MODULE_DIRS`], or the last
/// candidate when none exists.
pub fn module_dir(root: &Path, release: &str) -> PathBuf {
    let mut dir = PathBuf::new();
    for base in MODULE_DIRS {
        dir = root.join(base).join(release.trim());
        if dir.exists() {
            break;
        }
    }
    dir
}

/// Resolves dependencies and drives a [`ModuleLoader`]
pub struct Prober<L> {
    loader: L,
}

impl<L: ModuleLoader> Prober<L> {
    pub fn new(loader: L) -> Self {
        Self { loader }
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn loader_mut(&mut self) -> &mut L {
        &mut self.loader
    }

    pub fn into_inner(self) -> L {
        self.loader
    }

    /// Build the dependency map from modules.dep, modules.builtin and
    /// /proc/modules. Only modules.dep is required.
    pub fn dependency_map(&self, opts: &ProbeOpts) -> Result<DependencyMap, ProbeError> {
        let dir = opts.module_dir()?;

        let dep_path = dir.join("modules.dep");
        let table = DepTable::from_file(&dep_path).map_err(|source| ProbeError::DepFile {
            path: dep_path.clone(),
            source,
        })?;
        let mut deps = DependencyMap::from_table(&table, &dir);

        let builtin_path = dir.join("modules.builtin");
        match fs::read_to_string(&builtin_path) {
            Ok(text) => deps.mark_builtin(&dir, &parse_builtin(&text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no {}", builtin_path.display());
            }
            Err(source) => {
                return Err(ProbeError::Builtin {
                    path: builtin_path,
                    source,
                })
            }
        }

        if !opts.ignore_proc_modules {
            match fs::read_to_string(&opts.proc_modules) {
                Ok(text) => {
                    let loaded = deps.mark_loaded(&parse_proc_modules(&text));
                    debug!("{} modules already loaded", loaded);
                }
                Err(e) => debug!("skipping {}: {}", opts.proc_modules.display(), e),
            }
        }

        Ok(deps)
    }

    /// Load `name` and its dependencies. Returns the modules acted upon in
    /// load order; empty if the module is already loaded or built in.
    pub fn probe(
        &mut self,
        name: &str,
        params: &str,
        opts: &ProbeOpts,
    ) -> Result<Vec<PathBuf>, ProbeError> {
        let mut deps = self.dependency_map(opts)?;
        self.probe_in(&mut deps, name, params, opts.dry_run)
    }

    /// Like [`Prober::probe`] against an existing map, which is updated as
    /// modules load so it can be reused for further probes.
    pub fn probe_in(
        &mut self,
        deps: &mut DependencyMap,
        name: &str,
        params: &str,
        dry_run: bool,
    ) -> Result<Vec<PathBuf>, ProbeError> {
        let target = deps.find_path(name)?.to_path_buf();
        let order = deps.load_order(&target)?;

        if order.is_empty() {
            info!("{} is already loaded or built in", name);
            return Ok(order);
        }

        if dry_run {
            for module in &order {
                info!("would load {}", module.display());
            }
            return Ok(order);
        }

        for (loaded, module) in order.iter().enumerate() {
            // Dependencies load without parameters.
            let module_params = if *module == target { params } else { "" };

            match self.loader.file_init(module, module_params, InitFlags::empty()) {
                Ok(()) => debug!("loaded {}", module.display()),
                Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                    debug!("{} already present", module.display())
                }
                Err(source) => {
                    if loaded > 0 {
                        warn!(
                            "{} of {} modules for {} stay loaded after failure",
                            loaded,
                            order.len(),
                            name
                        );
                    }
                    return Err(ProbeError::Load {
                        path: module.clone(),
                        source,
                    });
                }
            }
            deps.set_state(module, ModState::Loaded);
        }

        info!("loaded {} ({} modules)", name, order.len());
        Ok(order)
    }

    /// Load a single module file, without dependency resolution
    pub fn insmod(&mut self, path: &Path, params: &str, flags: InitFlags) -> Result<(), ProbeError> {
        self.loader
            .file_init(path, params, flags)
            .map_err(|source| ProbeError::Load {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Unload a module. Accepts a module name or a path to its file.
    pub fn rmmod(&mut self, name: &str, flags: DeleteFlags) -> Result<(), ProbeError> {
        let name = normalize_name(module_name(name));
        self.loader
            .delete(&name, flags)
            .map_err(|source| ProbeError::Remove { name, source })
    }
}

/// Load `name` and its dependencies into the running kernel
pub fn probe(name: &str, params: &str) -> Result<Vec<PathBuf>, ProbeError> {
    Prober::new(LinuxLoader::new()).probe(name, params, &ProbeOpts::default())
}
