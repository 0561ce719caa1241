// Boot-time module loading
//
// Sources, in order:
//   1. module files matching `boot_modules_glob` (/lib/modules/*.ko)
//   2. modules listed in `modules_load_glob` files (/lib/modules-load.d/*.conf)
//   3. the `modules_load=a,b,c` kernel command line flag

use crate::cmdline::CmdLine;
use crate::config::KmodConfig;
use crate::error::{BootError, ProbeError};
use crate::loader::{InitFlags, LinuxLoader, ModuleLoader};
use crate::probe::{ProbeOpts, Prober};
use crate::resolver::DependencyMap;
use anyhow::Context;
use kmod_depfile::{module_name, normalize_name};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

/// Modules never loaded at boot unless the exclusions are replaced
pub const DEFAULT_EXCLUDED: [&str; 2] = ["idpf", "idpf_imc"];

pub struct BootLoader<L> {
    cmdline: CmdLine,
    prober: Prober<L>,
    opts: ProbeOpts,
    excluded: HashSet<String>,
    // Built on first probe and kept up to date as modules load
    deps: Option<DependencyMap>,
}

impl<L: ModuleLoader> BootLoader<L> {
    pub fn new(loader: L, cmdline: CmdLine, opts: ProbeOpts) -> Self {
        Self {
            cmdline,
            prober: Prober::new(loader),
            opts,
            excluded: DEFAULT_EXCLUDED.iter().map(|name| normalize_name(name)).collect(),
            deps: None,
        }
    }

    /// Replace the excluded modules
    pub fn with_excluded<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.excluded = names
            .into_iter()
            .map(|name| normalize_name(name.as_ref()))
            .collect();
        self
    }

    pub fn cmdline(&self) -> &CmdLine {
        &self.cmdline
    }

    pub fn prober(&self) -> &Prober<L> {
        &self.prober
    }

    pub fn into_prober(self) -> Prober<L> {
        self.prober
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        self.excluded.contains(&normalize_name(name))
    }

    /// Probe `name` with the parameters the command line gives it
    pub fn load_module(&mut self, name: &str) -> Result<Vec<PathBuf>, ProbeError> {
        let params = self.cmdline.flags_for_module(name);

        let mut deps = match self.deps.take() {
            Some(deps) => deps,
            None => self.prober.dependency_map(&self.opts)?,
        };
        let result = self
            .prober
            .probe_in(&mut deps, name, &params, self.opts.dry_run);
        self.deps = Some(deps);

        result
    }

    /// Load every module file matching `pattern` directly, without
    /// dependency resolution. Returns how many were loaded.
    pub fn install_from_dir(&mut self, pattern: &str) -> Result<usize, BootError> {
        let files = glob_files(pattern)?;
        if files.is_empty() {
            return Err(BootError::NoModulesFound);
        }

        let mut installed = 0;
        for path in &files {
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let name = module_name(&file_name);

            if self.is_excluded(name) {
                warn!("skipping module {:?}", name);
                continue;
            }

            let params = self.cmdline.flags_for_module(name);
            if self.opts.dry_run {
                info!("would load {}", path.display());
                installed += 1;
                continue;
            }

            match self.prober.insmod(path, &params, InitFlags::empty()) {
                Ok(()) => {
                    debug!("installed {}", path.display());
                    installed += 1;
                }
                Err(e) => warn!("can't install {}: {}", path.display(), e),
            }
        }

        Ok(installed)
    }

    /// Modules named by `modules_load=` on the command line
    pub fn modules_from_cmdline(&self) -> Vec<String> {
        self.cmdline
            .flag("modules_load")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Probe each module that is not excluded. Failures are logged.
    /// Returns how many probes succeeded.
    pub fn install_modules<S: AsRef<str>>(&mut self, names: &[S]) -> usize {
        let mut installed = 0;
        for name in names {
            let name = name.as_ref();
            if self.is_excluded(name) {
                warn!("skipping module {:?}", name);
                continue;
            }
            match self.load_module(name) {
                Ok(_) => installed += 1,
                Err(e) => warn!("can't install {:?}: {}", name, e),
            }
        }
        installed
    }

    /// Run every boot source described by `config`
    pub fn install_all(&mut self, config: &KmodConfig) -> Result<(), BootError> {
        match self.install_from_dir(&config.boot_modules_glob) {
            Ok(count) => info!("installed {} modules from {}", count, config.boot_modules_glob),
            Err(BootError::NoModulesFound) => {
                debug!("no module files match {}", config.boot_modules_glob)
            }
            Err(e) => return Err(e),
        }

        let mut modules = modules_from_conf(&config.modules_load_glob)?;
        modules.extend(self.modules_from_cmdline());

        let installed = self.install_modules(&modules);
        info!("probed {} of {} listed modules", installed, modules.len());
        Ok(())
    }
}

/// Module names listed in the files matching `pattern`, one per line.
/// Blank lines and `#` comments are skipped; unreadable files are logged.
pub fn modules_from_conf(pattern: &str) -> Result<Vec<String>, BootError> {
    let mut modules = Vec::new();

    for path in glob_files(pattern)? {
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) => {
                warn!("can't open {}: {}", path.display(), e);
                continue;
            }
        };

        modules.extend(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(String::from),
        );
    }

    Ok(modules)
}

/// Load boot modules into the running kernel as `config` describes
pub fn install_all_modules(config: &KmodConfig, dry_run: bool) -> anyhow::Result<()> {
    let cmdline = match CmdLine::from_file(&config.cmdline_path) {
        Ok(cmdline) => cmdline,
        Err(e) => {
            warn!("can't read {}: {}", config.cmdline_path.display(), e);
            CmdLine::default()
        }
    };

    let mut opts = config.probe_opts();
    opts.dry_run = dry_run;

    BootLoader::new(LinuxLoader::new(), cmdline, opts)
        .with_excluded(&config.excluded_modules)
        .install_all(config)
        .context("Failed to install boot modules")
}

fn glob_files(pattern: &str) -> Result<Vec<PathBuf>, BootError> {
    let entries = glob::glob(pattern).map_err(|source| BootError::Pattern {
        pattern: pattern.to_string(),
        source,
    })?;

    Ok(entries
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("can't read {}: {}", e.path().display(), e);
                None
            }
        })
        .collect())
}
