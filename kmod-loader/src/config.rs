// Configuration (kmod.json)

use crate::probe::{ProbeOpts, PROC_MODULES};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Path of the configuration file, overriding the system location
pub const CONFIG_ENV: &str = "KMOD_CONFIG";
/// Root directory override
pub const ROOT_ENV: &str = "KMOD_ROOT";
pub const SYSTEM_CONFIG: &str = "/etc/kmod.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KmodConfig {
    /// Root the module tree lives under
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Kernel release to use instead of `uname -r`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_release: Option<String>,

    #[serde(default = "default_proc_modules")]
    pub proc_modules: PathBuf,

    #[serde(default)]
    pub ignore_proc_modules: bool,

    /// Modules never loaded at boot
    #[serde(default = "default_excluded_modules")]
    pub excluded_modules: Vec<String>,

    /// Module files loaded directly at boot
    #[serde(default = "default_boot_modules_glob")]
    pub boot_modules_glob: String,

    /// modules-load.d files listing modules to probe at boot
    #[serde(default = "default_modules_load_glob")]
    pub modules_load_glob: String,

    #[serde(default = "default_cmdline_path")]
    pub cmdline_path: PathBuf,
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("/")
}
fn default_proc_modules() -> PathBuf {
    PathBuf::from(PROC_MODULES)
}
fn default_excluded_modules() -> Vec<String> {
    vec!["idpf".to_string(), "idpf_imc".to_string()]
}
fn default_boot_modules_glob() -> String {
    "/lib/modules/*.ko".to_string()
}
fn default_modules_load_glob() -> String {
    "/lib/modules-load.d/*.conf".to_string()
}
fn default_cmdline_path() -> PathBuf {
    PathBuf::from(crate::cmdline::PROC_CMDLINE)
}

impl Default for KmodConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            kernel_release: None,
            proc_modules: default_proc_modules(),
            ignore_proc_modules: false,
            excluded_modules: default_excluded_modules(),
            boot_modules_glob: default_boot_modules_glob(),
            modules_load_glob: default_modules_load_glob(),
            cmdline_path: default_cmdline_path(),
        }
    }
}

impl KmodConfig {
    /// Load configuration from a kmod.json file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;

        Self::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.as_ref().display()))
    }

    /// Parse configuration from a JSON string
    pub fn from_str(content: &str) -> Result<Self> {
        let config: KmodConfig =
            serde_json::from_str(content).context("Invalid kmod configuration")?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize configuration")?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write {}", path.as_ref().display()))?;
        Ok(())
    }

    /// Example configuration file with every default spelled out
    pub fn example() -> String {
        serde_json::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    /// Load configuration from `explicit`, else `$KMOD_CONFIG`, else
    /// /etc/kmod.json, else defaults. `$KMOD_ROOT` overrides the root.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        Self::load_from(
            explicit,
            env::var_os(CONFIG_ENV).map(PathBuf::from),
            env::var_os(ROOT_ENV).map(PathBuf::from),
            Path::new(SYSTEM_CONFIG),
        )
    }

    fn load_from(
        explicit: Option<&Path>,
        from_env: Option<PathBuf>,
        root_override: Option<PathBuf>,
        system: &Path,
    ) -> Result<Self> {
        let mut config = if let Some(path) = explicit {
            Self::from_file(path)?
        } else if let Some(path) = from_env {
            Self::from_file(path)?
        } else if system.exists() {
            Self::from_file(system)?
        } else {
            Self::default()
        };

        if let Some(root) = root_override {
            config.root_dir = root;
        }

        Ok(config)
    }

    /// Probe options described by this configuration
    pub fn probe_opts(&self) -> ProbeOpts {
        ProbeOpts {
            root_dir: self.root_dir.clone(),
            kernel_release: self.kernel_release.clone(),
            ignore_proc_modules: self.ignore_proc_modules,
            proc_modules: self.proc_modules.clone(),
            dry_run: false,
        }
    }
}
