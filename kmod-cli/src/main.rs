use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use kmod_depfile::{pretty, validate_with_external, Issue, MODULES_DOT_DEP};
use kmod_loader::{
    install_all_modules, DeleteFlags, InitFlags, KmodConfig, LinuxLoader, ProbeOpts, Prober,
};
use std::fs;
use std::io;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "kmod")]
#[command(version)]
#[command(about = "Linux kernel module dependency tool", long_about = None)]
struct Cli {
    /// Configuration file (default: $KMOD_CONFIG, then /etc/kmod.json)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Where to find the module tree
#[derive(Args)]
struct TreeArgs {
    /// Root directory holding lib/modules
    #[arg(long, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Kernel release (default: uname -r)
    #[arg(long, value_name = "RELEASE")]
    kver: Option<String>,

    /// Do not skip modules listed in /proc/modules
    #[arg(long)]
    ignore_proc_modules: bool,
}

impl TreeArgs {
    fn apply(self, config: &mut KmodConfig) {
        if let Some(root) = self.root {
            config.root_dir = root;
        }
        if self.kver.is_some() {
            config.kernel_release = self.kver;
        }
        if self.ignore_proc_modules {
            config.ignore_proc_modules = true;
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Load a module and its dependencies
    Probe {
        /// Module name
        #[arg(value_name = "MODULE")]
        name: String,

        /// Module parameters (param=value ...)
        #[arg(value_name = "PARAMS", trailing_var_arg = true)]
        params: Vec<String>,

        /// Show what would be loaded without loading anything
        #[arg(short = 'n', long)]
        dry_run: bool,

        #[command(flatten)]
        tree: TreeArgs,
    },

    /// Print the load order of a module
    Deps {
        /// Module name
        #[arg(value_name = "MODULE")]
        name: String,

        #[command(flatten)]
        tree: TreeArgs,
    },

    /// Load a single module file
    Insmod {
        /// Module file (.ko, .ko.gz, .ko.xz, .ko.zst)
        #[arg(value_name = "FILE")]
        path: PathBuf,

        /// Module parameters (param=value ...)
        #[arg(value_name = "PARAMS", trailing_var_arg = true)]
        params: Vec<String>,

        /// Ignore symbol version hashes
        #[arg(long)]
        force_modversion: bool,

        /// Ignore the kernel version magic
        #[arg(long)]
        force_vermagic: bool,
    },

    /// Unload a module
    Rmmod {
        /// Module name
        #[arg(value_name = "MODULE")]
        name: String,

        /// Remove even if the module is in use
        #[arg(short, long)]
        force: bool,
    },

    /// List loaded modules
    Lsmod {
        /// Read this file instead of /proc/modules
        #[arg(long, value_name = "FILE")]
        proc_modules: Option<PathBuf>,
    },

    /// Check a modules.dep file for malformed, duplicate and dangling records
    Check {
        /// modules.dep file
        #[arg(value_name = "FILE", required_unless_present = "sample")]
        file: Option<PathBuf>,

        /// Check the bundled sample table
        #[arg(long, conflicts_with = "file")]
        sample: bool,

        /// Dependencies provided outside the table
        #[arg(long, value_name = "PATH")]
        external: Vec<String>,
    },

    /// Load boot modules (module directory, modules-load.d, modules_load=)
    LoadAll {
        /// Show what would be loaded without loading anything
        #[arg(short = 'n', long)]
        dry_run: bool,

        #[command(flatten)]
        tree: TreeArgs,
    },

    /// Print an example configuration file
    Config,
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let mut config = KmodConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Probe {
            name,
            params,
            dry_run,
            tree,
        } => {
            tree.apply(&mut config);
            let opts = ProbeOpts {
                dry_run,
                ..config.probe_opts()
            };

            let mut prober = Prober::new(LinuxLoader::new());
            let order = prober.probe(&name, &params.join(" "), &opts)?;

            if order.is_empty() {
                println!("{} is already loaded", name);
            }
            for path in &order {
                let verb = if dry_run { "would load" } else { "loaded" };
                println!("{} {}", verb, path.display());
            }
            Ok(())
        }

        Commands::Deps { name, tree } => {
            tree.apply(&mut config);
            let opts = config.probe_opts();

            let prober = Prober::new(LinuxLoader::new());
            let mut deps = prober.dependency_map(&opts)?;
            let target = deps.find_path(&name)?.to_path_buf();

            for path in deps.load_order(&target)? {
                println!("{}", path.display());
            }
            Ok(())
        }

        Commands::Insmod {
            path,
            params,
            force_modversion,
            force_vermagic,
        } => {
            let mut flags = InitFlags::empty();
            if force_modversion {
                flags = flags | InitFlags::IGNORE_MODVERSIONS;
            }
            if force_vermagic {
                flags = flags | InitFlags::IGNORE_VERMAGIC;
            }

            Prober::new(LinuxLoader::new()).insmod(&path, &params.join(" "), flags)?;
            println!("✅ Loaded {}", path.display());
            Ok(())
        }

        Commands::Rmmod { name, force } => {
            let mut flags = DeleteFlags::NONBLOCK;
            if force {
                flags = flags | DeleteFlags::TRUNC;
            }

            Prober::new(LinuxLoader::new()).rmmod(&name, flags)?;
            println!("✅ Removed {}", name);
            Ok(())
        }

        Commands::Lsmod { proc_modules } => {
            let path = proc_modules.unwrap_or(config.proc_modules);
            let text = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;

            pretty(&mut io::stdout().lock(), &text)?;
            Ok(())
        }

        Commands::Check {
            file,
            sample: _,
            external,
        } => {
            let (source, text) = match file {
                Some(path) => {
                    let text = fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    (path.display().to_string(), text)
                }
                None => ("sample modules.dep".to_string(), MODULES_DOT_DEP.to_string()),
            };

            let external: Vec<&str> = external.iter().map(String::as_str).collect();
            let report = validate_with_external(&text, &external);

            println!("🔍 Checking: {}", source);
            for issue in &report.issues {
                let label = match issue {
                    Issue::Malformed { .. } | Issue::Duplicate { .. } => "error".red().bold(),
                    Issue::Unresolved { .. } => "warning".yellow().bold(),
                };
                println!("{}: {}", label, issue);
            }

            if report.is_clean() {
                println!(
                    "✅ {} modules in {} lines, no issues",
                    report.modules, report.lines
                );
                Ok(())
            } else {
                anyhow::bail!("{} issues in {}", report.issues.len(), source)
            }
        }

        Commands::LoadAll { dry_run, tree } => {
            tree.apply(&mut config);
            install_all_modules(&config, dry_run)?;
            Ok(())
        }

        Commands::Config => {
            println!("{}", KmodConfig::example());
            Ok(())
        }
    }
}
