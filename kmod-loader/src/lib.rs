// kmod-loader - kernel module dependency resolution and loading
//
// Resolver: modules.dep + modules.builtin + /proc/modules -> load order
// Loader:   init_module(2) / finit_module(2) / delete_module(2)

pub mod boot;
pub mod cmdline;
pub mod config;
pub mod decompress;
pub mod error;
pub mod loader;
pub mod probe;
pub mod resolver;

pub use boot::{install_all_modules, modules_from_conf, BootLoader};
pub use cmdline::CmdLine;
pub use config::KmodConfig;
pub use decompress::{decompress, Compression};
pub use error::{BootError, ProbeError, ResolveError};
pub use loader::{DeleteFlags, InitFlags, LinuxLoader, ModuleLoader};
pub use probe::{kernel_release, module_dir, probe, ProbeOpts, Prober};
pub use resolver::{Dependency, DependencyMap, ModState};
