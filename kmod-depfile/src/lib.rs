// kmod-depfile - modules.dep table parser
// Text formats written by depmod(8) and exported by the kernel.

pub mod builtin;
pub mod proc_modules;
pub mod sample;
pub mod table;
pub mod validate;

pub use builtin::parse_builtin;
pub use proc_modules::{parse_proc_modules, pretty, LoadedModule};
pub use sample::MODULES_DOT_DEP;
pub use table::{
    module_name, normalize_name, strip_module_suffix, DepTable, ModuleRecord, ParseError,
};
pub use validate::{validate, validate_with_external, Issue, Report};

/// Suffixes a module file may carry, uncompressed first.
pub const MODULE_SUFFIXES: [&str; 4] = [".ko", ".ko.gz", ".ko.xz", ".ko.zst"];
