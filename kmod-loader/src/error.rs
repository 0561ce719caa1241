// Error types for resolving and loading modules

use kmod_depfile::ParseError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("could not find path for module {0:?}")]
    ModuleNotFound(String),

    #[error("could not find dependency {0:?}")]
    MissingDependency(PathBuf),

    #[error("circular dependency! {0:?} already LOADING")]
    CircularDependency(PathBuf),
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("could not get release (uname -r): {0}")]
    KernelRelease(#[source] io::Error),

    #[error("could not open dependency file {path}: {source}")]
    DepFile { path: PathBuf, source: ParseError },

    #[error("could not open builtin file {path}: {source}")]
    Builtin { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("could not load module {path}: {source}")]
    Load { path: PathBuf, source: io::Error },

    #[error("could not remove module {name}: {source}")]
    Remove { name: String, source: io::Error },
}

#[derive(Debug, Error)]
pub enum BootError {
    #[error("no modules found")]
    NoModulesFound,

    #[error("invalid pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        source: glob::PatternError,
    },
}
