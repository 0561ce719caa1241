//! Sample dependency table.
//!
//! A `modules.dep` snapshot from an x86_64 distribution kernel, trimmed to a
//! few hundred records. Every dependency it names is itself a record, so it
//! doubles as a fixture for the resolver.

/// Contents of `testdata/modules.dep`
pub const MODULES_DOT_DEP: &str = include_str!("../testdata/modules.dep");
