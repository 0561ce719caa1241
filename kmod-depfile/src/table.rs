// Dependency table (modules.dep)
//
// One record per line: `<module-path>: <dep> <dep> ...`. A bare trailing
// colon means the module has no dependencies.

use log::debug;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use thiserror::Error;

use crate::MODULE_SUFFIXES;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("line {line}: missing ':' after module path")]
    MissingColon { line: usize },

    #[error("line {line}: empty module path")]
    EmptyKey { line: usize },

    #[error("line {line}: stray ':' in dependency {token:?}")]
    StrayColon { line: usize, token: String },

    #[error("line {line}: duplicate module {path:?} (first listed on line {first_line})")]
    DuplicateModule {
        line: usize,
        path: String,
        first_line: usize,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A single module and its direct dependencies, in link order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRecord {
    pub path: String,
    pub deps: Vec<String>,
}

impl ModuleRecord {
    pub fn new(path: impl Into<String>, deps: Vec<String>) -> Self {
        Self {
            path: path.into(),
            deps,
        }
    }

    /// Parse one non-blank line. `line` is only used for error reporting.
    pub fn parse_line(text: &str, line: usize) -> Result<Self, ParseError> {
        let (key, values) = text
            .split_once(':')
            .ok_or(ParseError::MissingColon { line })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(ParseError::EmptyKey { line });
        }

        let mut deps = Vec::new();
        for token in values.split_whitespace() {
            if token.contains(':') {
                return Err(ParseError::StrayColon {
                    line,
                    token: token.to_string(),
                });
            }
            deps.push(token.to_string());
        }

        Ok(Self {
            path: key.to_string(),
            deps,
        })
    }

    /// Module name derived from the file name (`kernel/fs/xfs/xfs.ko` -> `xfs`)
    pub fn name(&self) -> &str {
        module_name(&self.path)
    }
}

impl fmt::Display for ModuleRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:", self.path)?;
        for dep in &self.deps {
            write!(f, " {}", dep)?;
        }
        Ok(())
    }
}

/// Parsed modules.dep contents. Records keep their input order.
#[derive(Debug, Clone, Default)]
pub struct DepTable {
    records: Vec<ModuleRecord>,
    index: HashMap<String, usize>,
}

impl DepTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse modules.dep text
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let mut builder = TableBuilder::default();
        for (i, line) in text.lines().enumerate() {
            builder.push_line(line, i + 1)?;
        }
        Ok(builder.table)
    }

    /// Parse modules.dep from any buffered reader
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, ParseError> {
        let mut builder = TableBuilder::default();
        for (i, line) in reader.lines().enumerate() {
            builder.push_line(&line?, i + 1)?;
        }
        Ok(builder.table)
    }

    /// Read and parse a modules.dep file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ParseError> {
        let file = File::open(&path)?;
        let table = Self::from_reader(BufReader::new(file))?;
        debug!("{}: {} modules", path.as_ref().display(), table.len());
        Ok(table)
    }

    pub fn get(&self, path: &str) -> Option<&ModuleRecord> {
        self.index.get(path).and_then(|&i| self.records.get(i))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.index.contains_key(path)
    }

    /// Direct dependencies of `path`, or `None` if it is not in the table
    pub fn dependencies(&self, path: &str) -> Option<&[String]> {
        self.get(path).map(|r| r.deps.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Every (module, dependency) pair whose dependency has no record of its own
    pub fn unresolved(&self) -> Vec<(&str, &str)> {
        self.records
            .iter()
            .flat_map(|r| {
                r.deps
                    .iter()
                    .filter(|d| !self.contains(d))
                    .map(move |d| (r.path.as_str(), d.as_str()))
            })
            .collect()
    }

    /// Find a module by name, treating `-` and `_` as equivalent.
    ///
    /// Only paths ending in one of the known module suffixes match. When
    /// several paths share a name the first one in table order wins, which
    /// is the order depmod writes search-path priorities in.
    pub fn find_by_name(&self, name: &str) -> Option<&ModuleRecord> {
        let wanted = normalize_name(name);
        self.records.iter().find(|r| {
            strip_module_suffix(&r.path)
                .map(|n| normalize_name(n) == wanted)
                .unwrap_or(false)
        })
    }
}

impl fmt::Display for DepTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for record in &self.records {
            writeln!(f, "{}", record)?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct TableBuilder {
    table: DepTable,
    first_lines: Vec<usize>,
}

impl TableBuilder {
    fn push_line(&mut self, text: &str, line: usize) -> Result<(), ParseError> {
        if text.trim().is_empty() {
            return Ok(());
        }

        let record = ModuleRecord::parse_line(text, line)?;
        if let Some(&existing) = self.table.index.get(&record.path) {
            return Err(ParseError::DuplicateModule {
                line,
                path: record.path,
                first_line: self.first_lines.get(existing).copied().unwrap_or(0),
            });
        }

        self.table
            .index
            .insert(record.path.clone(), self.table.records.len());
        self.table.records.push(record);
        self.first_lines.push(line);
        Ok(())
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// File name of `path` without its module suffix, or `None` when the file
/// name does not end in one of [`MODULE_SUFFIXES`].
pub fn strip_module_suffix(path: &str) -> Option<&str> {
    let base = base_name(path);
    // Longest suffixes first so `.ko.gz` is not mistaken for a bare name.
    MODULE_SUFFIXES
        .iter()
        .rev()
        .find_map(|suffix| base.strip_suffix(suffix))
}

/// Module name of a path: the file name without its module suffix.
pub fn module_name(path: &str) -> &str {
    strip_module_suffix(path).unwrap_or_else(|| base_name(path))
}

/// Kernel module names use `-` and `_` interchangeably; `_` is canonical.
pub fn normalize_name(name: &str) -> String {
    name.replace('-', "_")
}
