// Integrity checks for modules.dep text
//
// Unlike `DepTable::parse`, validation keeps going after a bad line so a
// single run reports every problem in the file.

use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::OnceLock;

const CANONICAL_LINE: &str =
    r"^\S+\.ko(\.(gz|xz|zst))?:( \S+\.ko(\.(gz|xz|zst))?)*$";

static CANONICAL: OnceLock<Regex> = OnceLock::new();

// CANONICAL_LINE is a constant covered by the tests below; it cannot fail
// to compile at runtime.
#[allow(clippy::expect_used)]
fn canonical_line() -> &'static Regex {
    CANONICAL.get_or_init(|| Regex::new(CANONICAL_LINE).expect("canonical line pattern compiles"))
}

/// A single integrity problem. Line numbers are 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Issue {
    /// Line is not in canonical `path.ko: dep.ko dep.ko` form
    Malformed { line: usize, text: String },
    /// Module path listed more than once
    Duplicate {
        line: usize,
        path: String,
        first_line: usize,
    },
    /// Dependency that is not itself listed as a module
    Unresolved {
        line: usize,
        path: String,
        dependency: String,
    },
}

impl Issue {
    pub fn line(&self) -> usize {
        match self {
            Issue::Malformed { line, .. }
            | Issue::Duplicate { line, .. }
            | Issue::Unresolved { line, .. } => *line,
        }
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Issue::Malformed { line, text } => write!(f, "line {}: malformed record {:?}", line, text),
            Issue::Duplicate {
                line,
                path,
                first_line,
            } => write!(
                f,
                "line {}: duplicate module {} (first listed on line {})",
                line, path, first_line
            ),
            Issue::Unresolved {
                line,
                path,
                dependency,
            } => write!(
                f,
                "line {}: {} depends on {}, which is not listed",
                line, path, dependency
            ),
        }
    }
}

/// Outcome of validating a table
#[derive(Debug, Clone, Default)]
pub struct Report {
    /// Non-blank lines examined
    pub lines: usize,
    /// Distinct module paths seen
    pub modules: usize,
    pub issues: Vec<Issue>,
}

impl Report {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Check format, key uniqueness and dependency closure
pub fn validate(text: &str) -> Report {
    validate_with_external(text, &[])
}

/// Like [`validate`], but dependencies listed in `external` are known to
/// live outside this table and are not reported as unresolved.
pub fn validate_with_external(text: &str, external: &[&str]) -> Report {
    let pattern = canonical_line();
    let external: HashSet<&str> = external.iter().copied().collect();

    let mut report = Report::default();
    let mut first_seen: HashMap<&str, usize> = HashMap::new();
    let mut pending: Vec<(usize, &str, &str)> = Vec::new();

    for (i, raw) in text.lines().enumerate() {
        let line = i + 1;
        if raw.trim().is_empty() {
            continue;
        }
        report.lines += 1;

        if !pattern.is_match(raw) {
            report.issues.push(Issue::Malformed {
                line,
                text: raw.to_string(),
            });
        }

        let Some((key, values)) = raw.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }

        if let Some(&first_line) = first_seen.get(key) {
            report.issues.push(Issue::Duplicate {
                line,
                path: key.to_string(),
                first_line,
            });
        } else {
            first_seen.insert(key, line);
        }

        for dep in values.split_whitespace() {
            pending.push((line, key, dep));
        }
    }

    for (line, key, dep) in pending {
        if !first_seen.contains_key(dep) && !external.contains(dep) {
            report.issues.push(Issue::Unresolved {
                line,
                path: key.to_string(),
                dependency: dep.to_string(),
            });
        }
    }

    report.modules = first_seen.len();
    report.issues.sort_by_key(Issue::line);
    report
}
