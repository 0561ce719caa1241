// Kernel command line (/proc/cmdline)
//
// Module parameters are passed as `module.param=value`; module names on the
// command line may use `-` or `_`.

use kmod_depfile::normalize_name;
use std::fs;
use std::io;
use std::path::Path;

pub const PROC_CMDLINE: &str = "/proc/cmdline";

#[derive(Debug, Clone, Default)]
pub struct CmdLine {
    raw: String,
    entries: Vec<(String, Option<String>)>,
}

impl CmdLine {
    pub fn parse(text: &str) -> Self {
        let entries = split_args(text)
            .into_iter()
            .map(|arg| match arg.split_once('=') {
                Some((key, value)) => (key.to_string(), Some(value.to_string())),
                None => (arg, None),
            })
            .collect();

        Self {
            raw: text.trim().to_string(),
            entries,
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Ok(Self::parse(&fs::read_to_string(path)?))
    }

    /// Command line of the running kernel
    pub fn from_proc() -> io::Result<Self> {
        Self::from_file(PROC_CMDLINE)
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Value of a flag. Bare flags have an empty value; when a flag is
    /// repeated the last one wins.
    pub fn flag(&self, name: &str) -> Option<&str> {
        let wanted = normalize_name(name);
        self.entries
            .iter()
            .rev()
            .find(|(key, _)| normalize_name(key) == wanted)
            .map(|(_, value)| value.as_deref().unwrap_or(""))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.flag(name).is_some()
    }

    /// Parameters for `module` in the form init_module(2) expects:
    /// `param=value` pairs separated by spaces, in command-line order.
    pub fn flags_for_module(&self, module: &str) -> String {
        let wanted = normalize_name(module);
        let mut params = Vec::new();

        for (key, value) in &self.entries {
            let Some((owner, param)) = key.split_once('.') else {
                continue;
            };
            if param.is_empty() || normalize_name(owner) != wanted {
                continue;
            }
            match value {
                Some(value) if value.contains(' ') => params.push(format!("{}=\"{}\"", param, value)),
                Some(value) => params.push(format!("{}={}", param, value)),
                None => params.push(param.to_string()),
            }
        }

        params.join(" ")
    }
}

/// Split on whitespace; double quotes group words and are removed.
fn split_args(text: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_arg = false;

    for c in text.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_arg = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_arg {
                    args.push(std::mem::take(&mut current));
                    has_arg = false;
                }
            }
            c => {
                current.push(c);
                has_arg = true;
            }
        }
    }
    if has_arg {
        args.push(current);
    }

    args
}
