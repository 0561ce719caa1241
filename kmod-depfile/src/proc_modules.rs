// /proc/modules: modules currently loaded in the running kernel
//
// Each line reads `name size refcount users state address [taint]`, where
// `users` is a comma-terminated list or `-` when nothing uses the module.

use std::io::{self, Write};

/// One line of /proc/modules
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModule {
    pub name: String,
    pub size: Option<u64>,
    pub refcount: Option<u32>,
    pub used_by: Vec<String>,
    pub state: Option<String>,
    pub address: Option<String>,
}

impl LoadedModule {
    /// Parse one line; `None` for a blank line. Only the name is required.
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let name = fields.next()?.to_string();
        let size = fields.next().and_then(|s| s.parse().ok());
        let refcount = fields.next().and_then(|s| s.parse().ok());
        let used_by = match fields.next() {
            Some("-") | None => Vec::new(),
            Some(list) => list
                .split(',')
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect(),
        };
        let state = fields.next().map(str::to_string);
        let address = fields.next().map(str::to_string);

        Some(Self {
            name,
            size,
            refcount,
            used_by,
            state,
            address,
        })
    }
}

/// Parse /proc/modules text, skipping blank lines
pub fn parse_proc_modules(text: &str) -> Vec<LoadedModule> {
    text.lines().filter_map(LoadedModule::parse_line).collect()
}

/// Write /proc/modules text as an lsmod-style table.
///
/// Lines with fewer than four fields are reported in place as malformed
/// (numbered from 0) instead of aborting the listing.
pub fn pretty<W: Write>(w: &mut W, text: &str) -> io::Result<()> {
    let mut rows: Vec<Vec<String>> = vec![vec![
        "Module".to_string(),
        "Size".to_string(),
        "Used by".to_string(),
    ]];

    for (i, line) in text.split('\n').enumerate() {
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [name, size, refcount, users, ..] => rows.push(vec![
                name.to_string(),
                size.to_string(),
                refcount.to_string(),
                users.to_string(),
            ]),
            _ => rows.push(vec![format!("Line {} is malformed: {:?}", i, line)]),
        }
    }

    // A row's last cell never widens its column.
    let mut widths: Vec<usize> = Vec::new();
    for row in &rows {
        for (col, cell) in row.iter().enumerate().take(row.len().saturating_sub(1)) {
            if widths.len() <= col {
                widths.push(0);
            }
            if let Some(width) = widths.get_mut(col) {
                *width = (*width).max(cell.len());
            }
        }
    }

    for row in &rows {
        let last = row.len().saturating_sub(1);
        for (col, cell) in row.iter().enumerate() {
            if col == last {
                write!(w, "{}", cell)?;
            } else {
                let width = widths.get(col).copied().unwrap_or(0);
                write!(w, "{:<width$}  ", cell, width = width)?;
            }
        }
        writeln!(w)?;
    }

    w.flush()
}
