// modules.builtin: modules compiled into the kernel image, one path per line

/// Parse modules.builtin text into module paths (relative to the module dir)
pub fn parse_builtin(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}
