//! A line-level view of the ini-structured configuration text.
//!
//! The reader is deliberately forgiving: unknown keys and sections
//! pass through as data for the caller to ignore, malformed lines
//! read as blank.

/// One classified line.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Line<'a> {
    /// `[name]`
    Section(&'a str),
    /// `key=value`, both sides trimmed.
    Pair(&'a str, &'a str),
    /// Empty, comment, or unparseable.
    Blank,
}

/// Classify a single line.
pub fn parse_line(line: &str) -> Line<'_> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
        return Line::Blank;
    }
    if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
        return Line::Section(name.trim());
    }
    match line.split_once('=') {
        Some((key, value)) => Line::Pair(key.trim(), value.trim()),
        None => Line::Blank,
    }
}

/// Classify every line of a document.
pub fn lines(text: &str) -> impl Iterator<Item = Line<'_>> {
    text.lines().map(parse_line)
}
