//! Parsing of credential lists supplied through env vars or key files

use crate::Secret;

/// Split a raw credential list into individual secrets.
///
/// Accepts comma- or newline-separated values. Blank entries and lines
/// starting with `#` are skipped; surrounding whitespace is trimmed.
pub fn parse_key_list(raw: &str) -> Vec<Secret<String>> {
    raw.split(['\n', ','])
        .map(str::trim)
        .filter(|entry| !entry.is_empty() && !entry.starts_with('#'))
        .map(Secret::from)
        .collect()
}
