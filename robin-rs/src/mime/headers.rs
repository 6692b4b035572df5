//! RFC-822 header block parsing: folding, canonicalization, parameters.

use super::reader::LineReader;
use std::collections::HashMap;

/// One parsed header: canonical value plus its `;`-separated parameters.
#[derive(Debug, Clone)]
pub struct MimeHeader {
    pub name: String,
    pub value: String,
    params: HashMap<String, String>,
}

impl MimeHeader {
    pub fn new(name: &str, value: &str) -> Self {
        let params = parse_params(value);
        Self {
            name: name.to_string(),
            value: value.to_string(),
            params,
        }
    }

    /// The value before the first `;` (e.g. `multipart/mixed` out of a
    /// full Content-Type header).
    pub fn primary_value(&self) -> &str {
        self.value.split(';').next().unwrap_or("").trim()
    }

    /// Parameter lookup, case-insensitive on the key.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(&name.to_lowercase()).map(|s| s.as_str())
    }
}

/// Tokenize `key=value` parameters after the primary value, stripping
/// optional surrounding quotes. Malformed segments are skipped.
fn parse_params(value: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for segment in value.split(';').skip(1) {
        let segment = segment.trim();
        if let Some(eq) = segment.find('=') {
            let key = segment[..eq].trim().to_lowercase();
            if key.is_empty() {
                continue;
            }
            let raw = segment[eq + 1..].trim();
            let stripped = raw.trim_matches('"').trim_matches('\'');
            params.insert(key, stripped.to_string());
        }
    }
    params
}

/// Ordered header collection with case-insensitive lookup.
#[derive(Debug, Clone, Default)]
pub struct MimeHeaders {
    headers: Vec<MimeHeader>,
}

impl MimeHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes header lines from the reader until a blank line (or EOF).
    /// Continuation lines (leading whitespace) are folded into the
    /// preceding value with a single joining space.
    pub fn read_from(reader: &mut LineReader<'_>) -> Self {
        let mut raw_lines: Vec<String> = Vec::new();

        while let Some(line) = reader.read_line() {
            let text = String::from_utf8_lossy(&line);
            let trimmed = text.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                break;
            }
            if (text.starts_with(' ') || text.starts_with('\t')) && !raw_lines.is_empty() {
                let last = raw_lines.last_mut().unwrap();
                last.push(' ');
                last.push_str(trimmed.trim_start());
            } else {
                raw_lines.push(trimmed.to_string());
            }
        }

        let mut headers = Vec::new();
        for raw in raw_lines {
            if let Some(colon) = raw.find(':') {
                let name = raw[..colon].trim();
                let value = raw[colon + 1..].trim_start();
                if !name.is_empty() {
                    headers.push(MimeHeader::new(name, value));
                }
            }
            // Lines without a colon are not headers; drop them.
        }

        Self { headers }
    }

    pub fn get(&self, name: &str) -> Option<&MimeHeader> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.get(name).map(|h| h.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &MimeHeader> {
        self.headers.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }
}
