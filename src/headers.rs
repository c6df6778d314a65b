// HTTP header sets for distributed-trace propagation
//
// A header set is an ordered multiset of (name, value) pairs. Order and
// duplicate names are preserved because the transport sends header lines
// exactly as given and resolves conflicts itself.
//
// Wire format of a single line: "Name: value"
// Example: "x-datadog-parent-id: 42"

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Header that carries the active span id to the downstream service
pub const PARENT_ID_HEADER: &str = "x-datadog-parent-id";

/// Ordered sequence of HTTP header pairs, duplicates allowed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeaderSet {
    entries: Vec<(String, String)>,
}

impl HeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Append a header after all existing entries
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Append every entry of `other`, in order
    pub fn extend_from(&mut self, other: &HeaderSet) {
        self.entries.extend(other.entries.iter().cloned());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// All values for `name`, compared case-insensitively, in insertion order
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Render as wire lines ("Name: value")
    pub fn to_lines(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(name, value)| format!("{}: {}", name, value))
            .collect()
    }

    /// Parse wire lines into a header set, stopping at the first bad line
    pub fn from_lines<I, S>(lines: I) -> Result<Self, HeaderError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = HeaderSet::new();
        for line in lines {
            let (name, value) = parse_line(line.as_ref())?;
            set.entries.push((name, value));
        }
        Ok(set)
    }
}

impl<K, V> FromIterator<(K, V)> for HeaderSet
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        }
    }
}

impl fmt::Display for HeaderSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, line) in self.to_lines().iter().enumerate() {
            if i > 0 {
                f.write_str("\r\n")?;
            }
            f.write_str(line)?;
        }
        Ok(())
    }
}

/// Build the parent-id header for the given span
///
/// The value is the span id as an unsigned 64-bit decimal integer.
pub fn parent_id_header(name: &str, span_id: u64) -> (String, String) {
    (name.to_string(), span_id.to_string())
}

/// Parse a single "Name: value" header line
///
/// Whitespace around the value is trimmed; the name must be a valid
/// HTTP token (RFC 7230 section 3.2.6).
pub fn parse_line(line: &str) -> Result<(String, String), HeaderError> {
    let (name, value) = line.split_once(':').ok_or(HeaderError::MissingSeparator)?;

    if name.is_empty() {
        return Err(HeaderError::EmptyName);
    }
    if !is_valid_header_name(name) {
        return Err(HeaderError::InvalidName(name.to_string()));
    }

    Ok((name.to_string(), value.trim().to_string()))
}

/// Check that `name` is a non-empty HTTP token
pub fn is_valid_header_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(is_token_byte)
}

/// Header line parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    /// Line has no ':' separating name and value
    #[error("Invalid header line (expected: Name: value)")]
    MissingSeparator,
    /// Nothing before the ':' separator
    #[error("Header name cannot be empty")]
    EmptyName,
    /// Name contains characters outside the HTTP token set
    #[error("Invalid header name {0:?} (must be an HTTP token)")]
    InvalidName(String),
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'^'
                | b'_'
                | b'`'
                | b'|'
                | b'~'
        )
}
