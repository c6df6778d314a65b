//! Per-handle cache of user-supplied HTTP headers
//!
//! The HTTP client library only accepts the header list as a whole: setting
//! the header option replaces whatever was set before. To add trace headers
//! at execute time without discarding the application's own headers, the
//! headers the application sets are copied here, keyed by handle id, and
//! merged back in when the request is sent.
//!
//! Entries follow the handle lifecycle:
//!
//! ```text
//!   create     ──► stale entry for a reused id evicted
//!   configure  ──► entry stored (deep copy)
//!   duplicate  ──► entry deep-copied under the new id
//!   execute    ──► entry read, merged with trace headers
//!   destroy    ──► entry evicted
//! ```

use fnv::FnvHashMap;
use tracing::trace;

use crate::headers::{parent_id_header, HeaderSet};

/// Header sets keyed by client handle id
#[derive(Debug, Clone, Default)]
pub struct HeaderPropagationCache {
    entries: FnvHashMap<i64, HeaderSet>,
}

impl HeaderPropagationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a private copy of `headers` for `handle`
    ///
    /// Replaces any previous entry, mirroring how the client treats a
    /// repeated header option.
    pub fn store(&mut self, handle: i64, headers: &HeaderSet) {
        trace!(handle, count = headers.len(), "caching user headers");
        self.entries.insert(handle, headers.clone());
    }

    pub fn get(&self, handle: i64) -> Option<&HeaderSet> {
        self.entries.get(&handle)
    }

    pub fn contains(&self, handle: i64) -> bool {
        self.entries.contains_key(&handle)
    }

    /// Drop the entry for `handle`, returning it if there was one
    pub fn evict(&mut self, handle: i64) -> Option<HeaderSet> {
        let evicted = self.entries.remove(&handle);
        if evicted.is_some() {
            trace!(handle, "evicted cached headers");
        }
        evicted
    }

    /// Copy the entry of `from` to `to`
    ///
    /// The copy is independent: later changes to either handle do not
    /// affect the other. Returns `false` if `from` has no entry, in which
    /// case `to` is left untouched.
    pub fn duplicate(&mut self, from: i64, to: i64) -> bool {
        match self.entries.get(&from).cloned() {
            Some(headers) => {
                trace!(from, to, "copying cached headers to duplicated handle");
                self.entries.insert(to, headers);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Header set to send for `handle`, merged with `tracing` headers
    pub fn build_injected(
        &self,
        handle: i64,
        tracing: &HeaderSet,
        parent_header: &str,
        span_id: u64,
    ) -> HeaderSet {
        compose(tracing, self.get(handle), parent_header, span_id)
    }
}

/// Merge trace headers, user headers and the parent-id header
///
/// Order is fixed: every tracing header verbatim, then every user header,
/// then exactly one parent-id header. Nothing is de-duplicated.
///
/// # Example
/// ```
/// use tracehook::header_cache::compose;
/// use tracehook::headers::HeaderSet;
///
/// let tracing: HeaderSet = [("X-Trace-Id", "7")].into_iter().collect();
/// let user: HeaderSet = [("X-A", "1")].into_iter().collect();
///
/// let merged = compose(&tracing, Some(&user), "x-datadog-parent-id", 42);
/// assert_eq!(
///     merged.to_lines(),
///     vec!["X-Trace-Id: 7", "X-A: 1", "x-datadog-parent-id: 42"]
/// );
/// ```
pub fn compose(
    tracing: &HeaderSet,
    user: Option<&HeaderSet>,
    parent_header: &str,
    span_id: u64,
) -> HeaderSet {
    let user_len = user.map_or(0, HeaderSet::len);
    let mut merged = HeaderSet::with_capacity(tracing.len() + user_len + 1);
    merged.extend_from(tracing);
    if let Some(user) = user {
        merged.extend_from(user);
    }
    let (name, value) = parent_id_header(parent_header, span_id);
    merged.push(name, value);
    merged
}
