use serde::{Deserialize, Serialize};

/// One (URL, payload) pair to test against the substitution tool.
///
/// A `WorkItem` is immutable once enumerated. Its `identity` is the key used
/// for deduplication within a run and for resume across runs: two items with
/// the same URL and payload always carry the same identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub url: String,
    pub payload: String,
    pub identity: String,
}

impl WorkItem {
    /// Builds a `WorkItem`, computing its identity from the URL and payload.
    pub fn new(url: impl Into<String>, payload: impl Into<String>) -> Self {
        let url = url.into();
        let payload = payload.into();
        let identity = identity_of(&url, &payload);
        Self {
            url,
            payload,
            identity,
        }
    }

    /// Host portion of the target URL, used for per-domain grouping in the
    /// aggregated summary. Falls back to the full URL string when it does not
    /// parse (enumeration normally rejects such URLs before they get here).
    pub fn domain(&self) -> String {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| self.url.clone())
    }
}

/// Stable identity hash for a (URL, payload) pair.
///
/// The two fields are separated by a NUL byte so that the pairs
/// `("a", "bc")` and `("ab", "c")` cannot collide by concatenation.
pub fn identity_of(url: &str, payload: &str) -> String {
    let mut bytes = Vec::with_capacity(url.len() + payload.len() + 1);
    bytes.extend_from_slice(url.as_bytes());
    bytes.push(0);
    bytes.extend_from_slice(payload.as_bytes());
    format!("{:x}", md5::compute(&bytes))
}
