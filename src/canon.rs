//! URL canonicalizer (C2): normalize a requested URL into a stable canonical
//! form and hash it. Built on `url::Url`, which already implements most of
//! the WHATWG normalization rules (scheme/host lowercasing, default-port
//! stripping, dot-segment resolution) this component needs.

use url::Url;
use xxhash_rust::xxh64::xxh64;

use crate::error::GatewayError;
use crate::pattern::PatternSet;

/// Result of `normalize`: the canonical URL string, the tracking-param keys
/// that were stripped (for logging), and whether anything was modified.
pub struct Canonicalized {
    pub canonical: String,
    pub stripped: Vec<String>,
    pub modified: bool,
}

/// Normalize `raw` per §4.1. `strip_patterns` matches query-parameter *keys*,
/// case-insensitively, and is applied before the remaining pairs are sorted.
pub fn normalize(raw: &str, strip_patterns: &PatternSet) -> Result<Canonicalized, GatewayError> {
    let original = raw.trim();
    if original.is_empty() {
        return Err(GatewayError::InvalidRequest("empty url".to_string()));
    }

    let with_scheme = if original.contains("://") {
        original.to_string()
    } else {
        format!("https://{original}")
    };

    let mut url = Url::parse(&with_scheme)
        .map_err(|e| GatewayError::InvalidRequest(format!("unparseable url: {e}")))?;

    let host = url
        .host_str()
        .ok_or_else(|| GatewayError::InvalidRequest("url has no host".to_string()))?;
    if host != "localhost" && !host.contains('.') {
        return Err(GatewayError::InvalidRequest(format!(
            "host '{host}' has no dot and is not localhost"
        )));
    }

    url.set_fragment(None);

    let collapsed_path = collapse_slashes(url.path());
    if collapsed_path != url.path() {
        url.set_path(&collapsed_path);
    }

    let mut modified = raw != url.as_str();
    let mut stripped = Vec::new();

    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if !pairs.is_empty() {
        let mut kept: Vec<(String, String)> = Vec::with_capacity(pairs.len());
        for (k, v) in pairs {
            if strip_patterns.is_match(&k) {
                stripped.push(k);
                modified = true;
            } else {
                kept.push((k, v));
            }
        }

        let original_order = kept.clone();
        kept.sort_by(|a, b| a.cmp(b));
        if kept != original_order {
            modified = true;
        }

        if kept.is_empty() {
            url.set_query(None);
        } else {
            let mut serializer = url::form_urlencoded::Serializer::new(String::new());
            for (k, v) in &kept {
                serializer.append_pair(k, v);
            }
            url.set_query(Some(&serializer.finish()));
        }
    }

    Ok(Canonicalized {
        canonical: url.to_string(),
        stripped,
        modified,
    })
}

/// Collapse runs of `/` in a path down to one, keeping a leading slash.
fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut last_was_slash = false;
    for c in path.chars() {
        if c == '/' {
            if last_was_slash {
                continue;
            }
            last_was_slash = true;
        } else {
            last_was_slash = false;
        }
        out.push(c);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// 64-bit XXHash of the canonical string, rendered as 16 lowercase hex digits.
pub fn hash(canonical: &str) -> String {
    format!("{:016x}", xxh64(canonical.as_bytes(), 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_strip() -> PatternSet {
        PatternSet::compile(&[])
    }

    #[test]
    fn adds_default_scheme() {
        let c = normalize("example.com/a", &no_strip()).unwrap();
        assert!(c.canonical.starts_with("https://example.com"));
    }

    #[test]
    fn rejects_host_without_dot() {
        assert!(normalize("http://nodothost/a", &no_strip()).is_err());
        assert!(normalize("http://localhost/a", &no_strip()).is_ok());
    }

    #[test]
    fn lowercases_scheme_and_host_and_strips_default_port() {
        let c = normalize("HTTPS://Example.COM:443/Path", &no_strip()).unwrap();
        assert_eq!(c.canonical, "https://example.com/Path");
    }

    #[test]
    fn collapses_double_slashes_and_resolves_dot_segments() {
        let c = normalize("https://example.com/a//b/../c", &no_strip()).unwrap();
        assert_eq!(c.canonical, "https://example.com/a/c");
    }

    #[test]
    fn drops_fragment_and_sorts_query() {
        let c = normalize("https://example.com/p?b=2&a=1#frag", &no_strip()).unwrap();
        assert_eq!(c.canonical, "https://example.com/p?a=1&b=2");
    }

    #[test]
    fn strips_tracking_params_before_sort() {
        let strip = PatternSet::compile(&["utm_*".to_string()]);
        let c1 = normalize("https://ex.com/p?utm_source=g&id=1", &strip).unwrap();
        let c2 = normalize("https://ex.com/p?id=1", &strip).unwrap();
        assert_eq!(c1.canonical, c2.canonical);
        assert_eq!(c1.stripped, vec!["utm_source".to_string()]);
        assert_eq!(hash(&c1.canonical), hash(&c2.canonical));
    }

    #[test]
    fn normalize_is_idempotent() {
        let c1 = normalize("HTTP://Example.com:80//a/./b?z=1&a=2", &no_strip()).unwrap();
        let c2 = normalize(&c1.canonical, &no_strip()).unwrap();
        assert_eq!(c1.canonical, c2.canonical);
    }

    #[test]
    fn hash_is_16_hex_chars() {
        let h = hash("https://example.com/");
        assert_eq!(h.len(), 16);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
