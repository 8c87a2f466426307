//! Pattern matcher (C3): exact/wildcard/regex patterns for rules, user-agents
//! and strip lists, compiled once at config load the way the teacher
//! lazy-compiles `NODE_KEY_REGEX` (`config/mod.rs`), never re-compiled per lookup.

use regex::Regex;

/// A single compiled pattern. Syntax is picked by prefix at compile time:
/// `~*re` case-insensitive regex, `~re` case-sensitive regex, any string
/// containing `*` is a wildcard, everything else is a case-insensitive literal.
#[derive(Debug)]
pub enum CompiledPattern {
    Literal(String),
    Wildcard(Vec<String>),
    Regex(Regex),
}

impl CompiledPattern {
    pub fn compile(pattern: &str) -> Self {
        if let Some(rest) = pattern.strip_prefix("~*") {
            return match Regex::new(&format!("(?i){rest}")) {
                Ok(re) => CompiledPattern::Regex(re),
                Err(_) => CompiledPattern::Literal(pattern.to_ascii_lowercase()),
            };
        }
        if let Some(rest) = pattern.strip_prefix('~') {
            return match Regex::new(rest) {
                Ok(re) => CompiledPattern::Regex(re),
                Err(_) => CompiledPattern::Literal(pattern.to_ascii_lowercase()),
            };
        }
        if pattern.contains('*') {
            let parts = pattern.split('*').map(str::to_ascii_lowercase).collect();
            return CompiledPattern::Wildcard(parts);
        }
        CompiledPattern::Literal(pattern.to_ascii_lowercase())
    }

    pub fn is_match(&self, text: &str) -> bool {
        match self {
            CompiledPattern::Literal(lit) => lit == &text.to_ascii_lowercase(),
            CompiledPattern::Wildcard(parts) => wildcard_match(parts, &text.to_ascii_lowercase()),
            CompiledPattern::Regex(re) => re.is_match(text),
        }
    }
}

/// `parts` are the `*`-split, lowercased segments of the original pattern.
/// `text` must start with `parts[0]`, end with `parts[last]`, and contain the
/// remaining parts in order in between.
fn wildcard_match(parts: &[String], text: &str) -> bool {
    if parts.len() == 1 {
        return parts[0] == text;
    }

    let first = &parts[0];
    let last = &parts[parts.len() - 1];

    if !text.starts_with(first.as_str()) || !text.ends_with(last.as_str()) {
        return false;
    }

    let mut cursor = first.len();
    let end = text.len() - last.len();
    if cursor > end {
        return false;
    }
    let middle = &text[cursor..end];

    let mut pos = 0;
    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match middle[pos..].find(part.as_str()) {
            Some(idx) => pos += idx + part.len(),
            None => return false,
        }
    }
    cursor += pos;
    let _ = cursor;
    true
}

/// A set of compiled patterns evaluated with "any matches" semantics, keeping
/// the source strings beside the compiled forms for config re-serialization.
#[derive(Debug, Default)]
pub struct PatternSet {
    pub source: Vec<String>,
    compiled: Vec<CompiledPattern>,
}

impl PatternSet {
    pub fn compile(patterns: &[String]) -> Self {
        Self {
            source: patterns.to_vec(),
            compiled: patterns.iter().map(|p| CompiledPattern::compile(p)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.compiled.iter().any(|p| p.is_match(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_is_case_insensitive() {
        let p = CompiledPattern::compile("Mozilla");
        assert!(p.is_match("mozilla"));
        assert!(!p.is_match("chrome"));
    }

    #[test]
    fn wildcard_matches_prefix_suffix_and_middle() {
        let p = CompiledPattern::compile("utm_*");
        assert!(p.is_match("utm_source"));
        assert!(!p.is_match("xutm_source"));

        let p2 = CompiledPattern::compile("*bot*");
        assert!(p2.is_match("Googlebot/2.1"));
        assert!(!p2.is_match("Mozilla/5.0"));

        let p3 = CompiledPattern::compile("a*b*c");
        assert!(p3.is_match("axxbyyc"));
        assert!(!p3.is_match("axxcyyb"));
    }

    #[test]
    fn regex_prefixes() {
        let ci = CompiledPattern::compile("~*^/blog/.*$");
        assert!(ci.is_match("/Blog/post-1"));

        let cs = CompiledPattern::compile("~^/blog/.*$");
        assert!(cs.is_match("/blog/post-1"));
        assert!(!cs.is_match("/Blog/post-1"));
    }

    #[test]
    fn pattern_set_any_match() {
        let set = PatternSet::compile(&["utm_*".to_string(), "gclid".to_string()]);
        assert!(set.is_match("utm_campaign"));
        assert!(set.is_match("gclid"));
        assert!(!set.is_match("id"));
    }
}
