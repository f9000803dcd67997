//! Slash-delimited namespace URIs and wildcard pattern matching.
//!
//! Concrete URIs contain no wildcards. Pattern URIs may contain `+` (matches
//! exactly one segment) and `*` (matches any suffix of segments). Matching
//! is a small walk over path segments; no regex engine.

/// Strip leading/trailing slashes so that equal paths compare equal.
pub fn clean(uri: &str) -> &str {
    uri.trim_matches('/')
}

/// True if the URI contains a wildcard segment.
pub fn is_pattern(uri: &str) -> bool {
    clean(uri)
        .split('/')
        .any(|seg| seg == "+" || seg == "*")
}

/// Match a concrete URI against a pattern URI.
///
/// `+` consumes one segment, `*` consumes the remaining suffix (possibly
/// empty). A concrete pattern matches only itself.
pub fn matches(pattern: &str, uri: &str) -> bool {
    let mut pat = clean(pattern).split('/');
    let mut path = clean(uri).split('/').peekable();
    loop {
        match pat.next() {
            None => return path.peek().is_none(),
            Some("*") => return true,
            Some("+") => {
                if path.next().is_none() {
                    return false;
                }
            }
            Some(seg) => {
                if path.next() != Some(seg) {
                    return false;
                }
            }
        }
    }
}

/// All segment-prefixes of a concrete URI, shortest first, including the
/// URI itself: `a/b/c` yields `a`, `a/b`, `a/b/c`.
pub fn prefixes(uri: &str) -> Vec<String> {
    let cleaned = clean(uri);
    let mut out = Vec::new();
    let mut acc = String::new();
    for seg in cleaned.split('/') {
        if !acc.is_empty() {
            acc.push('/');
        }
        acc.push_str(seg);
        out.push(acc.clone());
    }
    out
}

/// True iff `prefix` is a segment-prefix of (or equal to) `uri`.
pub fn is_prefix_of(prefix: &str, uri: &str) -> bool {
    let prefix = clean(prefix);
    let uri = clean(uri);
    match uri.strip_prefix(prefix) {
        Some("") => true,
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concrete_pattern_matches_itself_only() {
        assert!(matches("a/b/c", "a/b/c"));
        assert!(!matches("a/b/c", "a/b"));
        assert!(!matches("a/b/c", "a/b/c/d"));
        assert!(!matches("a/b/c", "a/b/x"));
    }

    #[test]
    fn plus_matches_exactly_one_segment() {
        assert!(matches("scratch/+/temp", "scratch/r1/temp"));
        assert!(!matches("scratch/+/temp", "scratch/temp"));
        assert!(!matches("scratch/+/temp", "scratch/r1/r2/temp"));
    }

    #[test]
    fn star_matches_any_suffix() {
        assert!(matches("scratch/*", "scratch/r1/temp"));
        assert!(matches("scratch/*", "scratch"));
        assert!(matches("*", "anything/at/all"));
        assert!(!matches("scratch/*", "other/r1"));
    }

    #[test]
    fn prefix_enumeration() {
        assert_eq!(
            prefixes("scratch/r1/temp"),
            vec!["scratch", "scratch/r1", "scratch/r1/temp"]
        );
    }

    #[test]
    fn segment_prefix_check() {
        assert!(is_prefix_of("scratch", "scratch/r1/temp"));
        assert!(is_prefix_of("scratch/r1/temp", "scratch/r1/temp"));
        assert!(!is_prefix_of("scratch/r", "scratch/r1/temp"));
        assert!(!is_prefix_of("scratch/r2", "scratch/r1/temp"));
    }

    #[test]
    fn pattern_detection() {
        assert!(is_pattern("scratch/+/temp"));
        assert!(is_pattern("scratch/*"));
        assert!(!is_pattern("scratch/r1/temp"));
    }
}
