//! Rune-aware text helpers.
//!
//! All persisted limits in Strand are measured in runes (Unicode scalar
//! values), never bytes. These helpers always cut on a character boundary.

/// Count runes in a string.
pub fn rune_count(s: &str) -> usize {
    s.chars().count()
}

/// Truncate `s` to at most `max` runes. No suffix is appended.
pub fn truncate_runes(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}

/// Truncate `s` to at most `max` runes, appending `suffix` when anything
/// was cut. The suffix does not count against the limit.
pub fn truncate_runes_with(s: &str, max: usize, suffix: &str) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push_str(suffix);
    out
}

/// Build a short single-line preview: whitespace collapsed, truncated to
/// `max` runes with a trailing ellipsis.
pub fn preview(s: &str, max: usize) -> String {
    let collapsed: String = s.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_runes_with(&collapsed, max, "…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rune_count_multibyte() {
        assert_eq!(rune_count("héllo"), 5);
        assert_eq!(rune_count("日本語"), 3);
    }

    #[test]
    fn truncate_within_limit_is_identity() {
        assert_eq!(truncate_runes("hello", 10), "hello");
        assert_eq!(truncate_runes_with("hello", 5, "…"), "hello");
    }

    #[test]
    fn truncate_counts_runes_not_bytes() {
        // 600 runes of 'é' is 1200 bytes; limit is on runes.
        let s: String = std::iter::repeat('é').take(700).collect();
        let t = truncate_runes(&s, 600);
        assert_eq!(t.chars().count(), 600);
    }

    #[test]
    fn truncate_with_suffix() {
        assert_eq!(truncate_runes_with("abcdef", 3, "[compressed]"), "abc[compressed]");
    }

    #[test]
    fn preview_collapses_whitespace() {
        assert_eq!(preview("a  b\n\nc", 10), "a b c");
        assert_eq!(preview("abcdef", 3), "abc…");
    }
}
