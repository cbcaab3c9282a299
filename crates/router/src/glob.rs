//! Minimal glob matcher for route patterns: `*` matches any run of characters,
//! allowed at the end of a pattern (prefix match) or within the host portion
//! (spec §4.6).

/// Match `input` against `pattern`, returning a specificity score on success.
///
/// The score favours the most specific (longest literal) match: it is the
/// count of non-`*` characters in the pattern, broken on ties by pattern
/// length, so `"host/api/*"` outranks `"host/*"` for an input both match.
pub fn match_glob(pattern: &str, input: &str) -> Option<usize> {
    if glob_matches(pattern.as_bytes(), input.as_bytes()) {
        let literal_chars = pattern.chars().filter(|&c| c != '*').count();
        Some(literal_chars * input.len().max(1) + pattern.len())
    } else {
        None
    }
}

fn glob_matches(pattern: &[u8], input: &[u8]) -> bool {
    match pattern.iter().position(|&b| b == b'*') {
        None => pattern == input,
        Some(star) => {
            let (prefix, rest) = pattern.split_at(star);
            let suffix = &rest[1..];
            if input.len() < prefix.len() || &input[..prefix.len()] != prefix {
                return false;
            }
            let remaining = &input[prefix.len()..];
            // A `*` consumes any amount; try every split point for the next
            // literal/`*` segment rather than assuming `*` is always last.
            if suffix.is_empty() {
                return true;
            }
            for split in 0..=remaining.len() {
                if glob_matches(suffix, &remaining[split..]) {
                    return true;
                }
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_star_is_prefix_match() {
        assert!(match_glob("host/m*", "host/m").is_some());
        assert!(match_glob("host/m*", "host/mounted/more").is_some());
        assert!(match_glob("host/m*", "host/other").is_none());
    }

    #[test]
    fn star_within_host_matches_subdomain() {
        assert!(match_glob("*.example.com/path", "api.example.com/path").is_some());
        assert!(match_glob("*.example.com/path", "example.com/path").is_none());
    }

    #[test]
    fn more_specific_pattern_scores_higher() {
        let broad = match_glob("host/*", "host/api/widgets").unwrap();
        let narrow = match_glob("host/api/*", "host/api/widgets").unwrap();
        assert!(narrow > broad);
    }
}
