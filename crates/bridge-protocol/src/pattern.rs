use crate::error::CodecError;
use regex::Regex;

/// Compile a subscription/query pattern into an anchored regex.
///
/// `*` matches exactly one path segment (no `.`); `**` matches zero or more
/// segments; `.` is literal; every other regex metacharacter in the input is
/// escaped and matched literally (`spec.md` §4.2). Compilation happens once
/// per subscription — the hot dispatch path only ever calls `is_match`.
pub fn compile_pattern(pattern: &str) -> Result<Regex, CodecError> {
    let mut out = String::with_capacity(pattern.len() * 2 + 2);
    out.push('^');
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    let mut literal = String::new();
    let flush_literal = |out: &mut String, literal: &mut String| {
        if !literal.is_empty() {
            out.push_str(&regex::escape(literal));
            literal.clear();
        }
    };
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                flush_literal(&mut out, &mut literal);
                // A `.` right before `**` was just emitted as a required
                // separator by the previous iteration's `'.' =>` arm. Pull it
                // back out and fold it into the optional group so `**` can
                // still collapse to zero segments (no dangling separator).
                if out.ends_with("\\.") {
                    out.truncate(out.len() - 2);
                    out.push_str("(?:\\..*)?");
                } else {
                    out.push_str(".*");
                }
                i += 2;
            }
            '*' => {
                flush_literal(&mut out, &mut literal);
                out.push_str("[^.]+");
                i += 1;
            }
            '.' => {
                flush_literal(&mut out, &mut literal);
                out.push_str("\\.");
                i += 1;
            }
            c => {
                literal.push(c);
                i += 1;
            }
        }
    }
    flush_literal(&mut out, &mut literal);
    out.push('$');
    Regex::new(&out).map_err(|e| CodecError::Invalid {
        field: "pattern".to_owned(),
        reason: format!("failed to compile pattern '{pattern}': {e}"),
    })
}

/// Convenience wrapper used by callers (and the round-trip law test) that
/// don't need to keep the compiled regex around.
pub fn pattern_matches(path: &str, pattern: &str) -> bool {
    compile_pattern(pattern).is_ok_and(|re| re.is_match(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_star_matches_one_segment_only() {
        let re = compile_pattern("companion.device.*.brightness").unwrap();
        assert!(re.is_match("companion.device.1.brightness"));
        assert!(!re.is_match("companion.device.1.2.brightness"));
    }

    #[test]
    fn double_star_matches_zero_or_more_segments() {
        let re = compile_pattern("companion.variables.**").unwrap();
        assert!(re.is_match("companion.variables.tally"));
        assert!(re.is_match("companion.variables.a.b.c"));
        assert!(re.is_match("companion.variables"));
        assert!(!re.is_match("companion.other.tally"));
    }

    #[test]
    fn dots_are_literal_not_wildcard() {
        let re = compile_pattern("a.b.c").unwrap();
        assert!(re.is_match("a.b.c"));
        assert!(!re.is_match("aXbXc"));
    }

    #[test]
    fn other_metacharacters_are_escaped_and_literal() {
        let re = compile_pattern("a+b(c)").unwrap();
        assert!(re.is_match("a+b(c)"));
        assert!(!re.is_match("aaab"));
    }

    #[test]
    fn pattern_compilation_is_stable_round_trip() {
        for (pattern, path) in [
            ("companion.**", "companion.device.1.key.0"),
            ("companion.device.*.key.*", "companion.device.1.key.0"),
            ("hub.subscriptions", "hub.subscriptions"),
        ] {
            let re = compile_pattern(pattern).unwrap();
            assert_eq!(re.is_match(path), crate::pattern_matches(path, pattern));
        }
    }
}
