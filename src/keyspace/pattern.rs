//! Glob patterns for key enumeration and set scanning.
//!
//! Supports `*`, `?`, `[...]` classes (with `^` negation and ranges) and
//! backslash escapes.

/// Returns true if `pattern` contains an unescaped glob metacharacter.
pub fn is_pattern(pattern: &str) -> bool {
    let mut escaped = false;
    for c in pattern.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '*' | '?' | '[' => return true,
            _ => {}
        }
    }
    false
}

/// Escapes every metacharacter so that `s` matches only itself.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Matches `text` against a glob `pattern`.
pub fn matches(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    match_from(&pattern, &text)
}

fn match_from(pattern: &[char], text: &[char]) -> bool {
    let (mut p, mut t) = (0, 0);
    // Backtracking point for the last `*` seen: (pattern index after star, text index)
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() {
            match pattern[p] {
                '*' => {
                    star = Some((p + 1, t));
                    p += 1;
                    continue;
                }
                '?' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                '[' => {
                    if let Some((matched, next)) = match_class(pattern, p, text[t]) {
                        if matched {
                            p = next;
                            t += 1;
                            continue;
                        }
                    } else if text[t] == '[' {
                        // Unterminated class: treat '[' literally
                        p += 1;
                        t += 1;
                        continue;
                    }
                }
                '\\' if p + 1 < pattern.len() => {
                    if pattern[p + 1] == text[t] {
                        p += 2;
                        t += 1;
                        continue;
                    }
                }
                c => {
                    if c == text[t] {
                        p += 1;
                        t += 1;
                        continue;
                    }
                }
            }
        }

        match star {
            Some((star_p, star_t)) => {
                p = star_p;
                t = star_t + 1;
                star = Some((star_p, star_t + 1));
            }
            None => return false,
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}

/// Matches `c` against the class starting at `pattern[start] == '['`.
///
/// Returns (matched, index after the closing bracket), or None when unterminated.
fn match_class(pattern: &[char], start: usize, c: char) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = i < pattern.len() && pattern[i] == '^';
    if negate {
        i += 1;
    }

    let mut matched = false;
    let mut first = true;
    while i < pattern.len() {
        let mut current = pattern[i];
        if current == ']' && !first {
            return Some((matched != negate, i + 1));
        }
        first = false;
        if current == '\\' && i + 1 < pattern.len() {
            i += 1;
            current = pattern[i];
        }
        if i + 2 < pattern.len() && pattern[i + 1] == '-' && pattern[i + 2] != ']' {
            let (lo, hi) = (current, pattern[i + 2]);
            let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
            if lo <= c && c <= hi {
                matched = true;
            }
            i += 3;
        } else {
            if current == c {
                matched = true;
            }
            i += 1;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_and_star() {
        assert!(matches("BUCKET.dev.*", "BUCKET.dev.app.users"));
        assert!(!matches("BUCKET.dev.*", "BUCKET.prod.app.users"));
        assert!(matches("*", ""));
        assert!(matches("a*b*c", "aXXbYYc"));
        assert!(!matches("a*b*c", "aXXbYY"));
    }

    #[test]
    fn test_question_mark_and_class() {
        assert!(matches("user?", "user1"));
        assert!(!matches("user?", "user"));
        assert!(matches("user[0-9]", "user7"));
        assert!(!matches("user[^0-9]", "user7"));
        assert!(matches("user[abc]", "userb"));
    }

    #[test]
    fn test_escape_matches_only_itself() {
        let raw = r#"{"key":"a*b[1]?"}"#;
        let escaped = escape(raw);
        assert!(!is_pattern(&escaped));
        assert!(matches(&escaped, raw));
        assert!(!matches(&escaped, r#"{"key":"aXb[1]?"}"#));
        assert!(matches(&format!("*{}*", escape("\"a*b\"")), "prefix\"a*b\"suffix"));
    }

    #[test]
    fn test_is_pattern() {
        assert!(is_pattern("app.*"));
        assert!(is_pattern("user?"));
        assert!(!is_pattern("app.users"));
        assert!(!is_pattern(r"app.\*"));
    }
}
