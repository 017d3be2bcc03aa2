//! Glob-style key patterns with Redis `KEYS` semantics.

use regex::Regex;

/// Compiled key pattern.
///
/// Supports `*` (any run), `?` (one character), `[...]` classes (with `^`
/// negation and ranges) and `\` escapes.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    regex: Regex,
}

impl KeyPattern {
    /// Compiles a glob pattern.
    pub fn new(glob: &str) -> Result<Self, regex::Error> {
        let mut out = String::with_capacity(glob.len() + 8);
        out.push('^');
        let mut chars = glob.chars();
        while let Some(c) = chars.next() {
            match c {
                '*' => out.push_str(".*"),
                '?' => out.push('.'),
                '\\' => match chars.next() {
                    Some(escaped) => out.push_str(&regex::escape(&escaped.to_string())),
                    None => out.push_str(r"\\"),
                },
                '[' => {
                    out.push('[');
                    let mut first = true;
                    for class_char in chars.by_ref() {
                        match class_char {
                            ']' => break,
                            '^' if first => out.push('^'),
                            '\\' | '[' | '&' | '~' => {
                                out.push('\\');
                                out.push(class_char);
                            }
                            other => out.push(other),
                        }
                        first = false;
                    }
                    out.push(']');
                }
                other => out.push_str(&regex::escape(&other.to_string())),
            }
        }
        out.push('$');
        Ok(Self {
            regex: Regex::new(&out)?,
        })
    }

    /// Whether `key` matches the pattern.
    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_any_suffix() {
        let pattern = KeyPattern::new("vauntico:session:*").unwrap();
        assert!(pattern.matches("vauntico:session:42"));
        assert!(pattern.matches("vauntico:session:"));
        assert!(!pattern.matches("ratelimit:session:42"));
        assert!(!pattern.matches("vauntico:sessions"));
    }

    #[test]
    fn question_mark_and_classes() {
        let pattern = KeyPattern::new("h?llo").unwrap();
        assert!(pattern.matches("hello"));
        assert!(pattern.matches("hallo"));
        assert!(!pattern.matches("hllo"));

        let pattern = KeyPattern::new("h[ae]llo").unwrap();
        assert!(pattern.matches("hello"));
        assert!(!pattern.matches("hillo"));

        let pattern = KeyPattern::new("h[^e]llo").unwrap();
        assert!(pattern.matches("hallo"));
        assert!(!pattern.matches("hello"));

        let pattern = KeyPattern::new("job:[0-9]").unwrap();
        assert!(pattern.matches("job:7"));
        assert!(!pattern.matches("job:x"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let pattern = KeyPattern::new("a.b+(c)").unwrap();
        assert!(pattern.matches("a.b+(c)"));
        assert!(!pattern.matches("axbb(c)"));

        let pattern = KeyPattern::new(r"star\*").unwrap();
        assert!(pattern.matches("star*"));
        assert!(!pattern.matches("starlight"));
    }
}
