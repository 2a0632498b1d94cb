use std::fmt;
use std::sync::{Arc, OnceLock};

/// A regex pattern that is compiled lazily, the first time it is actually used.
pub struct Regex {
    pattern: String,
    compiled: OnceLock<Option<Arc<onig::Regex>>>,
}

impl Clone for Regex {
    fn clone(&self) -> Self {
        Regex::new(self.pattern.clone())
    }
}

impl fmt::Debug for Regex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.pattern)
    }
}

impl Regex {
    pub fn new(pattern: String) -> Self {
        Self {
            pattern,
            compiled: OnceLock::new(),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// `None` if the pattern is not a valid Oniguruma regex
    pub fn compiled(&self) -> Option<&Arc<onig::Regex>> {
        self.compiled
            .get_or_init(|| onig::Regex::new(&self.pattern).ok().map(Arc::new))
            .as_ref()
    }

    /// Validate that this regex pattern compiles, keeping the compiled version around
    pub fn validate(&self) -> Result<(), onig::Error> {
        if self.compiled().is_some() {
            return Ok(());
        }
        onig::Regex::new(&self.pattern).map(|_| ())
    }

    /// Whether the pattern refers to a capture of another pattern with `\1`..`\99`.
    /// Only meaningful for end/while patterns, which refer to the begin captures.
    pub fn has_backreferences(&self) -> bool {
        let bytes = self.pattern.as_bytes();
        let mut i = 0;
        while i + 1 < bytes.len() {
            if bytes[i] == b'\\' {
                if bytes[i + 1].is_ascii_digit() && bytes[i + 1] != b'0' {
                    return true;
                }
                // skip the escaped char so `\\1` is not a backref
                i += 2;
            } else {
                i += 1;
            }
        }
        false
    }
}

/// Escapes all the regex metacharacters of `text` so it matches literally
pub(crate) fn escape_regex(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(
            c,
            '\\' | '|'
                | '-'
                | '{'
                | '}'
                | '*'
                | '+'
                | '?'
                | '^'
                | '$'
                | '.'
                | ','
                | '['
                | ']'
                | '('
                | ')'
                | '#'
                | ' '
        ) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Replaces `\1`.. in an end/while pattern by the escaped text of the matching begin capture.
/// Captures that did not participate in the match are replaced by an empty string.
pub fn resolve_backreferences(
    pattern: &str,
    line: &str,
    captures: &[Option<(usize, usize)>],
) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some((start, d)) if d.is_ascii_digit() && d != '0' => {
                let mut end = start + 1;
                chars.next();
                while let Some(&(i, d)) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    end = i + 1;
                    chars.next();
                }
                let group: usize = pattern[start..end].parse().unwrap_or(0);
                if let Some(Some((s, e))) = captures.get(group) {
                    out.push_str(&escape_regex(&line[*s..*e]));
                }
            }
            Some((_, other)) => {
                out.push('\\');
                out.push(other);
                chars.next();
            }
            None => out.push('\\'),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_backreferences() {
        assert!(Regex::new(r"^\s*\1$".to_owned()).has_backreferences());
        assert!(Regex::new(r"(?=\12)".to_owned()).has_backreferences());
        assert!(!Regex::new(r"\\1".to_owned()).has_backreferences());
        assert!(!Regex::new(r"\0\d\w".to_owned()).has_backreferences());
    }

    #[test]
    fn lazily_compiles() {
        let re = Regex::new("a+b".to_owned());
        assert!(re.validate().is_ok());
        assert!(re.compiled().is_some());

        let bad = Regex::new("a(+".to_owned());
        assert!(bad.validate().is_err());
        assert!(bad.compiled().is_none());
    }

    #[test]
    fn resolves_backreferences_with_escaping() {
        let line = "<<<EOT.x";
        let captures = vec![Some((0, 8)), Some((3, 6)), Some((6, 8)), None];
        assert_eq!(resolve_backreferences(r"^\1$", line, &captures), "^EOT$");
        assert_eq!(resolve_backreferences(r"\2\w", line, &captures), r"\.x\w");
        assert_eq!(resolve_backreferences(r"a\3b", line, &captures), "ab");
    }

    #[test]
    fn escapes_metacharacters() {
        assert_eq!(escape_regex("a.b*(c)"), r"a\.b\*\(c\)");
        assert_eq!(escape_regex("plain"), "plain");
    }
}
