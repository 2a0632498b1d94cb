use std::borrow::Cow;
use std::fmt;

/// Character that can't appear in a line of text, used to neutralise inactive anchors
const NEVER_MATCHES: &str = "\u{FFFF}";

/// Which of `\A` and `\G` can match at the current position.
/// `\A` only makes sense on the first line of a document and `\G` only where the previous
/// begin/while match ended so they are turned off everywhere else.
#[derive(Copy, Clone, PartialEq, Hash, Eq)]
pub enum AnchorActive {
    /// Only \A is active
    A,
    /// Only \G is active
    G,
    /// Both \A and \G are active
    AG,
    /// Neither \A nor \G are active
    None,
}

impl AnchorActive {
    pub fn new(is_first_line: bool, anchor_position: Option<usize>, current_pos: usize) -> Self {
        let g_active = anchor_position == Some(current_pos);

        match (is_first_line, g_active) {
            (true, true) => AnchorActive::AG,
            (true, false) => AnchorActive::A,
            (false, true) => AnchorActive::G,
            (false, false) => AnchorActive::None,
        }
    }

    fn allows(self, anchor: u8) -> bool {
        match (self, anchor) {
            (AnchorActive::AG, _) => true,
            (AnchorActive::A, b'A') => true,
            (AnchorActive::G, b'G') => true,
            _ => false,
        }
    }

    /// Same trick as vscode-textmate: inactive anchors are replaced by a character
    /// that never shows up in text. Escaped backslashes are left alone.
    pub fn replace_anchors<'a>(&self, pat: &'a str) -> Cow<'a, str> {
        if *self == AnchorActive::AG || !(pat.contains("\\A") || pat.contains("\\G")) {
            return Cow::Borrowed(pat);
        }

        let bytes = pat.as_bytes();
        let mut out = String::with_capacity(pat.len());
        let mut last = 0;
        let mut i = 0;
        while i + 1 < bytes.len() {
            if bytes[i] != b'\\' {
                i += 1;
                continue;
            }
            let next = bytes[i + 1];
            if matches!(next, b'A' | b'G') && !self.allows(next) {
                out.push_str(&pat[last..i]);
                out.push_str(NEVER_MATCHES);
                last = i + 2;
            }
            i += 2;
        }
        out.push_str(&pat[last..]);
        Cow::Owned(out)
    }
}

impl fmt::Debug for AnchorActive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AnchorActive::A => "allow_A=true, allow_G=false",
            AnchorActive::G => "allow_A=false, allow_G=true",
            AnchorActive::AG => "allow_A=true, allow_G=true",
            AnchorActive::None => "allow_A=false, allow_G=false",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activation() {
        assert_eq!(AnchorActive::new(true, Some(3), 3), AnchorActive::AG);
        assert_eq!(AnchorActive::new(true, None, 0), AnchorActive::A);
        assert_eq!(AnchorActive::new(false, Some(3), 3), AnchorActive::G);
        assert_eq!(AnchorActive::new(false, Some(3), 4), AnchorActive::None);
    }

    #[test]
    fn replaces_only_inactive_anchors() {
        let pat = r"\A#!|\G\s+";
        assert_eq!(AnchorActive::AG.replace_anchors(pat), pat);
        assert_eq!(AnchorActive::A.replace_anchors(pat), "\\A#!|\u{FFFF}\\s+");
        assert_eq!(AnchorActive::G.replace_anchors(pat), "\u{FFFF}#!|\\G\\s+");
        assert_eq!(
            AnchorActive::None.replace_anchors(pat),
            "\u{FFFF}#!|\u{FFFF}\\s+"
        );
    }

    #[test]
    fn escaped_backslashes_are_not_anchors() {
        assert_eq!(AnchorActive::None.replace_anchors(r"\\G"), r"\\G");
        assert!(matches!(
            AnchorActive::None.replace_anchors("plain"),
            Cow::Borrowed(_)
        ));
    }
}
