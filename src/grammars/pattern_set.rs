use std::fmt::{Debug, Formatter};

use onig::{RegSet, RegexOptions, SearchOptions};

use crate::grammars::GlobalRuleRef;

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PatternSetMatch {
    /// The rule whose regex matched, `END_RULE_ID` for the end pattern of the current rule
    pub rule_ref: GlobalRuleRef,
    pub start: usize,
    pub end: usize,
    /// Absolute positions of each capture group, group 0 being the whole match
    pub capture_pos: Vec<Option<(usize, usize)>>,
}

/// An ordered set of patterns searched in one pass with an onig RegSet.
///
/// The earliest match in the text wins. When several patterns match at the same position,
/// the one that comes first in the set wins: TextMate is first-match, not longest-match.
pub struct PatternSet {
    rule_refs: Vec<GlobalRuleRef>,
    regset: Option<RegSet>,
}

impl PatternSet {
    pub fn new(items: Vec<(GlobalRuleRef, String)>) -> Result<Self, String> {
        if items.is_empty() {
            return Ok(Self {
                rule_refs: Vec::new(),
                regset: None,
            });
        }

        let (rule_refs, patterns): (Vec<_>, Vec<_>) = items.into_iter().unzip();
        let pattern_strs: Vec<&str> = patterns.iter().map(|s| s.as_str()).collect();

        let regset = RegSet::with_options(&pattern_strs, RegexOptions::REGEX_OPTION_CAPTURE_GROUP)
            .map_err(|e| {
                format!(
                    "Failed to compile pattern set with {} patterns: {:?}",
                    pattern_strs.len(),
                    e
                )
            })?;

        Ok(Self {
            rule_refs,
            regset: Some(regset),
        })
    }

    /// Finds the first match starting at or after `pos`
    pub(crate) fn find_at(&self, text: &str, pos: usize) -> Option<PatternSetMatch> {
        let regset = self.regset.as_ref()?;

        // Search the full text from `pos` rather than a slice: lookbehinds need what's before
        let (pattern_index, captures) = regset.captures_with_options(
            text,
            pos,
            text.len(),
            onig::RegSetLead::Position,
            SearchOptions::SEARCH_OPTION_NONE,
        )?;
        let (start, end) = captures.pos(0)?;

        Some(PatternSetMatch {
            rule_ref: self.rule_refs[pattern_index],
            start,
            end,
            capture_pos: (0..captures.len()).map(|i| captures.pos(i)).collect(),
        })
    }
}

impl Debug for PatternSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PatternSet({} rules)", self.rule_refs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammars::{GrammarId, RuleId};

    fn rule(id: u32) -> GlobalRuleRef {
        GlobalRuleRef {
            grammar: GrammarId(0),
            rule: RuleId(id),
        }
    }

    #[test]
    fn earliest_match_wins() {
        let set = PatternSet::new(vec![
            (rule(1), "b+".to_owned()),
            (rule(2), "a".to_owned()),
        ])
        .unwrap();

        let m = set.find_at("xxabb", 0).unwrap();
        assert_eq!(m.rule_ref, rule(2));
        assert_eq!((m.start, m.end), (2, 3));
    }

    #[test]
    fn first_declared_wins_on_ties() {
        let set = PatternSet::new(vec![
            (rule(1), "a".to_owned()),
            (rule(2), "ab+".to_owned()),
        ])
        .unwrap();

        let m = set.find_at("abbb", 0).unwrap();
        assert_eq!(m.rule_ref, rule(1));
        assert_eq!(m.end, 1);
    }

    #[test]
    fn reports_captures_and_respects_start() {
        let set = PatternSet::new(vec![(rule(1), r"(\d)(x)?".to_owned())]).unwrap();

        let m = set.find_at("1 2", 1).unwrap();
        assert_eq!((m.start, m.end), (2, 3));
        assert_eq!(m.capture_pos, vec![Some((2, 3)), Some((2, 3)), None]);
        assert!(set.find_at("1 2", 3).is_none());
    }

    #[test]
    fn empty_set_never_matches() {
        let set = PatternSet::new(vec![]).unwrap();
        assert!(set.find_at("anything", 0).is_none());
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        assert!(PatternSet::new(vec![(rule(1), "(".to_owned())]).is_err());
    }
}
