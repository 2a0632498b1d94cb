//! Finding scopes in tokenized text, eg every string literal of a document.

use std::collections::HashMap;
use std::ops::Range;

use crate::scope::Scope;
use crate::tokenizer::Token;

/// A part of a line covered by a single scope.
/// A string literal made of a delimiter, some content and an escape is one match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeMatch<'a> {
    /// 0-based line index
    pub line: usize,
    /// Byte span within that line
    pub span: Range<usize>,
    pub scope: Scope,
    /// The scopes it's nested in, outermost first, starting with the grammar scope
    pub parents: &'a [Scope],
}

/// A search over the tokens of a document.
///
/// Selectors match by dotted prefix, so `string` finds `string.quoted.double`.
/// Consecutive tokens of a line under the same scope are reported as one match and
/// nested scopes are reported after the scope containing them.
/// The grammar scope itself is never reported.
#[derive(Debug, Clone, Default)]
pub struct ScopeQuery {
    selectors: Vec<Scope>,
    start: Vec<Scope>,
    hide: Vec<Scope>,
    stop: Vec<Scope>,
    max_depth: Option<usize>,
}

impl ScopeQuery {
    pub fn new(selectors: &[&str]) -> Self {
        Self {
            selectors: to_scopes(selectors),
            ..Default::default()
        }
    }

    /// Only report matches once a token carrying one of those scopes has been seen,
    /// that token included
    pub fn after(mut self, selectors: &[&str]) -> Self {
        self.start = to_scopes(selectors);
        self
    }

    /// Don't report those scopes. What's nested in them is still searched.
    pub fn hiding(mut self, selectors: &[&str]) -> Self {
        self.hide = to_scopes(selectors);
        self
    }

    /// Stop searching at the first token carrying one of those scopes
    pub fn until(mut self, selectors: &[&str]) -> Self {
        self.stop = to_scopes(selectors);
        self
    }

    /// Only look at scopes nested at most `depth` levels below the grammar scope
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    pub fn find_all<'a>(&self, lines: &'a [Vec<Token>]) -> Vec<ScopeMatch<'a>> {
        let mut out: Vec<ScopeMatch<'a>> = Vec::new();
        let mut started = self.start.is_empty();

        for (line, tokens) in lines.iter().enumerate() {
            // depth -> index in `out` of the match the next token can extend
            let mut open: HashMap<usize, usize> = HashMap::new();

            for token in tokens {
                if carries_any(&self.stop, &token.scopes) {
                    return out;
                }
                if !started && carries_any(&self.start, &token.scopes) {
                    started = true;
                }
                if !started {
                    continue;
                }

                let deepest = match self.max_depth {
                    Some(depth) => (depth + 1).min(token.scopes.len()),
                    None => token.scopes.len(),
                };
                let mut still_open = HashMap::new();

                for depth in 1..deepest {
                    let scope = token.scopes[depth];
                    if !matches_any(&self.selectors, scope) || matches_any(&self.hide, scope) {
                        continue;
                    }

                    let parents = &token.scopes[..depth];
                    let extended = open.get(&depth).copied().filter(|&i| {
                        let prev = &out[i];
                        prev.scope == scope
                            && prev.parents == parents
                            && prev.span.end == token.span.start
                    });

                    match extended {
                        Some(i) => {
                            out[i].span.end = token.span.end;
                            still_open.insert(depth, i);
                        }
                        None => {
                            still_open.insert(depth, out.len());
                            out.push(ScopeMatch {
                                line,
                                span: token.span.clone(),
                                scope,
                                parents,
                            });
                        }
                    }
                }
                open = still_open;
            }
        }

        out
    }

    /// The first match in document order
    pub fn find<'a>(&self, lines: &'a [Vec<Token>]) -> Option<ScopeMatch<'a>> {
        self.find_all(lines).into_iter().next()
    }
}

fn to_scopes(selectors: &[&str]) -> Vec<Scope> {
    selectors.iter().map(|s| Scope::new(s)).collect()
}

fn matches_any(selectors: &[Scope], scope: Scope) -> bool {
    selectors.iter().any(|s| s.is_prefix_of(scope))
}

fn carries_any(selectors: &[Scope], scopes: &[Scope]) -> bool {
    !selectors.is_empty() && scopes.iter().any(|&s| matches_any(selectors, s))
}
