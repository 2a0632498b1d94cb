//! This file replicates the logic of <https://github.com/microsoft/vscode-textmate>

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::Arc;

use onig::{Region, SearchOptions};
use serde::{Deserialize, Serialize};

use crate::Registry;
use crate::error::{Error, TmResult};
use crate::grammars::{
    CompiledGrammar, END_RULE_ID, GlobalRuleRef, GrammarId, Include, PatternSet, PatternSetMatch,
    ROOT_RULE_ID, Regex, Rule, RuleId, resolve_backreferences,
};
use crate::scope::Scope;
use crate::tokenizer::anchors::AnchorActive;

mod anchors;
mod stack;

pub use stack::{StackFrame, StateStack};

/// How deep captures with `patterns` are re-tokenized inside other captures.
/// Past that depth they only get their `name`.
const MAX_CAPTURE_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Byte span within the line (start inclusive, end exclusive, 0-based)
    pub span: Range<usize>,
    /// Hierarchical scope names, ordered from outermost to innermost
    /// (e.g., source.js -> string.quoted.double -> punctuation.definition.string).
    pub scopes: Vec<Scope>,
}

/// Small wrapper so we only produce valid tokens.
/// Every token starts where the previous one ended so tokens are always contiguous.
#[derive(Debug, Clone, Default)]
struct TokenAccumulator {
    tokens: Vec<Token>,
    /// Position up to which tokens have been generated
    /// (start of next token to be produced)
    last_end_pos: usize,
}

impl TokenAccumulator {
    fn produce(&mut self, end_pos: usize, scopes: &[Scope]) {
        // Skip empty tokens (can happen with zero-width matches)
        if self.last_end_pos >= end_pos {
            return;
        }

        #[cfg(feature = "debug")]
        log::debug!(
            "[produce]: [{}..{end_pos}]\n{}",
            self.last_end_pos,
            scopes
                .iter()
                .map(|s| format!(" * {s}"))
                .collect::<Vec<_>>()
                .join("\n")
        );
        self.tokens.push(Token {
            span: self.last_end_pos..end_pos,
            scopes: scopes.to_vec(),
        });
        self.last_end_pos = end_pos;
    }

    /// Removes the newline added to the line before tokenizing
    fn finalize(mut self, line_len: usize, merge_same_scopes: bool) -> Vec<Token> {
        self.tokens.retain(|t| t.span.start < line_len);
        if let Some(t) = self.tokens.last_mut()
            && t.span.end > line_len
        {
            t.span.end = line_len;
        }

        if !merge_same_scopes {
            return self.tokens;
        }

        let mut out: Vec<Token> = Vec::with_capacity(self.tokens.len());
        for token in self.tokens {
            match out.last_mut() {
                Some(prev) if prev.scopes == token.scopes => prev.span.end = token.span.end,
                _ => out.push(token),
            }
        }
        out
    }
}

/// Tokenizes lines of text with a grammar.
///
/// A tokenizer caches the pattern sets it builds so it should be kept around for a whole
/// document, or several. It is cheap to create though and holds no parse state:
/// that's the `StateStack` returned for each line.
#[derive(Debug)]
pub struct Tokenizer<'r> {
    /// The grammar we started with, what `$base` refers to
    base_grammar: Arc<CompiledGrammar>,
    registry: &'r Registry,
    /// Grammars reached through the stack or includes, so we don't hit the registry every time
    grammars: HashMap<GrammarId, Arc<CompiledGrammar>>,
    /// Pattern sets by rule, anchors and resolved end pattern
    pattern_cache: HashMap<(GlobalRuleRef, AnchorActive, Option<String>), PatternSet>,
    /// Used only for while patterns
    /// Some of them change depending on backrefs so we might have multiple
    /// versions of the same regex in there
    while_regex_cache: HashMap<String, Regex>,
    merge_same_scopes: bool,
}

impl<'r> Tokenizer<'r> {
    pub fn new(grammar: Arc<CompiledGrammar>, registry: &'r Registry) -> Self {
        let mut grammars = HashMap::new();
        grammars.insert(grammar.id, grammar.clone());
        Self {
            base_grammar: grammar,
            registry,
            grammars,
            pattern_cache: HashMap::new(),
            while_regex_cache: HashMap::new(),
            merge_same_scopes: true,
        }
    }

    /// Whether adjacent tokens with the same scopes are merged into one. Defaults to `true`.
    pub fn merge_same_scopes(mut self, merge: bool) -> Self {
        self.merge_same_scopes = merge;
        self
    }

    pub fn grammar(&self) -> &Arc<CompiledGrammar> {
        &self.base_grammar
    }

    /// The stack to give to the first line of a document
    pub fn initial_stack(&self) -> StateStack {
        StateStack::initial(&self.base_grammar)
    }

    /// Tokenizes a single line, without its line terminator.
    ///
    /// Tokens cover the whole line, in order. An empty line has no tokens but can still
    /// change the state, eg by ending a `while` rule.
    pub fn tokenize_line(
        &mut self,
        line: &str,
        stack: &StateStack,
    ) -> TmResult<(Vec<Token>, StateStack)> {
        // Always add a new line, some regex expect it
        let text = format!("{line}\n");
        let mut acc = TokenAccumulator::default();

        let (stack, pos, anchor_position, is_first_line) =
            self.check_while_conditions(&text, stack.clone(), &mut acc, stack.is_first_line())?;
        let stack = self.tokenize_text(
            &text,
            pos,
            stack,
            is_first_line,
            anchor_position,
            &mut acc,
            0,
        )?;

        Ok((acc.finalize(line.len(), self.merge_same_scopes), stack.reset()))
    }

    /// Tokenizes a whole document, returning the tokens of each line.
    /// `\r\n` and `\r` are treated as line breaks.
    pub fn tokenize_string(&mut self, text: &str) -> TmResult<Vec<Vec<Token>>> {
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
        let mut stack = self.initial_stack();
        let mut lines_tokens = Vec::new();

        for line in normalized.split('\n') {
            let (tokens, next) = self.tokenize_line(line, &stack)?;
            lines_tokens.push(tokens);
            stack = next;
        }

        Ok(lines_tokens)
    }

    fn load_grammar(&mut self, id: GrammarId) -> TmResult<Arc<CompiledGrammar>> {
        if let Some(g) = self.grammars.get(&id) {
            return Ok(g.clone());
        }
        let grammar = self
            .registry
            .grammar(id)
            .ok_or_else(|| Error::GrammarNotFound(format!("grammar #{}", id.0)))?;
        self.grammars.insert(id, grammar.clone());
        Ok(grammar)
    }

    /// Checks the while conditions of the stack, outermost first.
    /// The first one that doesn't match pops its frame and everything above it.
    fn check_while_conditions(
        &mut self,
        text: &str,
        stack: StateStack,
        acc: &mut TokenAccumulator,
        is_first_line: bool,
    ) -> TmResult<(StateStack, usize, Option<usize>, bool)> {
        // \G matches at 0 if the rule that was pushed last consumed the end of the previous line
        let mut anchor_position = if stack.top().begin_rule_has_captured_eol {
            Some(0)
        } else {
            None
        };
        let mut is_first_line = is_first_line;
        let mut pos = 0;
        let mut stack = stack;

        for while_stack in stack.ancestors() {
            let frame = while_stack.top();
            let grammar = self.load_grammar(frame.rule_ref.grammar)?;
            let Rule::BeginWhile(rule) = grammar.rule(frame.rule_ref.rule) else {
                continue;
            };

            let while_pat = frame
                .end_pattern
                .as_deref()
                .unwrap_or_else(|| grammar.regex(rule.while_).pattern());
            let anchors = AnchorActive::new(is_first_line, anchor_position, pos);
            let while_pat = anchors.replace_anchors(while_pat);

            #[cfg(feature = "debug")]
            log::debug!(
                "[check_while_conditions] Testing while pattern: {while_pat:?}, anchors={anchors:?}, pos={pos}"
            );

            match self.match_while_at(&while_pat, text, pos)? {
                Some(captures) => {
                    let end = captures[0].map(|(_, e)| e).unwrap_or(pos);
                    acc.produce(pos, &frame.content_scopes);
                    self.resolve_captures(
                        text,
                        &while_stack,
                        &grammar,
                        &rule.while_captures,
                        &captures,
                        acc,
                        is_first_line,
                        0,
                    )?;
                    acc.produce(end, &frame.content_scopes);

                    if end > pos {
                        pos = end;
                        anchor_position = Some(pos);
                        is_first_line = false;
                    }
                }
                None => {
                    #[cfg(feature = "debug")]
                    log::debug!("[check_while_conditions] No while match found, popping");
                    stack = while_stack.pop()?.1;
                    break;
                }
            }
        }

        Ok((stack, pos, anchor_position, is_first_line))
    }

    /// A while pattern only holds if it matches right at `pos`
    fn match_while_at(
        &mut self,
        pattern: &str,
        text: &str,
        pos: usize,
    ) -> TmResult<Option<Vec<Option<(usize, usize)>>>> {
        let re = self
            .while_regex_cache
            .entry(pattern.to_owned())
            .or_insert_with(|| Regex::new(pattern.to_owned()));
        let compiled = re
            .compiled()
            .ok_or_else(|| Error::TokenizeRegex(format!("invalid while pattern {pattern:?}")))?;

        let mut region = Region::new();
        let found = compiled.search_with_options(
            text,
            pos,
            text.len(),
            SearchOptions::SEARCH_OPTION_NONE,
            Some(&mut region),
        );
        if found != Some(pos) {
            return Ok(None);
        }

        Ok(Some((0..region.len()).map(|i| region.pos(i)).collect()))
    }

    /// Expands the patterns of `rule_ref` through its includes, in order.
    /// A rule reachable several times only keeps its first position.
    fn collect_patterns(
        &mut self,
        rule_ref: GlobalRuleRef,
        out: &mut Vec<(GlobalRuleRef, String)>,
        visited: &mut HashSet<GlobalRuleRef>,
    ) -> TmResult<()> {
        let grammar = self.load_grammar(rule_ref.grammar)?;

        for include in grammar.rule(rule_ref.rule).patterns() {
            let target = match include {
                Include::Rule(id) => GlobalRuleRef {
                    grammar: grammar.id,
                    rule: *id,
                },
                Include::SelfRoot => GlobalRuleRef {
                    grammar: grammar.id,
                    rule: ROOT_RULE_ID,
                },
                Include::Base => GlobalRuleRef {
                    grammar: self.base_grammar.id,
                    rule: ROOT_RULE_ID,
                },
                Include::External { scope_name, entry } => {
                    let Some(external) = self.registry.loaded_grammar(scope_name) else {
                        log::debug!(
                            "Skipping include of {scope_name} from {}: grammar not loaded",
                            grammar.scope_name
                        );
                        continue;
                    };
                    let rule = match entry {
                        Some(name) => match external.repository_entry(name) {
                            Some(rule) => rule,
                            None => {
                                log::debug!("Skipping include of {scope_name}#{name}: no such entry");
                                continue;
                            }
                        },
                        None => ROOT_RULE_ID,
                    };
                    self.grammars.insert(external.id, external.clone());
                    GlobalRuleRef {
                        grammar: external.id,
                        rule,
                    }
                }
                // resolved when the grammar was compiled
                Include::Local { .. } => continue,
            };

            if !visited.insert(target) {
                continue;
            }

            let target_grammar = self.load_grammar(target.grammar)?;
            match target_grammar.rule(target.rule) {
                Rule::Match(m) => {
                    if let Some(regex_id) = m.regex_id {
                        out.push((target, target_grammar.regex(regex_id).pattern().to_owned()));
                    }
                }
                Rule::BeginEnd(b) => {
                    out.push((target, target_grammar.regex(b.begin).pattern().to_owned()));
                }
                Rule::BeginWhile(b) => {
                    out.push((target, target_grammar.regex(b.begin).pattern().to_owned()));
                }
                Rule::IncludeOnly(_) => self.collect_patterns(target, out, visited)?,
                Rule::Noop => (),
            }
        }

        Ok(())
    }

    fn get_or_create_pattern_set(
        &mut self,
        stack: &StateStack,
        anchors: AnchorActive,
    ) -> TmResult<&PatternSet> {
        let rule_ref = stack.top().rule_ref;
        let key = (rule_ref, anchors, stack.top().end_pattern.clone());

        if !self.pattern_cache.contains_key(&key) {
            let grammar = self.load_grammar(rule_ref.grammar)?;
            let mut patterns = Vec::new();
            let mut visited = HashSet::new();
            self.collect_patterns(rule_ref, &mut patterns, &mut visited)?;

            // The end pattern goes first unless the rule asks otherwise
            if let Rule::BeginEnd(b) = grammar.rule(rule_ref.rule) {
                let end_pat = key
                    .2
                    .clone()
                    .unwrap_or_else(|| grammar.regex(b.end).pattern().to_owned());
                let end_rule_ref = GlobalRuleRef {
                    grammar: rule_ref.grammar,
                    rule: END_RULE_ID,
                };
                if b.apply_end_pattern_last {
                    patterns.push((end_rule_ref, end_pat));
                } else {
                    patterns.insert(0, (end_rule_ref, end_pat));
                }
            }

            let patterns = patterns
                .into_iter()
                .map(|(r, pat)| (r, anchors.replace_anchors(&pat).into_owned()))
                .collect();
            let set = PatternSet::new(patterns).map_err(Error::TokenizeRegex)?;

            #[cfg(feature = "debug")]
            log::debug!("[get_or_create_pattern_set] {rule_ref:?} ({anchors:?}): {set:?}");
            self.pattern_cache.insert(key.clone(), set);
        }

        Ok(&self.pattern_cache[&key])
    }

    fn match_rule(
        &mut self,
        stack: &StateStack,
        text: &str,
        pos: usize,
        anchors: AnchorActive,
    ) -> TmResult<Option<PatternSetMatch>> {
        let set = self.get_or_create_pattern_set(stack, anchors)?;
        Ok(set.find_at(text, pos))
    }

    /// Applies the capture rules of a match.
    /// Captures are in group order, so an outer group comes before the groups nested in it.
    #[allow(clippy::too_many_arguments)]
    fn resolve_captures(
        &mut self,
        text: &str,
        stack: &StateStack,
        grammar: &Arc<CompiledGrammar>,
        rule_captures: &[Option<RuleId>],
        captures: &[Option<(usize, usize)>],
        acc: &mut TokenAccumulator,
        is_first_line: bool,
        depth: usize,
    ) -> TmResult<()> {
        if rule_captures.is_empty() {
            return Ok(());
        }
        let Some(Some((_, max_end))) = captures.first().copied() else {
            return Ok(());
        };

        // (scopes, end_pos)[]
        let mut local_stack: Vec<(Vec<Scope>, usize)> = Vec::with_capacity(2);

        for (i, rule_id) in rule_captures.iter().enumerate() {
            let Some(rule_id) = rule_id else {
                continue;
            };
            let Some(Some((cap_start, cap_end))) = captures.get(i).copied() else {
                continue;
            };
            // Nothing captured
            if cap_start == cap_end {
                continue;
            }
            // Capture in a lookahead, past what the match consumed
            if cap_start > max_end {
                break;
            }

            while let Some((scopes, end_pos)) = local_stack.last()
                && *end_pos <= cap_start
            {
                acc.produce(*end_pos, scopes);
                local_stack.pop();
            }

            let base = match local_stack.last() {
                Some((scopes, _)) => scopes.clone(),
                None => stack.scopes().to_vec(),
            };
            acc.produce(cap_start, &base);

            let rule = grammar.rule(*rule_id);
            let rule_scopes = rule.name_scopes(text, captures);
            let has_name = !rule_scopes.is_empty();
            let mut name_scopes = base;
            name_scopes.extend(rule_scopes);

            if rule.has_patterns() && depth < MAX_CAPTURE_DEPTH {
                let mut content_scopes = name_scopes.clone();
                content_scopes.extend(rule.content_scopes(text, captures));
                let capture_stack = stack.push(StackFrame {
                    rule_ref: GlobalRuleRef {
                        grammar: grammar.id,
                        rule: *rule_id,
                    },
                    name_scopes,
                    content_scopes,
                    end_pattern: None,
                    begin_rule_has_captured_eol: false,
                    anchor_position: None,
                    enter_position: Some(cap_start),
                });

                #[cfg(feature = "debug")]
                log::debug!(
                    "[resolve_captures] Retokenizing capture [{cap_start}..{cap_end}]: {:?}",
                    &text[cap_start..cap_end]
                );
                // The capture only sees the text up to its end, but what's before is kept
                // for lookbehinds
                self.tokenize_text(
                    &text[..cap_end],
                    cap_start,
                    capture_stack,
                    is_first_line && cap_start == 0,
                    None,
                    acc,
                    depth + 1,
                )?;
                continue;
            }

            if has_name {
                local_stack.push((name_scopes, cap_end));
            }
        }

        while let Some((scopes, end_pos)) = local_stack.pop() {
            acc.produce(end_pos, &scopes);
        }

        Ok(())
    }

    /// Moves one character forward when the grammar would otherwise loop in place.
    /// Returns false at the end of the text.
    fn force_advance(
        text: &str,
        pos: &mut usize,
        scopes: &[Scope],
        acc: &mut TokenAccumulator,
    ) -> bool {
        let Some(c) = text[*pos..].chars().next() else {
            return false;
        };

        #[cfg(feature = "debug")]
        log::debug!("[force_advance] grammar is not advancing at {}", *pos);
        *pos += c.len_utf8();
        acc.produce(*pos, scopes);
        true
    }

    /// The main loop: repeatedly finds the earliest match of the rules active on top of the
    /// stack and applies it until the end of `text`.
    #[allow(clippy::too_many_arguments)]
    fn tokenize_text(
        &mut self,
        text: &str,
        start: usize,
        stack: StateStack,
        is_first_line: bool,
        anchor_position: Option<usize>,
        acc: &mut TokenAccumulator,
        depth: usize,
    ) -> TmResult<StateStack> {
        let mut pos = start;
        let mut stack = stack;
        let mut is_first_line = is_first_line;
        let mut anchor_position = anchor_position;

        loop {
            #[cfg(feature = "debug")]
            log::trace!("[tokenize_text] Scanning {pos}: |{:?}|", &text[pos..]);

            let anchors = AnchorActive::new(is_first_line, anchor_position, pos);
            let Some(m) = self.match_rule(&stack, text, pos, anchors)? else {
                #[cfg(feature = "debug")]
                log::debug!("[tokenize_text] no more matches");
                acc.produce(text.len(), stack.scopes());
                break;
            };

            #[cfg(feature = "debug")]
            log::debug!(
                "[tokenize_text] Matched rule: {:?} from pos {} to {} => {:?}",
                m.rule_ref.rule,
                m.start,
                m.end,
                &text[m.start..m.end]
            );

            let has_advanced = m.end > pos;

            // We matched the `end` for this rule, can only happen for BeginEnd rules
            if m.rule_ref.rule == END_RULE_ID {
                let grammar = self.load_grammar(stack.top().rule_ref.grammar)?;
                let Rule::BeginEnd(rule) = grammar.rule(stack.top().rule_ref.rule) else {
                    return Err(Error::TokenizeRegex(
                        "end pattern matched outside of a begin/end rule".to_owned(),
                    ));
                };

                acc.produce(m.start, stack.scopes());
                // the end delimiter doesn't get the `contentName`
                let end_stack = stack.with_top(|f| f.content_scopes = f.name_scopes.clone());
                self.resolve_captures(
                    text,
                    &end_stack,
                    &grammar,
                    &rule.end_captures,
                    &m.capture_pos,
                    acc,
                    is_first_line,
                    depth,
                )?;
                acc.produce(m.end, end_stack.scopes());

                let (popped, parent) = stack.pop()?;
                stack = parent;
                anchor_position = popped.anchor_position;

                // Grammar pushed & popped a rule without advancing
                // See https://github.com/Microsoft/vscode-textmate/issues/12
                if !has_advanced && popped.enter_position == Some(pos) {
                    if !Self::force_advance(text, &mut pos, stack.scopes(), acc) {
                        break;
                    }
                    is_first_line = false;
                    continue;
                }
            } else {
                let grammar = self.load_grammar(m.rule_ref.grammar)?;
                let rule = grammar.rule(m.rule_ref.rule);
                acc.produce(m.start, stack.scopes());

                let mut name_scopes = stack.scopes().to_vec();
                name_scopes.extend(rule.name_scopes(text, &m.capture_pos));

                match rule {
                    Rule::BeginEnd(_) | Rule::BeginWhile(_) => {
                        // Entering again a rule we entered here already would never end
                        if !has_advanced && stack.has_rule_entered_at(m.rule_ref, m.start) {
                            if !Self::force_advance(text, &mut pos, stack.scopes(), acc) {
                                break;
                            }
                            is_first_line = false;
                            continue;
                        }

                        let (captures, end_regex, end_has_backrefs) = match rule {
                            Rule::BeginEnd(r) => (&r.begin_captures, r.end, r.end_has_backrefs),
                            Rule::BeginWhile(r) => {
                                (&r.begin_captures, r.while_, r.while_has_backrefs)
                            }
                            _ => unreachable!(),
                        };

                        let mut content_scopes = name_scopes.clone();
                        content_scopes.extend(rule.content_scopes(text, &m.capture_pos));
                        let end_pattern = end_has_backrefs.then(|| {
                            resolve_backreferences(
                                grammar.regex(end_regex).pattern(),
                                text,
                                &m.capture_pos,
                            )
                        });

                        let pushed = stack.push(StackFrame {
                            rule_ref: m.rule_ref,
                            name_scopes,
                            content_scopes,
                            end_pattern,
                            begin_rule_has_captured_eol: m.end == text.len(),
                            anchor_position,
                            enter_position: Some(m.start),
                        });

                        // the begin delimiter doesn't get the `contentName` either
                        let begin_stack =
                            pushed.with_top(|f| f.content_scopes = f.name_scopes.clone());
                        self.resolve_captures(
                            text,
                            &begin_stack,
                            &grammar,
                            captures,
                            &m.capture_pos,
                            acc,
                            is_first_line,
                            depth,
                        )?;
                        acc.produce(m.end, begin_stack.scopes());

                        #[cfg(feature = "debug")]
                        log::debug!("[tokenize_text] Pushed {:?}", m.rule_ref);
                        stack = pushed;
                        anchor_position = Some(m.end);
                    }
                    Rule::Match(r) => {
                        let match_stack = stack.push(StackFrame {
                            rule_ref: m.rule_ref,
                            name_scopes: name_scopes.clone(),
                            content_scopes: name_scopes,
                            end_pattern: None,
                            begin_rule_has_captured_eol: false,
                            anchor_position,
                            enter_position: Some(m.start),
                        });
                        self.resolve_captures(
                            text,
                            &match_stack,
                            &grammar,
                            &r.captures,
                            &m.capture_pos,
                            acc,
                            is_first_line,
                            depth,
                        )?;
                        acc.produce(m.end, match_stack.scopes());

                        // Protection: grammar is not advancing, nor is it pushing/popping
                        if !has_advanced {
                            if !Self::force_advance(text, &mut pos, stack.scopes(), acc) {
                                break;
                            }
                            is_first_line = false;
                            continue;
                        }
                    }
                    Rule::IncludeOnly(_) | Rule::Noop => {
                        return Err(Error::TokenizeRegex(format!(
                            "rule {:?} has no pattern of its own but matched",
                            m.rule_ref
                        )));
                    }
                }
            }

            if has_advanced {
                pos = m.end;
                is_first_line = false;
            }
        }

        Ok(stack)
    }
}
