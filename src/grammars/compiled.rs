use std::collections::HashMap;

use crate::error::{Error, TmResult};
use crate::grammars::raw::{Captures, RawGrammar, RawRule};
use crate::grammars::regex::Regex;
use crate::scope::{Scope, parse_scopes};

/// Id given by the registry to each grammar it compiles
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct GrammarId(pub u32);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct RuleId(pub u32);

impl RuleId {
    #[inline]
    pub fn as_index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RegexId(u32);

impl RegexId {
    #[inline]
    pub fn as_index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RepositoryId(u32);

/// The root rule of a grammar is always the first one compiled
pub const ROOT_RULE_ID: RuleId = RuleId(0);
/// Marker used in pattern sets for the end pattern of the rule on top of the stack
pub const END_RULE_ID: RuleId = RuleId(u32::MAX);

/// A rule in a specific grammar. Rule identity, not value, is what matters in the stack.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct GlobalRuleRef {
    pub grammar: GrammarId,
    pub rule: RuleId,
}

#[derive(Debug, Clone, Default)]
pub struct Repository(HashMap<String, RuleId>);

impl Repository {
    pub fn get(&self, name: &str) -> Option<RuleId> {
        self.0.get(name).copied()
    }
}

const MAX_REPOSITORY_DEPTH: usize = 8;

/// The repositories visible from a rule, innermost last.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct RepositoryStack {
    stack: [Option<RepositoryId>; MAX_REPOSITORY_DEPTH],
    len: u8,
}

impl RepositoryStack {
    fn push(mut self, id: RepositoryId) -> Option<Self> {
        let slot = self.stack.get_mut(self.len as usize)?;
        *slot = Some(id);
        self.len += 1;
        Some(self)
    }

    /// Innermost first, which is also the lookup order
    fn iter(&self) -> impl Iterator<Item = RepositoryId> + '_ {
        self.stack[..self.len as usize].iter().rev().flatten().copied()
    }
}

/// per vscode-textmate, allowed include values:
///  * Scope Name, e.g. `source.ts`
///  * Top level scope reference, e.g. `source.ts#entity.name.class`
///  * Relative scope reference, e.g. `#entity.name.class`
///  * self, e.g. `$self`
///  * base, e.g. `$base`
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Include {
    /// A rule of the same grammar
    Rule(RuleId),
    /// Root rule of the grammar containing the include
    SelfRoot,
    /// Root rule of the grammar the tokenizer started with
    Base,
    /// Another grammar, resolved by the tokenizer through the registry.
    /// Contributes nothing if that grammar is not loaded.
    External {
        scope_name: String,
        entry: Option<String>,
    },
    /// `#name` before the resolution pass, never present in a compiled grammar
    Local {
        name: String,
        repository_stack: RepositoryStack,
    },
}

/// A rule `name`/`contentName`.
/// Names can refer to captures of the match (`entity.name.$1`), those are resolved
/// when the rule matches.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ScopeName {
    raw: String,
    /// Pre-parsed scopes when the name has no capture reference
    scopes: Option<Vec<Scope>>,
}

impl ScopeName {
    fn new(raw: Option<String>) -> Option<Self> {
        let raw = raw?;
        if raw.trim().is_empty() {
            return None;
        }
        let scopes = if raw.contains('$') {
            None
        } else {
            Some(parse_scopes(&raw))
        };
        Some(Self { raw, scopes })
    }

    pub fn resolve(&self, line: &str, captures: &[Option<(usize, usize)>]) -> Vec<Scope> {
        match &self.scopes {
            Some(scopes) => scopes.clone(),
            None => parse_scopes(&substitute_captures(&self.raw, line, captures)),
        }
    }
}

/// Replaces `$1` and `${1:/downcase}`/`${1:/upcase}` by the captured text
fn substitute_captures(name: &str, line: &str, captures: &[Option<(usize, usize)>]) -> String {
    let captured = |group: usize| -> &str {
        match captures.get(group) {
            Some(Some((start, end))) => line[*start..*end].trim_start_matches('.'),
            _ => "",
        }
    };

    let mut out = String::with_capacity(name.len());
    let mut rest = name;

    while let Some(dollar) = rest.find('$') {
        out.push_str(&rest[..dollar]);
        let after = &rest[dollar + 1..];

        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        if digits > 0 {
            let group = after[..digits].parse().unwrap_or(usize::MAX);
            out.push_str(captured(group));
            rest = &after[digits..];
            continue;
        }

        if let Some(inner) = after.strip_prefix('{')
            && let Some(close) = inner.find('}')
            && let Some((group, command)) = inner[..close].split_once(":/")
            && let Ok(group) = group.parse::<usize>()
        {
            match command {
                "downcase" => out.push_str(&captured(group).to_lowercase()),
                "upcase" => out.push_str(&captured(group).to_uppercase()),
                _ => out.push_str(captured(group)),
            }
            rest = &inner[close + 1..];
            continue;
        }

        out.push('$');
        rest = after;
    }
    out.push_str(rest);
    out
}

#[derive(Debug, Clone)]
pub struct Match {
    pub name: Option<ScopeName>,
    /// None for scope-only rules: captures that only assign a scope
    pub regex_id: Option<RegexId>,
    pub captures: Vec<Option<RuleId>>,
}

#[derive(Debug, Clone)]
pub struct IncludeOnly {
    pub name: Option<ScopeName>,
    pub content_name: Option<ScopeName>,
    pub patterns: Vec<Include>,
}

#[derive(Debug, Clone)]
pub struct BeginEnd {
    pub name: Option<ScopeName>,
    pub content_name: Option<ScopeName>,
    pub begin: RegexId,
    pub begin_captures: Vec<Option<RuleId>>,
    pub end: RegexId,
    pub end_has_backrefs: bool,
    pub end_captures: Vec<Option<RuleId>>,
    pub apply_end_pattern_last: bool,
    pub patterns: Vec<Include>,
}

#[derive(Debug, Clone)]
pub struct BeginWhile {
    pub name: Option<ScopeName>,
    pub content_name: Option<ScopeName>,
    pub begin: RegexId,
    pub begin_captures: Vec<Option<RuleId>>,
    pub while_: RegexId,
    pub while_has_backrefs: bool,
    pub while_captures: Vec<Option<RuleId>>,
    pub patterns: Vec<Include>,
}

#[derive(Debug, Clone)]
pub enum Rule {
    Match(Match),
    IncludeOnly(IncludeOnly),
    BeginEnd(BeginEnd),
    BeginWhile(BeginWhile),
    /// Empty or disabled rule
    Noop,
}

impl Rule {
    fn name(&self) -> Option<&ScopeName> {
        match self {
            Rule::Match(r) => r.name.as_ref(),
            Rule::IncludeOnly(r) => r.name.as_ref(),
            Rule::BeginEnd(r) => r.name.as_ref(),
            Rule::BeginWhile(r) => r.name.as_ref(),
            Rule::Noop => None,
        }
    }

    fn content_name(&self) -> Option<&ScopeName> {
        match self {
            Rule::IncludeOnly(r) => r.content_name.as_ref(),
            Rule::BeginEnd(r) => r.content_name.as_ref(),
            Rule::BeginWhile(r) => r.content_name.as_ref(),
            Rule::Match(_) | Rule::Noop => None,
        }
    }

    /// Scopes from `name`, applied to the whole match including delimiters
    pub fn name_scopes(&self, line: &str, captures: &[Option<(usize, usize)>]) -> Vec<Scope> {
        self.name()
            .map(|n| n.resolve(line, captures))
            .unwrap_or_default()
    }

    /// Scopes from `contentName`, applied only between the delimiters
    pub fn content_scopes(&self, line: &str, captures: &[Option<(usize, usize)>]) -> Vec<Scope> {
        self.content_name()
            .map(|n| n.resolve(line, captures))
            .unwrap_or_default()
    }

    pub fn patterns(&self) -> &[Include] {
        match self {
            Rule::IncludeOnly(r) => &r.patterns,
            Rule::BeginEnd(r) => &r.patterns,
            Rule::BeginWhile(r) => &r.patterns,
            Rule::Match(_) | Rule::Noop => &[],
        }
    }

    fn patterns_mut(&mut self) -> Option<&mut Vec<Include>> {
        match self {
            Rule::IncludeOnly(r) => Some(&mut r.patterns),
            Rule::BeginEnd(r) => Some(&mut r.patterns),
            Rule::BeginWhile(r) => Some(&mut r.patterns),
            Rule::Match(_) | Rule::Noop => None,
        }
    }

    pub fn has_patterns(&self) -> bool {
        !self.patterns().is_empty()
    }
}

/// An immutable, compiled grammar.
///
/// Rules live in an arena and refer to each other by `RuleId` so self-including
/// grammars don't create ownership cycles.
#[derive(Debug, Clone)]
pub struct CompiledGrammar {
    pub id: GrammarId,
    pub name: String,
    pub display_name: Option<String>,
    pub scope_name: String,
    /// Scope given to every token of this grammar
    pub scope: Scope,
    pub file_types: Vec<String>,
    pub first_line_match: Option<Regex>,
    pub regexes: Vec<Regex>,
    pub rules: Vec<Rule>,
    pub repositories: Vec<Repository>,
    /// Scope names of other grammars referenced by includes
    pub external_scopes: Vec<String>,
    root_repository_stack: RepositoryStack,
}

impl CompiledGrammar {
    pub fn from_raw_grammar(raw: RawGrammar, id: GrammarId) -> TmResult<Self> {
        if raw.scope_name.trim().is_empty() {
            return Err(Error::malformed(&raw.name, "empty `scopeName`"));
        }

        let mut grammar = Self {
            id,
            name: raw.name,
            display_name: raw.display_name,
            scope: Scope::new(&raw.scope_name),
            scope_name: raw.scope_name,
            file_types: raw.file_types,
            first_line_match: None,
            regexes: Vec::new(),
            rules: Vec::new(),
            repositories: Vec::new(),
            external_scopes: Vec::new(),
            root_repository_stack: RepositoryStack::default(),
        };

        if let Some(pat) = raw.first_line_match {
            let re = Regex::new(pat);
            if let Err(e) = re.validate() {
                return Err(grammar.error(format!(
                    "invalid `firstLineMatch` {:?}: {e}",
                    re.pattern()
                )));
            }
            grammar.first_line_match = Some(re);
        }

        // The root rule is compiled first so its repository, if any, is the first one
        if !raw.repository.is_empty()
            && let Some(stack) = RepositoryStack::default().push(RepositoryId(0))
        {
            grammar.root_repository_stack = stack;
        }

        let root_rule = RawRule {
            patterns: raw.patterns,
            repository: raw.repository,
            ..Default::default()
        };
        let root_rule_id = grammar.compile_rule(root_rule, RepositoryStack::default())?;
        debug_assert_eq!(root_rule_id, ROOT_RULE_ID);

        grammar.resolve_local_includes()?;
        log::debug!(
            "Compiled grammar {} with {} rules and {} regexes",
            grammar.scope_name,
            grammar.rules.len(),
            grammar.regexes.len()
        );

        Ok(grammar)
    }

    pub fn rule(&self, id: RuleId) -> &Rule {
        &self.rules[id.as_index()]
    }

    pub fn regex(&self, id: RegexId) -> &Regex {
        &self.regexes[id.as_index()]
    }

    /// Looks up an entry of the top-level repository, used by `source.x#entry` includes
    pub fn repository_entry(&self, name: &str) -> Option<RuleId> {
        self.lookup(name, self.root_repository_stack)
    }

    /// Whether this grammar declares the extension of that path in its `fileTypes`
    pub fn handles_file_type(&self, path: &std::path::Path) -> bool {
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        self.file_types
            .iter()
            .any(|ft| ft == extension || ft == file_name)
    }

    fn error(&self, reason: impl Into<String>) -> Error {
        Error::malformed(&self.scope_name, reason)
    }

    fn lookup(&self, name: &str, repository_stack: RepositoryStack) -> Option<RuleId> {
        repository_stack
            .iter()
            .find_map(|repo_id| self.repositories[repo_id.0 as usize].get(name))
    }

    fn compile_rule(
        &mut self,
        raw_rule: RawRule,
        repository_stack: RepositoryStack,
    ) -> TmResult<RuleId> {
        let id = RuleId(self.rules.len() as u32);

        // push a no-op to reserve its spot
        self.rules.push(Rule::Noop);
        if raw_rule.disabled {
            return Ok(id);
        }

        let name = ScopeName::new(raw_rule.name);
        let content_name = ScopeName::new(raw_rule.content_name);

        // https://github.com/microsoft/vscode-textmate/blob/f03a6a8790af81372d0e81facae75554ec5e97ef/src/rule.ts#L389-L447
        let rule = if let Some(pat) = raw_rule.match_ {
            Rule::Match(Match {
                name,
                regex_id: Some(self.compile_regex(pat, false)?),
                captures: self.compile_captures(raw_rule.captures, repository_stack)?,
            })
        } else if let Some(begin_pat) = raw_rule.begin {
            let begin = self.compile_regex(begin_pat, false)?;
            let begin_captures = if raw_rule.begin_captures.is_empty() {
                raw_rule.captures.clone()
            } else {
                raw_rule.begin_captures
            };

            if let Some(while_pat) = raw_rule.while_ {
                let while_captures = if raw_rule.while_captures.is_empty() {
                    raw_rule.captures
                } else {
                    raw_rule.while_captures
                };
                let while_ = self.compile_regex(while_pat, true)?;
                Rule::BeginWhile(BeginWhile {
                    name,
                    content_name,
                    begin,
                    begin_captures: self.compile_captures(begin_captures, repository_stack)?,
                    while_,
                    while_has_backrefs: self.regex(while_).has_backreferences(),
                    while_captures: self.compile_captures(while_captures, repository_stack)?,
                    patterns: self.compile_patterns(raw_rule.patterns, repository_stack)?,
                })
            } else if let Some(end_pat) = raw_rule.end {
                let end_captures = if raw_rule.end_captures.is_empty() {
                    raw_rule.captures
                } else {
                    raw_rule.end_captures
                };
                let end = self.compile_regex(end_pat, true)?;
                Rule::BeginEnd(BeginEnd {
                    name,
                    content_name,
                    begin,
                    begin_captures: self.compile_captures(begin_captures, repository_stack)?,
                    end,
                    end_has_backrefs: self.regex(end).has_backreferences(),
                    end_captures: self.compile_captures(end_captures, repository_stack)?,
                    apply_end_pattern_last: raw_rule.apply_end_pattern_last,
                    patterns: self.compile_patterns(raw_rule.patterns, repository_stack)?,
                })
            } else {
                return Err(self.error(format!(
                    "rule with `begin` {:?} has neither `end` nor `while`",
                    self.regex(begin).pattern()
                )));
            }
        } else {
            let repository_stack = if raw_rule.repository.is_empty() {
                repository_stack
            } else {
                self.compile_repository(raw_rule.repository, repository_stack)?
            };

            // vscode-textmate moves a lone `include` into `patterns`,
            // but ignores it if `patterns` is also present
            // https://github.com/microsoft/vscode-textmate/blob/f03a6a8790af81372d0e81facae75554ec5e97ef/src/rule.ts#L404
            let patterns = if raw_rule.patterns.is_empty() {
                match raw_rule.include {
                    Some(include) => vec![RawRule {
                        include: Some(include),
                        ..Default::default()
                    }],
                    None => Vec::new(),
                }
            } else {
                raw_rule.patterns
            };

            if patterns.is_empty() {
                if name.is_some() {
                    // Scope-only rule, eg a capture that only assigns a scope
                    Rule::Match(Match {
                        name,
                        regex_id: None,
                        captures: Vec::new(),
                    })
                } else {
                    Rule::Noop
                }
            } else {
                Rule::IncludeOnly(IncludeOnly {
                    name,
                    content_name,
                    patterns: self.compile_patterns(patterns, repository_stack)?,
                })
            }
        };

        self.rules[id.as_index()] = rule;
        Ok(id)
    }

    /// End/while patterns can refer to the begin captures and are only complete at runtime
    fn compile_regex(&mut self, pattern: String, may_have_backrefs: bool) -> TmResult<RegexId> {
        let re = Regex::new(pattern);
        if !(may_have_backrefs && re.has_backreferences())
            && let Err(e) = re.validate()
        {
            return Err(self.error(format!("invalid regex {:?}: {e}", re.pattern())));
        }

        let regex_id = RegexId(self.regexes.len() as u32);
        self.regexes.push(re);
        Ok(regex_id)
    }

    fn compile_repository(
        &mut self,
        raw_repository: HashMap<String, RawRule>,
        repository_stack: RepositoryStack,
    ) -> TmResult<RepositoryStack> {
        let repo_id = RepositoryId(self.repositories.len() as u32);
        self.repositories.push(Repository::default());
        let stack = repository_stack.push(repo_id).ok_or_else(|| {
            self.error(format!(
                "repositories nested deeper than {MAX_REPOSITORY_DEPTH} levels"
            ))
        })?;

        let mut rules = HashMap::with_capacity(raw_repository.len());
        for (name, raw_rule) in raw_repository {
            let rule_id = self.compile_rule(raw_rule, stack)?;
            rules.insert(name, rule_id);
        }

        self.repositories[repo_id.0 as usize] = Repository(rules);
        Ok(stack)
    }

    fn compile_captures(
        &mut self,
        captures: Captures,
        repository_stack: RepositoryStack,
    ) -> TmResult<Vec<Option<RuleId>>> {
        let Some(max_capture) = captures.keys().max().copied() else {
            return Ok(Vec::new());
        };

        let mut out = vec![None; max_capture + 1];
        for (group, rule) in captures.0 {
            out[group] = Some(self.compile_rule(rule, repository_stack)?);
        }

        Ok(out)
    }

    fn compile_patterns(
        &mut self,
        rules: Vec<RawRule>,
        repository_stack: RepositoryStack,
    ) -> TmResult<Vec<Include>> {
        let mut out = Vec::with_capacity(rules.len());

        for r in rules {
            if let Some(include) = r.include {
                // vscode ignores other rule contents if there's an include
                // https://github.com/microsoft/vscode-textmate/blob/f03a6a8790af81372d0e81facae75554ec5e97ef/src/rule.ts#L495
                out.push(self.parse_include(&include, repository_stack)?);
            } else {
                out.push(Include::Rule(self.compile_rule(r, repository_stack)?));
            }
        }

        Ok(out)
    }

    fn parse_include(
        &mut self,
        include: &str,
        repository_stack: RepositoryStack,
    ) -> TmResult<Include> {
        let include = include.trim();
        let (scope_name, entry) = match include.split_once('#') {
            Some((scope, entry)) => (scope, Some(entry)),
            None => (include, None),
        };

        let out = match (scope_name, entry) {
            ("", None) | (_, Some("")) => {
                return Err(self.error(format!("invalid include {include:?}")));
            }
            ("$self", None) => Include::SelfRoot,
            ("$base", None) => Include::Base,
            ("", Some(name)) => Include::Local {
                name: name.to_owned(),
                repository_stack,
            },
            (scope, None) if scope == self.scope_name => Include::SelfRoot,
            (scope, Some(name)) if scope == self.scope_name => Include::Local {
                name: name.to_owned(),
                repository_stack: self.root_repository_stack,
            },
            (scope, entry) => {
                if !self.external_scopes.iter().any(|s| s == scope) {
                    self.external_scopes.push(scope.to_owned());
                }
                Include::External {
                    scope_name: scope.to_owned(),
                    entry: entry.map(|e| e.to_owned()),
                }
            }
        };
        Ok(out)
    }

    /// Turns every `#name` include into a rule id now that all the repositories exist.
    /// Doing it after the fact is what allows repository entries to include each other.
    fn resolve_local_includes(&mut self) -> TmResult<()> {
        for idx in 0..self.rules.len() {
            let Some(patterns) = self.rules[idx].patterns_mut() else {
                continue;
            };
            let mut patterns = std::mem::take(patterns);

            for include in patterns.iter_mut() {
                if let Include::Local {
                    name,
                    repository_stack,
                } = include
                {
                    let rule_id = self.lookup(name, *repository_stack).ok_or_else(|| {
                        self.error(format!("unresolved include \"#{name}\""))
                    })?;
                    *include = Include::Rule(rule_id);
                }
            }

            if let Some(slot) = self.rules[idx].patterns_mut() {
                *slot = patterns;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(json: &str) -> TmResult<CompiledGrammar> {
        RawGrammar::from_json_str(json)?.compile(GrammarId(0))
    }

    fn assert_malformed(json: &str, needle: &str) {
        match compile(json) {
            Err(Error::MalformedGrammar { reason, .. }) => {
                assert!(reason.contains(needle), "unexpected reason: {reason}")
            }
            other => panic!("expected a malformed grammar error, got {other:?}"),
        }
    }

    #[test]
    fn compiles_rule_kinds() {
        let grammar = compile(
            r##"{
                "scopeName": "source.demo",
                "patterns": [
                    {"match": "foo", "name": "kw.foo"},
                    {"begin": "\"", "end": "\"", "name": "string.quoted", "contentName": "string.content"},
                    {"begin": "^>", "while": "^>", "name": "markup.quote"},
                    {"include": "#things"}
                ],
                "repository": {
                    "things": {"patterns": [{"match": "bar"}]}
                }
            }"##,
        )
        .unwrap();

        let Rule::IncludeOnly(root) = grammar.rule(ROOT_RULE_ID) else {
            panic!("root should be an include-only rule");
        };
        assert_eq!(root.patterns.len(), 4);
        let kinds: Vec<_> = root
            .patterns
            .iter()
            .map(|p| match p {
                Include::Rule(id) => match grammar.rule(*id) {
                    Rule::Match(_) => "match",
                    Rule::BeginEnd(_) => "begin_end",
                    Rule::BeginWhile(_) => "begin_while",
                    Rule::IncludeOnly(_) => "include_only",
                    Rule::Noop => "noop",
                },
                _ => "reference",
            })
            .collect();
        assert_eq!(kinds, vec!["match", "begin_end", "begin_while", "include_only"]);
        assert_eq!(grammar.scope, Scope::new("source.demo"));
        assert!(grammar.external_scopes.is_empty());
    }

    #[test]
    fn begin_without_end_is_malformed() {
        assert_malformed(
            r#"{"scopeName": "source.demo", "patterns": [{"begin": "a", "name": "x"}]}"#,
            "neither `end` nor `while`",
        );
    }

    #[test]
    fn unresolved_local_include_is_malformed() {
        assert_malformed(
            r##"{"scopeName": "source.demo", "patterns": [{"include": "#missing"}]}"##,
            "#missing",
        );
    }

    #[test]
    fn invalid_regex_is_malformed() {
        assert_malformed(
            r#"{"scopeName": "source.demo", "patterns": [{"match": "a(+"}]}"#,
            "invalid regex",
        );
    }

    #[test]
    fn empty_scope_name_is_malformed() {
        assert!(matches!(
            compile(r#"{"name": "nope", "scopeName": " "}"#),
            Err(Error::MalformedGrammar { .. })
        ));
    }

    #[test]
    fn end_backreferences_are_not_validated_ahead() {
        let grammar = compile(
            r#"{"scopeName": "source.demo", "patterns": [{"begin": "<<(\\w+)", "end": "^\\1$"}]}"#,
        )
        .unwrap();
        let Rule::BeginEnd(rule) = &grammar.rules[1] else {
            panic!("expected begin/end");
        };
        assert!(rule.end_has_backrefs);
    }

    #[test]
    fn mutually_recursive_repository_entries() {
        let grammar = compile(
            r##"{
                "scopeName": "source.demo",
                "patterns": [{"include": "#a"}],
                "repository": {
                    "a": {"begin": "\\(", "end": "\\)", "patterns": [{"include": "#b"}]},
                    "b": {"begin": "\\[", "end": "\\]", "patterns": [{"include": "#a"}, {"include": "$self"}]}
                }
            }"##,
        )
        .unwrap();

        for rule in &grammar.rules {
            for include in rule.patterns() {
                assert!(!matches!(include, Include::Local { .. }));
            }
        }
    }

    #[test]
    fn nested_repositories_shadow_outer_ones() {
        let grammar = compile(
            r##"{
                "scopeName": "source.demo",
                "patterns": [{"include": "#outer"}],
                "repository": {
                    "item": {"match": "top", "name": "top"},
                    "outer": {
                        "patterns": [{"include": "#item"}],
                        "repository": {"item": {"match": "inner", "name": "inner"}}
                    }
                }
            }"##,
        )
        .unwrap();

        let outer = grammar.repository_entry("outer").unwrap();
        let Include::Rule(item) = grammar.rule(outer).patterns()[0] else {
            panic!("expected a resolved include");
        };
        let Rule::Match(m) = grammar.rule(item) else {
            panic!("expected a match rule");
        };
        assert_eq!(grammar.regex(m.regex_id.unwrap()).pattern(), "inner");
    }

    #[test]
    fn external_and_self_includes() {
        let grammar = compile(
            r##"{
                "scopeName": "source.demo",
                "patterns": [
                    {"include": "source.other"},
                    {"include": "source.other#entry"},
                    {"include": "source.demo"},
                    {"include": "source.demo#local"},
                    {"include": "$base"}
                ],
                "repository": {"local": {"match": "x"}}
            }"##,
        )
        .unwrap();

        assert_eq!(grammar.external_scopes, vec!["source.other".to_string()]);
        let patterns = grammar.rule(ROOT_RULE_ID).patterns();
        assert_eq!(
            patterns[1],
            Include::External {
                scope_name: "source.other".to_owned(),
                entry: Some("entry".to_owned())
            }
        );
        assert_eq!(patterns[2], Include::SelfRoot);
        assert_eq!(
            patterns[3],
            Include::Rule(grammar.repository_entry("local").unwrap())
        );
        assert_eq!(patterns[4], Include::Base);
    }

    #[test]
    fn disabled_rules_are_noops() {
        let grammar = compile(
            r#"{"scopeName": "source.demo", "patterns": [{"match": "x", "disabled": 1}]}"#,
        )
        .unwrap();
        assert!(matches!(grammar.rules[1], Rule::Noop));
    }

    #[test]
    fn captures_fall_back_to_generic_captures() {
        let grammar = compile(
            r#"{"scopeName": "source.demo", "patterns": [
                {"begin": "(a)", "end": "(b)", "captures": {"1": {"name": "delim"}}, "endCaptures": {"0": {"name": "close"}}}
            ]}"#,
        )
        .unwrap();
        let Rule::BeginEnd(rule) = &grammar.rules[1] else {
            panic!("expected begin/end");
        };
        assert_eq!(rule.begin_captures.len(), 2);
        assert!(rule.begin_captures[1].is_some());
        assert_eq!(rule.end_captures.len(), 1);
    }

    #[test]
    fn substitutes_captures_in_names() {
        let line = "def Foo";
        let captures = vec![Some((0, 7)), Some((0, 3)), Some((4, 7))];
        assert_eq!(
            substitute_captures("entity.$2.${1:/upcase}", line, &captures),
            "entity.Foo.DEF"
        );
        assert_eq!(substitute_captures("a.$9.b$", line, &captures), "a..b$");
        let name = ScopeName::new(Some("meta.$1 other".to_owned())).unwrap();
        assert_eq!(
            name.resolve(line, &captures),
            vec![Scope::new("meta.def"), Scope::new("other")]
        );
    }

    #[test]
    fn matches_file_types() {
        let grammar = compile(
            r#"{"scopeName": "source.demo", "fileTypes": ["demo", "Demofile"]}"#,
        )
        .unwrap();
        assert!(grammar.handles_file_type(std::path::Path::new("a/b.demo")));
        assert!(grammar.handles_file_type(std::path::Path::new("Demofile")));
        assert!(!grammar.handles_file_type(std::path::Path::new("b.rs")));
    }
}
