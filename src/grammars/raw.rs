use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::BufReader;
use std::ops::Deref;
use std::path::Path;

use serde::{Deserialize, Deserializer};

use crate::error::TmResult;
use crate::grammars::compiled::{CompiledGrammar, GrammarId};

/// Some grammars write flags as booleans, others as 0/1
fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
        Str(String),
    }

    Ok(match Option::<Flag>::deserialize(deserializer)? {
        Some(Flag::Bool(b)) => b,
        Some(Flag::Int(i)) => i != 0,
        Some(Flag::Str(s)) => matches!(s.as_str(), "1" | "true"),
        None => false,
    })
}

/// Capture group number -> rule applied to that group.
///
/// ```json
/// {
///   "1": { "name": "storage.type.function.js" },
///   "2": { "name": "entity.name.function.js" }
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct Captures(pub BTreeMap<usize, RawRule>);

impl Deref for Captures {
    type Target = BTreeMap<usize, RawRule>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de> Deserialize<'de> for Captures {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<String, RawRule>::deserialize(deserializer)?;
        let mut out = BTreeMap::new();
        for (key, rule) in raw {
            match key.trim().parse::<usize>() {
                Ok(group) => {
                    out.insert(group, rule);
                }
                Err(_) => log::warn!("Ignoring capture with non-numeric key {key:?}"),
            }
        }
        Ok(Captures(out))
    }
}

/// A single rule as written in a grammar file.
///
/// Like vscode-textmate, we don't use an enum here: what a rule is depends on which
/// fields are set and some grammars set fields that don't make sense together.
/// The compiler decides:
/// - `include` -> reference to another rule
/// - `match` -> single regex rule
/// - `begin` + `end` / `begin` + `while` -> span rule
/// - `patterns` -> container of rules
/// - only `name` -> scope-only rule, used in captures
///
/// ```json
/// {
///   "name": "string.quoted.double.js",
///   "begin": "\"",
///   "end": "\"",
///   "beginCaptures": { "0": { "name": "punctuation.definition.string.begin.js" } },
///   "patterns": [{ "match": "\\\\.", "name": "constant.character.escape.js" }]
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all(deserialize = "camelCase"))]
pub struct RawRule {
    /// `#name`, `$self`, `$base`, `source.lang` or `source.lang#name`
    pub include: Option<String>,
    pub name: Option<String>,
    pub content_name: Option<String>,
    #[serde(rename(deserialize = "match"))]
    pub match_: Option<String>,
    pub captures: Captures,
    pub begin: Option<String>,
    pub begin_captures: Captures,
    pub end: Option<String>,
    pub end_captures: Captures,
    #[serde(rename(deserialize = "while"))]
    pub while_: Option<String>,
    pub while_captures: Captures,
    pub patterns: Vec<RawRule>,
    pub repository: HashMap<String, RawRule>,
    /// Whether the end pattern is tried after the nested patterns instead of before
    #[serde(deserialize_with = "deserialize_flag")]
    pub apply_end_pattern_last: bool,
    /// Disabled rules are compiled as no-ops
    #[serde(deserialize_with = "deserialize_flag")]
    pub disabled: bool,
}

/// Top-level structure of a TextMate grammar file
///
/// ```json
/// {
///   "name": "JavaScript",
///   "scopeName": "source.js",
///   "fileTypes": ["js", "mjs"],
///   "firstLineMatch": "^#!.*\\bnode\\b",
///   "patterns": [{ "include": "#statements" }],
///   "repository": { "statements": { "patterns": [] } }
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all(deserialize = "camelCase"))]
pub struct RawGrammar {
    /// Human-readable name of the language
    pub name: String,
    pub display_name: Option<String>,
    /// Unique identifier of the grammar, eg "source.js"
    pub scope_name: String,
    /// File extensions this grammar applies to
    pub file_types: Vec<String>,
    /// Regex identifying files by their first line, eg a shebang
    pub first_line_match: Option<String>,
    pub uuid: Option<String>,
    /// Named rules that can be referenced by includes
    pub repository: HashMap<String, RawRule>,
    /// Root patterns
    pub patterns: Vec<RawRule>,
}

impl RawGrammar {
    pub fn from_json_str(json: &str) -> TmResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> TmResult<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// Compile this raw grammar, `id` being the one given by the registry
    pub fn compile(self, id: GrammarId) -> TmResult<CompiledGrammar> {
        CompiledGrammar::from_raw_grammar(self, id)
    }
}
