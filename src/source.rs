//! Where the registry gets grammars from.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::TmResult;
use crate::grammars::RawGrammar;

/// Provides the raw grammar for a scope name, eg "source.js".
///
/// Sources are only asked for grammars that aren't loaded yet and at most once at a time
/// per scope name.
pub trait GrammarSource: Send + Sync {
    /// `Ok(None)` if the source doesn't know that scope
    fn raw_grammar(&self, scope_name: &str) -> TmResult<Option<RawGrammar>>;
}

/// Only what's needed to index a grammar without parsing all its rules
#[derive(Deserialize)]
#[serde(rename_all(deserialize = "camelCase"))]
struct GrammarHeader {
    #[serde(default)]
    scope_name: String,
}

pub(crate) fn scope_name_of(json: &str) -> TmResult<String> {
    let header: GrammarHeader = serde_json::from_str(json)?;
    Ok(header.scope_name)
}

/// All the `*.json` grammars of a directory, indexed by their `scopeName`.
/// Files are parsed again when a grammar is requested.
#[derive(Debug, Clone, Default)]
pub struct DirectorySource {
    paths: HashMap<String, PathBuf>,
}

impl DirectorySource {
    pub fn open(dir: impl AsRef<Path>) -> TmResult<Self> {
        let mut paths = HashMap::new();

        for entry in fs::read_dir(dir.as_ref())? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    log::warn!("Ignoring {}: {e}", path.display());
                    continue;
                }
            };
            match scope_name_of(&content) {
                Ok(scope_name) if !scope_name.is_empty() => {
                    if let Some(previous) = paths.insert(scope_name.clone(), path.clone()) {
                        log::warn!(
                            "{} and {} both define {scope_name}, using the latter",
                            previous.display(),
                            path.display()
                        );
                    }
                }
                Ok(_) => log::warn!("Ignoring {}: no scopeName", path.display()),
                Err(e) => log::warn!("Ignoring {}: {e}", path.display()),
            }
        }

        log::debug!(
            "Found {} grammars in {}",
            paths.len(),
            dir.as_ref().display()
        );
        Ok(Self { paths })
    }

    pub fn scope_names(&self) -> impl Iterator<Item = &str> {
        self.paths.keys().map(|s| s.as_str())
    }

    pub fn path_of(&self, scope_name: &str) -> Option<&Path> {
        self.paths.get(scope_name).map(|p| p.as_path())
    }
}

impl GrammarSource for DirectorySource {
    fn raw_grammar(&self, scope_name: &str) -> TmResult<Option<RawGrammar>> {
        match self.paths.get(scope_name) {
            Some(path) => Ok(Some(RawGrammar::load_from_file(path)?)),
            None => Ok(None),
        }
    }
}

/// Grammar JSON documents kept in memory, indexed by their `scopeName`.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    documents: HashMap<String, String>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_json(mut self, json: impl Into<String>) -> TmResult<Self> {
        self.insert(json)?;
        Ok(self)
    }

    /// Adds a grammar document, replacing any other one with the same scope name.
    /// Only its header is parsed here.
    pub fn insert(&mut self, json: impl Into<String>) -> TmResult<String> {
        let json = json.into();
        let scope_name = scope_name_of(&json)?;
        self.documents.insert(scope_name.clone(), json);
        Ok(scope_name)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub(crate) fn into_documents(self) -> HashMap<String, String> {
        self.documents
    }
}

impl GrammarSource for MemorySource {
    fn raw_grammar(&self, scope_name: &str) -> TmResult<Option<RawGrammar>> {
        match self.documents.get(scope_name) {
            Some(json) => Ok(Some(RawGrammar::from_json_str(json)?)),
            None => Ok(None),
        }
    }
}
