//! Grammar bundles: many grammar documents packed in a single compressed file,
//! so an application can ship its grammars as one asset.

use std::collections::HashMap;
use std::path::Path;

use crate::error::TmResult;
use crate::grammars::RawGrammar;
use crate::source::{DirectorySource, GrammarSource, MemorySource, scope_name_of};

const ZSTD_LEVEL: i32 = 19;

/// Grammar JSON documents by scope name, encoded with bitcode and compressed with zstd.
///
/// Documents are kept as JSON and only parsed when the registry asks for them.
#[derive(Debug, Clone, Default)]
pub struct GrammarBundle {
    documents: HashMap<String, String>,
}

impl GrammarBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a grammar document, returning its scope name
    pub fn insert(&mut self, json: impl Into<String>) -> TmResult<String> {
        let json = json.into();
        let scope_name = scope_name_of(&json)?;
        self.documents.insert(scope_name.clone(), json);
        Ok(scope_name)
    }

    /// Bundles every grammar found by a directory source
    pub fn from_directory(source: &DirectorySource) -> TmResult<Self> {
        let mut bundle = Self::new();
        for scope_name in source.scope_names() {
            if let Some(path) = source.path_of(scope_name) {
                bundle.insert(std::fs::read_to_string(path)?)?;
            }
        }
        Ok(bundle)
    }

    pub fn scope_names(&self) -> impl Iterator<Item = &str> {
        self.documents.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn to_bytes(&self) -> TmResult<Vec<u8>> {
        let encoded = bitcode::serialize(&self.documents)?;
        Ok(zstd::encode_all(encoded.as_slice(), ZSTD_LEVEL)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> TmResult<Self> {
        let decoded = zstd::decode_all(bytes)?;
        let documents: HashMap<String, String> = bitcode::deserialize(&decoded)?;
        Ok(Self { documents })
    }

    pub fn write_to_file(&self, path: impl AsRef<Path>) -> TmResult<()> {
        let bytes = self.to_bytes()?;
        std::fs::write(path.as_ref(), bytes)?;
        log::debug!(
            "Wrote {} grammars to {}",
            self.documents.len(),
            path.as_ref().display()
        );
        Ok(())
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> TmResult<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }
}

impl From<MemorySource> for GrammarBundle {
    fn from(source: MemorySource) -> Self {
        Self {
            documents: source.into_documents(),
        }
    }
}

impl GrammarSource for GrammarBundle {
    fn raw_grammar(&self, scope_name: &str) -> TmResult<Option<RawGrammar>> {
        match self.documents.get(scope_name) {
            Some(json) => Ok(Some(RawGrammar::from_json_str(json)?)),
            None => Ok(None),
        }
    }
}
