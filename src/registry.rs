use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use crate::cache::{FileCache, FileTokens, file_stamp};
use crate::error::{Error, TmResult};
use crate::grammars::{CompiledGrammar, GrammarId, RawGrammar};
use crate::source::GrammarSource;
use crate::tokenizer::{Token, Tokenizer};

/// Scope name of the grammar used when nothing better is available: it matches nothing
pub const PLAIN_SCOPE_NAME: &str = "text.plain";

type LoadResult = TmResult<Arc<CompiledGrammar>>;

/// A grammar load, shared by everyone asking for that scope while it's in progress
type Slot = Arc<OnceLock<LoadResult>>;

/// The main struct in tmlex.
///
/// Loads grammars from its source on demand, compiles them and keeps them for its lifetime.
/// All methods take `&self`: a registry can be shared between threads and grammars requested
/// by several threads at once are only compiled once.
pub struct Registry {
    source: Option<Box<dyn GrammarSource>>,
    /// scope name -> grammar, once loaded or while loading
    slots: papaya::HashMap<String, Slot>,
    /// Compiled grammars by id, what the tokenizer uses to follow stack frames
    by_id: papaya::HashMap<GrammarId, Arc<CompiledGrammar>>,
    next_id: AtomicU32,
    /// Results of `tokenize_file`
    file_cache: FileCache,
}

impl Default for Registry {
    /// A registry without source: grammars need to be added explicitly
    fn default() -> Self {
        Self {
            source: None,
            slots: papaya::HashMap::new(),
            by_id: papaya::HashMap::new(),
            next_id: AtomicU32::new(0),
            file_cache: FileCache::default(),
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("has_source", &self.source.is_some())
            .field("grammars", &self.by_id.len())
            .field("cached_files", &self.file_cache.len())
            .finish()
    }
}

impl Registry {
    pub fn new(source: impl GrammarSource + 'static) -> Self {
        Self {
            source: Some(Box::new(source)),
            ..Default::default()
        }
    }

    /// Returns the grammar for that scope name, loading it from the source if needed.
    ///
    /// The external grammars it includes are then loaded as well, if the source knows them.
    /// A failed load is not remembered: asking again will retry.
    pub fn load_grammar(&self, scope_name: &str) -> TmResult<Arc<CompiledGrammar>> {
        let mut visited = HashSet::from([scope_name.to_owned()]);
        self.load_grammar_inner(scope_name, &mut visited)
    }

    fn load_grammar_inner(
        &self,
        scope_name: &str,
        visited: &mut HashSet<String>,
    ) -> TmResult<Arc<CompiledGrammar>> {
        let slot = self
            .slots
            .pin()
            .get_or_insert_with(scope_name.to_owned(), || Arc::new(OnceLock::new()))
            .clone();

        let mut loaded_here = false;
        let result = slot
            .get_or_init(|| {
                loaded_here = true;
                self.compile_from_source(scope_name)
            })
            .clone();

        match result {
            Ok(grammar) => {
                if !loaded_here {
                    log::trace!("Grammar {scope_name} already loaded");
                }
                // Also done by callers that found the grammar loaded: its includes may still
                // be loading on another thread and this waits for them
                self.load_dependencies(&grammar, visited, loaded_here);
                Ok(grammar)
            }
            Err(e) => {
                if loaded_here {
                    log::debug!("Failed to load grammar {scope_name}: {e}");
                }
                self.evict(scope_name, &slot);
                Err(e)
            }
        }
    }

    fn compile_from_source(&self, scope_name: &str) -> LoadResult {
        let raw = match &self.source {
            Some(source) => source.raw_grammar(scope_name)?,
            None => None,
        };
        let raw = raw.ok_or_else(|| Error::GrammarNotFound(scope_name.to_owned()))?;
        self.publish(raw)
    }

    /// Compiles with a fresh id and makes it reachable by id
    fn publish(&self, raw: RawGrammar) -> LoadResult {
        let id = GrammarId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let grammar = Arc::new(raw.compile(id)?);
        self.by_id.pin().insert(id, grammar.clone());
        log::debug!("Loaded grammar {} with id {}", grammar.scope_name, id.0);
        Ok(grammar)
    }

    /// Removes a failed slot so the next call retries, unless it was already replaced
    fn evict(&self, scope_name: &str, slot: &Slot) {
        let slots = self.slots.pin();
        if slots
            .get(scope_name)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            slots.remove(scope_name);
        }
    }

    /// Best effort: a grammar works without the grammars it includes, those patterns just
    /// never match
    fn load_dependencies(
        &self,
        grammar: &CompiledGrammar,
        visited: &mut HashSet<String>,
        first_load: bool,
    ) {
        for scope_name in &grammar.external_scopes {
            if !visited.insert(scope_name.clone()) {
                continue;
            }
            match self.load_grammar_inner(scope_name, visited) {
                Ok(_) => (),
                Err(e) if first_load => log::warn!(
                    "Grammar {} includes {scope_name} which could not be loaded: {e}",
                    grammar.scope_name
                ),
                Err(e) => log::debug!("Include {scope_name} still unavailable: {e}"),
            }
        }
    }

    /// Adds a grammar directly, without going through the source
    pub fn add_grammar(&self, raw: RawGrammar) -> TmResult<Arc<CompiledGrammar>> {
        let scope_name = raw.scope_name.clone();
        if self.loaded_grammar(&scope_name).is_some() {
            return Err(Error::DuplicateGrammar(scope_name));
        }

        let grammar = self.publish(raw)?;
        let slot = self
            .slots
            .pin()
            .get_or_insert_with(scope_name.clone(), || Arc::new(OnceLock::new()))
            .clone();
        if slot.set(Ok(grammar.clone())).is_err() {
            // someone else loaded or added it in the meantime
            self.by_id.pin().remove(&grammar.id);
            return Err(Error::DuplicateGrammar(scope_name));
        }

        let mut visited = HashSet::from([scope_name]);
        self.load_dependencies(&grammar, &mut visited, true);
        Ok(grammar)
    }

    /// Reads the file and add it as a grammar.
    pub fn add_grammar_from_path(&self, path: impl AsRef<Path>) -> TmResult<Arc<CompiledGrammar>> {
        let raw = RawGrammar::load_from_file(path)?;
        self.add_grammar(raw)
    }

    /// Adds an empty grammar that will not match any token, with the `text.plain` scope.
    /// Useful as a fallback if the grammar is not found.
    pub fn add_plain_grammar(&self) -> TmResult<Arc<CompiledGrammar>> {
        if let Some(g) = self.loaded_grammar(PLAIN_SCOPE_NAME) {
            return Ok(g);
        }
        let raw = RawGrammar {
            name: "Plain Text".to_owned(),
            scope_name: PLAIN_SCOPE_NAME.to_owned(),
            ..Default::default()
        };
        match self.add_grammar(raw) {
            Err(Error::DuplicateGrammar(_)) => self.load_grammar(PLAIN_SCOPE_NAME),
            other => other,
        }
    }

    /// Like `load_grammar` but falls back to the plain grammar if nothing knows that scope
    pub fn load_grammar_or_plain(&self, scope_name: &str) -> TmResult<Arc<CompiledGrammar>> {
        match self.load_grammar(scope_name) {
            Err(Error::GrammarNotFound(_)) => {
                log::debug!("Grammar {scope_name} not found, using plain text");
                self.add_plain_grammar()
            }
            other => other,
        }
    }

    /// The grammar for that scope, if it's already loaded
    pub fn loaded_grammar(&self, scope_name: &str) -> Option<Arc<CompiledGrammar>> {
        self.slots
            .pin()
            .get(scope_name)
            .and_then(|slot| slot.get())
            .and_then(|res| res.as_ref().ok())
            .cloned()
    }

    pub fn grammar(&self, id: GrammarId) -> Option<Arc<CompiledGrammar>> {
        self.by_id.pin().get(&id).cloned()
    }

    /// All the grammars loaded so far, in load order
    pub fn grammars(&self) -> Vec<Arc<CompiledGrammar>> {
        let mut out: Vec<_> = self.by_id.pin().values().cloned().collect();
        out.sort_by_key(|g| g.id);
        out
    }

    /// First loaded grammar declaring the extension or file name of `path` in its `fileTypes`
    pub fn grammar_for_path(&self, path: impl AsRef<Path>) -> Option<Arc<CompiledGrammar>> {
        self.grammars()
            .into_iter()
            .find(|g| g.handles_file_type(path.as_ref()))
    }

    /// First loaded grammar whose `firstLineMatch` matches that line, eg a shebang
    pub fn grammar_for_first_line(&self, line: &str) -> Option<Arc<CompiledGrammar>> {
        self.grammars().into_iter().find(|g| {
            g.first_line_match
                .as_ref()
                .and_then(|re| re.compiled())
                .is_some_and(|re| re.find(line).is_some())
        })
    }

    pub fn tokenizer(&self, grammar: Arc<CompiledGrammar>) -> Tokenizer<'_> {
        Tokenizer::new(grammar, self)
    }

    /// Tokenizes a whole text with the grammar of that scope
    pub fn tokenize(&self, scope_name: &str, text: &str) -> TmResult<Vec<Vec<Token>>> {
        let grammar = self.load_grammar(scope_name)?;
        self.tokenizer(grammar).tokenize_string(text)
    }

    /// Reads and tokenizes a file. The file must match the `fileTypes` of the grammar,
    /// if it declares any.
    ///
    /// Results are kept: tokenizing the same file with the same grammar again returns them
    /// as long as the file modification time didn't change.
    pub fn tokenize_file(
        &self,
        scope_name: &str,
        path: impl AsRef<Path>,
    ) -> TmResult<FileTokens> {
        let path = path.as_ref();
        let grammar = self.load_grammar(scope_name)?;
        if !grammar.file_types.is_empty() && !grammar.handles_file_type(path) {
            return Err(Error::IncompatibleFileType {
                path: path.display().to_string(),
                file_types: grammar.file_types.clone(),
            });
        }

        // Stamped before reading: a file modified in between is tokenized again next time
        let (path, modified) = file_stamp(path)?;
        if let Some(tokens) = self.file_cache.get(scope_name, &path, modified) {
            log::trace!("Reusing the tokens of {}", path.display());
            return Ok(tokens);
        }

        let text = std::fs::read_to_string(&path)?;
        let tokens = Arc::new(self.tokenizer(grammar).tokenize_string(&text)?);
        self.file_cache.insert(scope_name, path, modified, tokens.clone());
        Ok(tokens)
    }

    /// Forgets the results of `tokenize_file`
    pub fn clear_file_cache(&self) {
        self.file_cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::source::MemorySource;
    use crate::test_utils::registry_with;

    const OUTER: &str = r#"{
        "scopeName": "source.outer",
        "patterns": [{"include": "source.inner"}, {"include": "source.nowhere"}]
    }"#;
    const INNER: &str = r#"{
        "scopeName": "source.inner",
        "fileTypes": ["inr"],
        "firstLineMatch": "^#!.*inner",
        "patterns": [{"match": "i", "name": "inner.i"}, {"include": "source.outer"}]
    }"#;

    const SIMPLE: &str = r#"{"scopeName": "source.simple", "patterns": [{"match": "s"}]}"#;

    /// Counts how many times grammars are read and can fail on demand
    struct CountingSource {
        inner: MemorySource,
        reads: Arc<AtomicUsize>,
        failures_left: Mutex<usize>,
        slow_scope: Option<&'static str>,
    }

    impl CountingSource {
        fn new(docs: &[&str], failures: usize) -> Self {
            let mut inner = MemorySource::new();
            for doc in docs {
                inner.insert(*doc).unwrap();
            }
            Self {
                inner,
                reads: Arc::new(AtomicUsize::new(0)),
                failures_left: Mutex::new(failures),
                slow_scope: None,
            }
        }

        /// Reading that scope takes a lot longer than the others
        fn slow(mut self, scope_name: &'static str) -> Self {
            self.slow_scope = Some(scope_name);
            self
        }
    }

    impl GrammarSource for CountingSource {
        fn raw_grammar(&self, scope_name: &str) -> TmResult<Option<RawGrammar>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let delay = if self.slow_scope == Some(scope_name) {
                300
            } else {
                20
            };
            thread::sleep(Duration::from_millis(delay));
            let mut failures = self.failures_left.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::Io(Arc::new(std::io::Error::other("flaky"))));
            }
            self.inner.raw_grammar(scope_name)
        }
    }

    #[test]
    fn loads_included_grammars_and_ignores_missing_ones() {
        let registry = Registry::new(
            MemorySource::new()
                .with_json(OUTER)
                .unwrap()
                .with_json(INNER)
                .unwrap(),
        );
        let outer = registry.load_grammar("source.outer").unwrap();
        assert_eq!(outer.scope_name, "source.outer");
        assert!(registry.loaded_grammar("source.inner").is_some());
        assert!(registry.loaded_grammar("source.nowhere").is_none());

        let tokens = registry.tokenize("source.outer", "xi").unwrap();
        assert_eq!(tokens[0].len(), 2);
        assert_eq!(tokens[0][1].scopes.last().unwrap().as_str(), "inner.i");
    }

    #[test]
    fn unknown_grammar() {
        let registry = Registry::default();
        assert!(matches!(
            registry.load_grammar("source.unknown"),
            Err(Error::GrammarNotFound(name)) if name == "source.unknown"
        ));
    }

    #[test]
    fn concurrent_loads_compile_once() {
        let source = CountingSource::new(&[SIMPLE], 0);
        let reads = source.reads.clone();
        let registry = Registry::new(source);

        let grammars: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| registry.load_grammar("source.simple").unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for g in &grammars {
            assert!(Arc::ptr_eq(g, &grammars[0]));
        }
        assert_eq!(reads.load(Ordering::SeqCst), 1);
        assert_eq!(registry.grammars().len(), 1);
    }

    #[test]
    fn callers_finding_a_loaded_grammar_wait_for_its_includes() {
        let source = CountingSource::new(&[OUTER, INNER], 0).slow("source.inner");
        let registry = Registry::new(source);

        let (first, second) = thread::scope(|s| {
            let first = s.spawn(|| registry.tokenize("source.outer", "i").unwrap());
            // outer is compiled by then while inner is still being read
            thread::sleep(Duration::from_millis(100));
            let second = s.spawn(|| registry.tokenize("source.outer", "i").unwrap());
            (first.join().unwrap(), second.join().unwrap())
        });

        assert_eq!(first, second);
        assert_eq!(second[0][0].scopes.last().unwrap().as_str(), "inner.i");
    }

    #[test]
    fn failed_loads_are_retried() {
        let source = CountingSource::new(&[SIMPLE], 1);
        let reads = source.reads.clone();
        let registry = Registry::new(source);
        assert!(matches!(
            registry.load_grammar("source.simple"),
            Err(Error::Io(_))
        ));
        assert!(registry.loaded_grammar("source.simple").is_none());
        assert!(registry.load_grammar("source.simple").is_ok());
        assert_eq!(reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn malformed_grammar_fails_without_poisoning_others() {
        let registry = registry_with(&[INNER]);
        let broken = RawGrammar::from_json_str(
            r#"{"scopeName": "source.broken", "patterns": [{"begin": "x"}]}"#,
        )
        .unwrap();
        assert!(matches!(
            registry.add_grammar(broken),
            Err(Error::MalformedGrammar { .. })
        ));
        assert!(registry.loaded_grammar("source.broken").is_none());
        assert!(registry.loaded_grammar("source.inner").is_some());
    }

    #[test]
    fn duplicate_grammars_are_rejected() {
        let registry = registry_with(&[INNER]);
        let again = RawGrammar::from_json_str(INNER).unwrap();
        assert!(matches!(
            registry.add_grammar(again),
            Err(Error::DuplicateGrammar(_))
        ));
    }

    #[test]
    fn plain_fallback() {
        let registry = Registry::default();
        let plain = registry.load_grammar_or_plain("source.unknown").unwrap();
        assert_eq!(plain.scope_name, PLAIN_SCOPE_NAME);
        let again = registry.add_plain_grammar().unwrap();
        assert!(Arc::ptr_eq(&plain, &again));

        let tokens = registry.tokenize(PLAIN_SCOPE_NAME, "anything").unwrap();
        assert_eq!(tokens[0].len(), 1);
        assert_eq!(tokens[0][0].span, 0..8);
    }

    #[test]
    fn finds_grammars_by_file_type_and_first_line() {
        let registry = registry_with(&[INNER, OUTER]);
        let by_path = registry.grammar_for_path("dir/file.inr").unwrap();
        assert_eq!(by_path.scope_name, "source.inner");
        assert!(registry.grammar_for_path("file.rs").is_none());

        let by_line = registry.grammar_for_first_line("#!/usr/bin/inner").unwrap();
        assert_eq!(by_line.scope_name, "source.inner");
        assert!(registry.grammar_for_first_line("plain").is_none());
    }

    #[test]
    fn tokenize_file_checks_file_types() {
        let registry = registry_with(&[INNER]);
        let path = std::env::temp_dir().join(format!("tmlex-{}.txt", std::process::id()));
        std::fs::write(&path, "i").unwrap();

        assert!(matches!(
            registry.tokenize_file("source.inner", &path),
            Err(Error::IncompatibleFileType { file_types, .. }) if file_types == vec!["inr".to_string()]
        ));

        let good = path.with_extension("inr");
        std::fs::write(&good, "i\ni").unwrap();
        let tokens = registry.tokenize_file("source.inner", &good).unwrap();
        assert_eq!(tokens.len(), 2);

        std::fs::remove_file(&path).unwrap();
        std::fs::remove_file(&good).unwrap();
    }

    #[test]
    fn tokenize_file_reuses_tokens_until_the_file_changes() {
        let registry = registry_with(&[INNER]);
        let path = std::env::temp_dir().join(format!("tmlex-cache-{}.inr", std::process::id()));
        std::fs::write(&path, "i").unwrap();

        let first = registry.tokenize_file("source.inner", &path).unwrap();
        let again = registry.tokenize_file("source.inner", &path).unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        std::fs::write(&path, "i\ni").unwrap();
        // don't rely on the file system timestamp resolution
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(std::time::SystemTime::now() + Duration::from_secs(60))
            .unwrap();
        let changed = registry.tokenize_file("source.inner", &path).unwrap();
        assert!(!Arc::ptr_eq(&first, &changed));
        assert_eq!(changed.len(), 2);

        registry.clear_file_cache();
        let fresh = registry.tokenize_file("source.inner", &path).unwrap();
        assert!(!Arc::ptr_eq(&changed, &fresh));
        assert_eq!(*fresh, *changed);

        std::fs::remove_file(&path).unwrap();
    }
}
