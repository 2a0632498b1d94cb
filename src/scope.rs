//! Interned scope names
//!
//! Scopes like "string.quoted.double" show up in every token of every line so they are
//! interned once in a global repository and passed around as a `Copy` index.
//! The strings are leaked: a process only ever sees a bounded set of scope names,
//! the ones written in the grammars it loads.

use std::collections::HashMap;
use std::fmt;
use std::sync::{LazyLock, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

/// A single scope name, eg "keyword.control.if".
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Scope {
    /// Index in the global repository. 0 is the empty scope
    id: u32,
}

impl Scope {
    /// Interns the given scope name, surrounding whitespace is ignored
    pub fn new(s: &str) -> Scope {
        lock_global_scope_repo().intern(s.trim())
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.id == 0
    }

    /// The scope name as written in the grammar
    pub fn as_str(self) -> &'static str {
        lock_global_scope_repo().names[self.id as usize]
    }

    /// Whether `other` is this scope or a more specific one, by dot-separated segments:
    /// "string.quoted" is a prefix of "string.quoted.double" but not of "string.quotedx".
    /// The empty scope is a prefix of everything.
    pub fn is_prefix_of(self, other: Scope) -> bool {
        if self.is_empty() || self == other {
            return true;
        }
        let repo = lock_global_scope_repo();
        repo.names[other.id as usize]
            .strip_prefix(repo.names[self.id as usize])
            .is_some_and(|rest| rest.starts_with('.'))
    }
}

/// Splits a rule `name` into scopes: a single name can hold several
/// space-separated scopes, eg "meta.tag string.unquoted".
pub fn parse_scopes(names: &str) -> Vec<Scope> {
    names.split_whitespace().map(Scope::new).collect()
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scope(\"{}\")", self.as_str())
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Scope {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Scope {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(Scope::new(&name))
    }
}

struct ScopeRepository {
    names: Vec<&'static str>,
    ids: HashMap<&'static str, u32>,
}

impl ScopeRepository {
    fn new() -> Self {
        Self {
            names: vec![""],
            ids: HashMap::from([("", 0)]),
        }
    }

    fn intern(&mut self, name: &str) -> Scope {
        if let Some(&id) = self.ids.get(name) {
            return Scope { id };
        }

        let id = u32::try_from(self.names.len()).expect("fewer than 2^32 scope names");
        let leaked: &'static str = Box::leak(name.to_owned().into_boxed_str());
        self.names.push(leaked);
        self.ids.insert(leaked, id);
        Scope { id }
    }
}

static SCOPE_REPO: LazyLock<Mutex<ScopeRepository>> =
    LazyLock::new(|| Mutex::new(ScopeRepository::new()));

fn lock_global_scope_repo() -> MutexGuard<'static, ScopeRepository> {
    // the repository is append-only so a poisoned lock still holds valid data
    SCOPE_REPO.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_stable() {
        let a = Scope::new("source.rust.meta.function");
        let b = Scope::new("  source.rust.meta.function ");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "source.rust.meta.function");
        assert_ne!(a, Scope::new("source.rust"));
    }

    #[test]
    fn empty_scope() {
        let scope = Scope::new("");
        assert!(scope.is_empty());
        assert_eq!(scope, Scope::default());
        assert_eq!(scope.to_string(), "");
    }

    #[test]
    fn splits_space_separated_names() {
        let scopes = parse_scopes("meta.tag  string.unquoted ");
        assert_eq!(
            scopes,
            vec![Scope::new("meta.tag"), Scope::new("string.unquoted")]
        );
        assert!(parse_scopes("   ").is_empty());
    }

    #[test]
    fn prefix_matching() {
        let prefix = Scope::new("string.quoted");
        assert!(prefix.is_prefix_of(Scope::new("string.quoted.double")));
        assert!(prefix.is_prefix_of(prefix));
        assert!(!prefix.is_prefix_of(Scope::new("string.quotedx")));
        assert!(!prefix.is_prefix_of(Scope::new("string")));
        assert!(Scope::default().is_prefix_of(prefix));
    }

    #[test]
    fn serializes_as_string() {
        let scope = Scope::new("keyword.control");
        let json = serde_json::to_string(&scope).unwrap();
        assert_eq!(json, "\"keyword.control\"");
        let back: Scope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, scope);
    }
}
