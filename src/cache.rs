//! Tokens of files already tokenized, reused as long as the file isn't modified.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::TmResult;
use crate::tokenizer::Token;

/// The tokens of every line of a file
pub type FileTokens = Arc<Vec<Vec<Token>>>;

#[derive(Debug)]
struct Entry {
    modified: SystemTime,
    tokens: FileTokens,
}

/// Keyed by grammar scope and canonical path, valid while the modification time is the same
#[derive(Default)]
pub(crate) struct FileCache {
    entries: papaya::HashMap<(String, PathBuf), Entry>,
}

/// What identifies the current content of a file: where it is and when it was last modified
pub(crate) fn file_stamp(path: &Path) -> TmResult<(PathBuf, SystemTime)> {
    let path = fs::canonicalize(path)?;
    let modified = fs::metadata(&path)?.modified()?;
    Ok((path, modified))
}

impl FileCache {
    pub(crate) fn get(
        &self,
        scope_name: &str,
        path: &Path,
        modified: SystemTime,
    ) -> Option<FileTokens> {
        let key = (scope_name.to_owned(), path.to_owned());
        self.entries
            .pin()
            .get(&key)
            .filter(|entry| entry.modified == modified)
            .map(|entry| entry.tokens.clone())
    }

    pub(crate) fn insert(
        &self,
        scope_name: &str,
        path: PathBuf,
        modified: SystemTime,
        tokens: FileTokens,
    ) {
        self.entries
            .pin()
            .insert((scope_name.to_owned(), path), Entry { modified, tokens });
    }

    pub(crate) fn clear(&self) {
        self.entries.pin().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn entries_expire_with_the_modification_time() {
        let cache = FileCache::default();
        let path = PathBuf::from("/tmp/some-file.txt");
        let then = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let tokens: FileTokens = Arc::new(vec![Vec::new()]);

        cache.insert("source.a", path.clone(), then, tokens.clone());
        let hit = cache.get("source.a", &path, then).unwrap();
        assert!(Arc::ptr_eq(&hit, &tokens));

        assert!(cache.get("source.b", &path, then).is_none());
        assert!(
            cache
                .get("source.a", &path, then + Duration::from_secs(1))
                .is_none()
        );

        cache.clear();
        assert_eq!(cache.len(), 0);
    }
}
