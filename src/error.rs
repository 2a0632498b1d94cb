use std::fmt;
use std::io;
use std::sync::Arc;

/// Result type used throughout tmlex
pub type TmResult<T> = Result<T, Error>;

/// Errors that can occur when loading grammars or tokenizing.
///
/// The error is `Clone` since a single failed grammar load is handed to every caller
/// that was waiting on it.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// An I/O error occurred when reading a grammar file, a source directory
    /// or a bundle if the `dump` feature is enabled
    Io(Arc<io::Error>),

    /// JSON parsing failed when loading a grammar.
    Json(Arc<serde_json::Error>),

    /// Encoding or decoding a grammar bundle failed.
    #[cfg(feature = "dump")]
    Bitcode(Arc<bitcode::Error>),

    /// The grammar is structurally invalid: a span rule without `end`/`while`,
    /// an include that cannot be resolved, an invalid regex...
    /// Fatal to that grammar only.
    #[allow(missing_docs)]
    MalformedGrammar { scope_name: String, reason: String },

    /// No grammar source knows about this scope name.
    GrammarNotFound(String),

    /// A grammar with that scope name was already loaded in the registry.
    DuplicateGrammar(String),

    /// Tried to pop the root frame of a rule stack.
    /// This is an invariant violation and should never surface from tokenization.
    EmptyStack,

    /// The file extension is not one of the `fileTypes` declared by the grammar.
    #[allow(missing_docs)]
    IncompatibleFileType {
        path: String,
        file_types: Vec<String>,
    },

    /// A pattern set built at runtime failed to compile.
    /// End patterns with backreferences are only complete once the begin pattern matched
    /// so they can't all be validated ahead.
    TokenizeRegex(String),
}

impl Error {
    pub(crate) fn malformed(scope_name: &str, reason: impl Into<String>) -> Self {
        Error::MalformedGrammar {
            scope_name: scope_name.to_owned(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::Json(err) => write!(f, "JSON parsing error: {}", err),
            #[cfg(feature = "dump")]
            Error::Bitcode(err) => write!(f, "bundle encoding error: {}", err),
            Error::MalformedGrammar { scope_name, reason } => {
                write!(f, "malformed grammar '{}': {}", scope_name, reason)
            }
            Error::GrammarNotFound(name) => write!(f, "grammar '{}' not found", name),
            Error::DuplicateGrammar(name) => write!(f, "grammar '{}' is already loaded", name),
            Error::EmptyStack => write!(f, "cannot pop the root frame of a rule stack"),
            Error::IncompatibleFileType { path, file_types } => write!(
                f,
                "file '{}' must have one of the extensions: {}",
                path,
                file_types.join(" / ")
            ),
            Error::TokenizeRegex(message) => write!(f, "regex compilation error: {}", message),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err.as_ref()),
            Error::Json(err) => Some(err.as_ref()),
            #[cfg(feature = "dump")]
            Error::Bitcode(err) => Some(err.as_ref()),
            Error::MalformedGrammar { .. }
            | Error::GrammarNotFound(_)
            | Error::DuplicateGrammar(_)
            | Error::EmptyStack
            | Error::IncompatibleFileType { .. }
            | Error::TokenizeRegex(_) => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(Arc::new(err))
    }
}

#[cfg(feature = "dump")]
impl From<bitcode::Error> for Error {
    fn from(err: bitcode::Error) -> Self {
        Error::Bitcode(Arc::new(err))
    }
}
