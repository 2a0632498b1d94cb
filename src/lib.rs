//! A line-by-line tokenizer for TextMate grammars.
//!
//! ```no_run
//! use tmlex::{DirectorySource, Registry};
//!
//! let registry = Registry::new(DirectorySource::open("grammars")?);
//! let grammar = registry.load_grammar("source.json")?;
//! let mut tokenizer = registry.tokenizer(grammar);
//!
//! let mut stack = tokenizer.initial_stack();
//! for line in ["{", r#"  "a": 1"#, "}"] {
//!     let (tokens, next) = tokenizer.tokenize_line(line, &stack)?;
//!     for token in tokens {
//!         println!("{:?} {:?}", &line[token.span.clone()], token.scopes);
//!     }
//!     stack = next;
//! }
//! # Ok::<(), tmlex::Error>(())
//! ```

mod cache;
mod error;
mod grammars;
mod query;
mod registry;
mod scope;
mod source;
mod tokenizer;

#[cfg(feature = "dump")]
mod dump;
#[cfg(test)]
mod test_utils;

pub use cache::FileTokens;
#[cfg(feature = "dump")]
pub use dump::GrammarBundle;
pub use error::{Error, TmResult};
pub use grammars::{Captures, CompiledGrammar, GrammarId, RawGrammar, RawRule};
pub use query::{ScopeMatch, ScopeQuery};
pub use registry::{PLAIN_SCOPE_NAME, Registry};
pub use scope::{Scope, parse_scopes};
pub use source::{DirectorySource, GrammarSource, MemorySource};
pub use tokenizer::{StackFrame, StateStack, Token, Tokenizer};
