use crate::Registry;
use crate::source::MemorySource;
use crate::tokenizer::Token;

/// A registry backed by those grammar documents, all of them loaded
pub(crate) fn registry_with(grammars: &[&str]) -> Registry {
    let mut source = MemorySource::new();
    let scope_names: Vec<String> = grammars
        .iter()
        .map(|json| source.insert(*json).unwrap())
        .collect();

    let registry = Registry::new(source);
    for scope_name in scope_names {
        registry.load_grammar(&scope_name).unwrap();
    }
    registry
}

/// One token per line: `[start..end] "text" scope scope...`
pub(crate) fn format_tokens(text: &str, lines: &[Vec<Token>]) -> String {
    let mut out = Vec::new();
    for (line, tokens) in text.split('\n').zip(lines) {
        for token in tokens {
            let scopes: Vec<_> = token.scopes.iter().map(|s| s.as_str()).collect();
            out.push(format!(
                "[{}..{}] {:?} {}",
                token.span.start,
                token.span.end,
                &line[token.span.clone()],
                scopes.join(" ")
            ));
        }
    }
    out.join("\n")
}
