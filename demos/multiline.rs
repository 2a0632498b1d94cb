//! Tokenizes a document line by line, keeping the state of every line like an editor would
//! so that an edit only re-tokenizes from the changed line.

use tmlex::{MemorySource, Registry, StateStack, Token};

const JSON_GRAMMAR: &str = include_str!("grammars/json.tmLanguage.json");

fn print_line(number: usize, line: &str, tokens: &[Token]) {
    println!("{number:>3} | {line}");
    for token in tokens {
        let innermost = token.scopes.last().map(|s| s.as_str()).unwrap_or_default();
        println!("    | {:>3}..{:<3} {innermost}", token.span.start, token.span.end);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let registry = Registry::new(MemorySource::new().with_json(JSON_GRAMMAR)?);
    let grammar = registry.load_grammar("source.json")?;
    let mut tokenizer = registry.tokenizer(grammar);

    let mut lines = vec![
        "{",
        r#"  "comment": /* spans"#,
        r#"     lines */ "done","#,
        r#"  "list": [1, 2.5, -3e4]"#,
        "}",
    ];

    // states[i] is the state before line i
    let mut states: Vec<StateStack> = vec![tokenizer.initial_stack()];
    for (i, line) in lines.iter().enumerate() {
        let (tokens, next) = tokenizer.tokenize_line(line, &states[i])?;
        print_line(i + 1, line, &tokens);
        states.push(next);
    }

    // Editing line 2 closes the comment early: only re-tokenize until the state is the same again
    lines[1] = r#"  "comment": /* short */ 1,"#;
    println!("\nAfter editing line 2:");
    for i in 1..lines.len() {
        let (tokens, next) = tokenizer.tokenize_line(lines[i], &states[i])?;
        print_line(i + 1, lines[i], &tokens);
        if next == states[i + 1] {
            println!("    state unchanged, stopping");
            break;
        }
        states[i + 1] = next;
    }

    Ok(())
}
