use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tmlex::{DirectorySource, GrammarBundle, Registry, Token};

#[derive(Parser)]
#[command(name = "tmlex-cli", version, about = "Tokenize files with TextMate grammars")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the tokens of a file
    Tokenize {
        file: PathBuf,
        /// Directory of `*.json` grammars
        #[arg(long, conflicts_with = "bundle")]
        grammars: Option<PathBuf>,
        /// Grammar bundle made with the `bundle` command
        #[arg(long)]
        bundle: Option<PathBuf>,
        /// Scope name of the grammar to use, guessed from the file otherwise
        #[arg(long)]
        scope: Option<String>,
        /// Output the tokens as JSON
        #[arg(long)]
        json: bool,
    },
    /// Pack a directory of grammars into a single bundle
    Bundle { grammars: PathBuf, output: PathBuf },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    match Cli::parse().command {
        Command::Tokenize {
            file,
            grammars,
            bundle,
            scope,
            json,
        } => {
            let (registry, known_scopes) = match (grammars, bundle) {
                (_, Some(path)) => {
                    let bundle = GrammarBundle::load_from_file(path)?;
                    let scopes = bundle.scope_names().map(str::to_owned).collect::<Vec<_>>();
                    (Registry::new(bundle), scopes)
                }
                (Some(dir), None) => {
                    let source = DirectorySource::open(dir)?;
                    let scopes = source.scope_names().map(str::to_owned).collect::<Vec<_>>();
                    (Registry::new(source), scopes)
                }
                (None, None) => return Err("one of --grammars or --bundle is required".into()),
            };

            let text = std::fs::read_to_string(&file)?;
            let tokens = tokenize_input(&registry, &known_scopes, scope, &file, &text)?;
            print_tokens(&text, &tokens, json)?;
        }
        Command::Bundle { grammars, output } => {
            let source = DirectorySource::open(&grammars)?;
            let bundle = GrammarBundle::from_directory(&source)?;
            bundle.write_to_file(&output)?;
            println!("Bundled {} grammars into {}", bundle.len(), output.display());
        }
    }

    Ok(())
}

fn tokenize_input(
    registry: &Registry,
    known_scopes: &[String],
    scope: Option<String>,
    file: &Path,
    text: &str,
) -> Result<Vec<Vec<Token>>, Box<dyn std::error::Error>> {
    let scope = match scope {
        Some(scope) => scope,
        None => guess_scope(registry, known_scopes, file, text)
            .ok_or("could not find a grammar for that file, use --scope")?,
    };
    // A grammar guessed from the first line may not list that file's extension
    Ok(registry.tokenize(&scope, text)?)
}

/// Loads every grammar the source knows and asks the registry which one fits
fn guess_scope(
    registry: &Registry,
    known_scopes: &[String],
    file: &Path,
    text: &str,
) -> Option<String> {
    for scope in known_scopes {
        if let Err(e) = registry.load_grammar(scope) {
            eprintln!("Skipping {scope}: {e}");
        }
    }
    let first_line = text.lines().next().unwrap_or_default();
    registry
        .grammar_for_path(file)
        .or_else(|| registry.grammar_for_first_line(first_line))
        .map(|g| g.scope_name.clone())
}

fn print_tokens(
    text: &str,
    tokens: &[Vec<Token>],
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if json {
        println!("{}", serde_json::to_string_pretty(tokens)?);
        return Ok(());
    }

    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    for (number, (line, line_tokens)) in normalized.split('\n').zip(tokens).enumerate() {
        println!("{:>4}: {line}", number + 1);
        for token in line_tokens {
            let scopes: Vec<_> = token.scopes.iter().map(|s| s.as_str()).collect();
            println!(
                "      {:?} {}",
                &line[token.span.clone()],
                scopes.join(" ")
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tmlex::MemorySource;

    const SHELL: &str = r#"{
        "scopeName": "source.shell",
        "fileTypes": ["sh"],
        "firstLineMatch": "^#!.*\\bsh\\b",
        "patterns": [{"match": "echo", "name": "support.function"}]
    }"#;

    #[test]
    fn grammar_guessed_from_first_line_ignores_file_types() {
        let registry = Registry::new(MemorySource::new().with_json(SHELL).unwrap());
        let known = vec!["source.shell".to_owned()];
        let text = "#!/bin/sh\necho hi";

        let tokens =
            tokenize_input(&registry, &known, None, Path::new("bin/deploy"), text).unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(
            tokens[1][0].scopes.last().unwrap().as_str(),
            "support.function"
        );
    }

    #[test]
    fn unknown_file_needs_a_scope() {
        let registry = Registry::new(MemorySource::new().with_json(SHELL).unwrap());
        let known = vec!["source.shell".to_owned()];
        assert!(tokenize_input(&registry, &known, None, Path::new("notes"), "hello").is_err());
    }
}
