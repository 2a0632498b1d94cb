use tmlex::{DirectorySource, Registry};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let registry = Registry::new(DirectorySource::open("demos/grammars")?);

    let code = r#"{"name": "tmlex", "version": [0, 1], "stable": false}"#;
    let tokens = registry.tokenize("source.json", code)?;

    for token in &tokens[0] {
        let scopes: Vec<_> = token.scopes.iter().map(|s| s.as_str()).collect();
        println!("{:<12} {}", format!("{:?}", &code[token.span.clone()]), scopes.join(" "));
    }

    Ok(())
}
