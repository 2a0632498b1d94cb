use criterion::{Criterion, criterion_group, criterion_main};
use tmlex::{MemorySource, Registry};

const JSON_GRAMMAR: &str = include_str!("../demos/grammars/json.tmLanguage.json");

fn registry() -> Registry {
    let source = MemorySource::new()
        .with_json(JSON_GRAMMAR)
        .expect("the demo grammar is valid JSON");
    Registry::new(source)
}

fn tokenize_line_benchmark(c: &mut Criterion) {
    let json_input = r#"{"name": "John", "age": 30, "active": true, "score": 95.5, "tags": ["developer", "rust"], "address": null}"#;
    let registry = registry();
    let grammar = registry.load_grammar("source.json").unwrap();

    c.bench_function("json line tokenization", |b| {
        let mut tokenizer = registry.tokenizer(grammar.clone());
        let stack = tokenizer.initial_stack();
        b.iter(|| {
            let result = tokenizer
                .tokenize_line(json_input, &stack)
                .expect("Tokenization should succeed");
            std::hint::black_box(result);
        })
    });
}

fn tokenize_document_benchmark(c: &mut Criterion) {
    let registry = registry();
    let grammar = registry.load_grammar("source.json").unwrap();
    let document = JSON_GRAMMAR.repeat(20);

    c.bench_function("json document tokenization", |b| {
        b.iter(|| {
            // a fresh tokenizer each time so pattern sets are rebuilt
            let mut tokenizer = registry.tokenizer(grammar.clone());
            let result = tokenizer.tokenize_string(&document).unwrap();
            std::hint::black_box(result);
        })
    });
}

criterion_group!(benches, tokenize_line_benchmark, tokenize_document_benchmark);
criterion_main!(benches);
