// Parser robustness tests
// Goal: malformed input never panics, and one bad declaration never hides the rest.

use manifest::diagnostics::codes;
use manifest::lexer::TokenKind;
use manifest::{compile_to_ir, parse, parse_expression, tokenize, CompileOptions};

fn xorshift64(mut x: u64) -> u64 {
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x
}

fn gen_case(seed: u64, max_len: usize) -> String {
    let tokens: [&str; 36] = [
        "{", "}", "(", ")", "[", "]", " ", "\n", ":", ";", ",", "\"", "'", "=>", "->", "=", ".",
        "entity", "command", "property", "constraint", "guard", "mutate", "emit", "policy",
        "store", "event", "module", "self", "x", "Order", "42", "+", "==", "?", "@",
    ];

    let mut out = String::new();
    let mut state = seed ^ 0x9E37_79B9_7F4A_7C15u64;
    let target_len = (state as usize % max_len).max(1);

    while out.len() < target_len {
        state = xorshift64(state);
        out.push_str(tokens[(state as usize) % tokens.len()]);
    }
    out
}

#[test]
fn parse_and_compile_never_panic_on_generated_inputs() {
    const CASES: u64 = 300;
    const MAX_LEN: usize = 256;

    for seed in 0..CASES {
        let input = gen_case(seed, MAX_LEN);

        let tokens = std::panic::catch_unwind(|| tokenize(&input));
        assert!(tokens.is_ok(), "tokenize panicked for seed {} input {:?}", seed, input);
        let tokens = tokens.unwrap();
        assert_eq!(tokens.last().map(|t| t.kind), Some(TokenKind::Eof));

        let parsed = std::panic::catch_unwind(|| parse(&input));
        assert!(parsed.is_ok(), "parse panicked for seed {} input {:?}", seed, input);

        let compiled =
            std::panic::catch_unwind(|| compile_to_ir(&input, &CompileOptions::default()));
        assert!(compiled.is_ok(), "compile panicked for seed {} input {:?}", seed, input);
        let compiled = compiled.unwrap();
        if compiled.has_errors() {
            assert!(compiled.ir.is_none(), "errors must withhold IR for input {:?}", input);
        }
    }
}

#[test]
fn broken_entity_does_not_hide_the_next_one() {
    let out = parse(
        "entity Broken {\n  property x: \n}\n\nentity Fine {\n  property y: number\n}\n",
    );
    assert!(out.has_errors());
    let names: Vec<_> = out.program.entities.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["Fine"]);
    let error = out.diagnostics.iter().find(|d| d.is_error()).unwrap();
    assert!(error.line.is_some());
    assert!(error.column.is_some());
}

#[test]
fn every_broken_declaration_is_reported() {
    let out = parse(
        "command a( {\n}\npolicy p: \nevent E: 42\ncommand ok() { guard true }\n",
    );
    let errors = out.diagnostics.iter().filter(|d| d.is_error()).count();
    assert!(errors >= 3, "expected one error per broken declaration: {:?}", out.diagnostics);
    assert_eq!(out.program.commands.len(), 1);
    assert_eq!(out.program.commands[0].name, "ok");
}

#[test]
fn stray_closing_braces_are_skipped() {
    let out = parse("}}}\nentity A { property v: number }\n");
    assert!(out.has_errors());
    assert_eq!(out.program.entities.len(), 1);
}

#[test]
fn keyword_names_recover_in_place() {
    let out = parse("entity command { property v: number }\nentity B {}\n");
    let reserved: Vec<_> = out
        .diagnostics
        .iter()
        .filter(|d| d.code.as_deref() == Some(codes::RESERVED_WORD))
        .collect();
    assert_eq!(reserved.len(), 1);
    assert_eq!(out.program.entities.len(), 2);
    assert_eq!(out.program.entities[0].properties.len(), 1);
}

#[test]
fn unterminated_input_ends_with_a_diagnostic() {
    for source in ["entity A {", "command c() { mutate x = ", "policy p execute: (1 +", "event E {"] {
        let out = parse(source);
        assert!(out.has_errors(), "expected an error for {:?}", source);
    }
}

#[test]
fn deep_nesting_is_an_error_not_a_crash() {
    let parens = format!("{}1{}", "(".repeat(200_000), ")".repeat(200_000));
    let error = parse_expression(&parens).unwrap_err();
    assert_eq!(error.code.as_deref(), Some(codes::UNEXPECTED_TOKEN));
    assert!(error.message.contains("nested too deeply"), "{}", error.message);

    let negations = format!("{}1", "- ".repeat(200_000));
    assert!(parse_expression(&negations).is_err());

    let brackets = format!("{}{}", "[".repeat(200_000), "]".repeat(200_000));
    let source = format!(
        "entity A {{ property v: number = {} }}\nentity B {{ property w: number }}\n",
        brackets
    );
    let out = parse(&source);
    assert!(out.has_errors());
    assert_eq!(out.program.entities.len(), 1);
    assert_eq!(out.program.entities[0].name, "B");

    let compiled = compile_to_ir(&source, &CompileOptions::default());
    assert!(compiled.ir.is_none());
}

#[test]
fn nesting_limit_follows_compile_options() {
    let source = "entity A { property v: number = ((1)) }";
    let shallow = CompileOptions {
        use_cache: false,
        max_nesting_depth: 2,
        ..CompileOptions::default()
    };
    assert!(compile_to_ir(source, &shallow).ir.is_none());
    assert!(compile_to_ir(source, &CompileOptions::default()).ir.is_some());
}
