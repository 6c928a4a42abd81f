use dit::{
    diagnostics::DiagnosticKind,
    environment::{Container, ContainerKind, Heap},
    grammar::{Grammar, Primitive, ValueKind},
    lexer::{Lexer, Payload, Resolved, SymbolResolver, Token},
    value::{Declared, TypeSpec, Value},
};

struct NoNames;

impl SymbolResolver for NoNames {
    fn resolve(&self, _name: &str) -> Option<Resolved> {
        None
    }
}

fn tokens(source: &str, resolve_names: bool) -> Vec<Token> {
    let mut lexer = Lexer::from_source(source);
    let mut out = Vec::new();
    loop {
        let token = lexer
            .next_token(&NoNames, resolve_names)
            .expect("tokenizing should succeed");
        if token.grammar == Grammar::Eof {
            return out;
        }
        out.push(token);
    }
}

fn grammars(source: &str) -> Vec<Grammar> {
    tokens(source, true).into_iter().map(|token| token.grammar).collect()
}

#[test]
fn recognizes_doubles_before_singles() {
    assert_eq!(
        grammars("<| |> (| |) ( ) . = + , ; : [ ] { }"),
        vec![
            Grammar::TriangleLeft,
            Grammar::TriangleRight,
            Grammar::CircleLeft,
            Grammar::CircleRight,
            Grammar::ParenLeft,
            Grammar::ParenRight,
            Grammar::Dot,
            Grammar::Equals,
            Grammar::Plus,
            Grammar::Comma,
            Grammar::Semi,
            Grammar::Colon,
            Grammar::BracketLeft,
            Grammar::BracketRight,
            Grammar::BraceLeft,
            Grammar::BraceRight,
        ]
    );
}

#[test]
fn keywords_and_primitives_win_over_names() {
    assert_eq!(
        grammars("class extends func Ditlang void listOf import from throw return null true false Num JSON"),
        vec![
            Grammar::Class,
            Grammar::Extends,
            Grammar::Func,
            Grammar::Ditlang,
            Grammar::Void,
            Grammar::ListOf,
            Grammar::Import,
            Grammar::From,
            Grammar::Throw,
            Grammar::Return,
            Grammar::Null,
            Grammar::True,
            Grammar::False,
            Grammar::Primitive(Primitive::Num),
            Grammar::Primitive(Primitive::Json),
        ]
    );
}

#[test]
fn unknown_words_depend_on_resolution_mode() {
    let resolved = tokens("fresh", true);
    assert_eq!(resolved[0].grammar, Grammar::NewName);
    assert_eq!(resolved[0].word(), Some("fresh"));

    let raw = tokens("fresh", false);
    assert_eq!(raw[0].grammar, Grammar::Word);
    assert_eq!(raw[0].payload, Payload::Word("fresh".into()));
}

#[test]
fn declared_names_resolve_to_their_kind() {
    let mut heap = Heap::new();
    let dit = heap.alloc(Container::new(Some("main".into()), ContainerKind::Dit, None));
    let count = heap
        .declare(dit, "count", Declared::scalar(TypeSpec::Num))
        .expect("declare count");
    heap.declare(dit, "label", Declared::scalar(TypeSpec::Str))
        .expect("declare label");
    heap.assign(count, Value::Num(3.0)).expect("assign count");

    let resolver = heap.resolver(dit);
    let mut lexer = Lexer::from_source("count label other");
    let first = lexer.next_token(&resolver, true).expect("token");
    assert_eq!(first.grammar, Grammar::Value(ValueKind::Num));
    assert_eq!(first.slot(), Some(count));
    let second = lexer.next_token(&resolver, true).expect("token");
    assert_eq!(second.grammar, Grammar::Value(ValueKind::Str));
    let third = lexer.next_token(&resolver, true).expect("token");
    assert_eq!(third.grammar, Grammar::NewName);
}

#[test]
fn numbers_carry_their_value() {
    let found = tokens("42 3.25", true);
    assert_eq!(found[0].payload, Payload::Number(42.0));
    assert_eq!(found[1].payload, Payload::Number(3.25));
}

#[test]
fn comments_and_blanks_are_skipped() {
    assert_eq!(
        grammars("// line comment\n  /* block\n comment */ Str"),
        vec![Grammar::Primitive(Primitive::Str)]
    );
}

#[test]
fn tokens_partition_the_source() {
    let source = "Num total = add(1, 2.5);";
    let pieces: Vec<&str> = tokens(source, true)
        .iter()
        .map(|token| &source[token.loc.pos..token.end])
        .collect();
    assert_eq!(
        pieces,
        vec!["Num", "total", "=", "add", "(", "1", ",", "2.5", ")", ";"]
    );
}

#[test]
fn spans_and_skipped_gaps_rebuild_the_source() {
    let source = "// header\nNum total = add(1, 2.5); /* block\n comment */ Str name;\n  // tail\n";
    let mut rebuilt = String::new();
    let mut cursor = 0;
    for token in tokens(source, true) {
        assert!(token.loc.pos >= cursor, "token at {} overlaps {cursor}", token.loc.pos);
        assert!(token.end > token.loc.pos);
        let gap = &source[cursor..token.loc.pos];
        let trimmed = gap.trim_start();
        assert!(
            trimmed.is_empty() || trimmed.starts_with("//") || trimmed.starts_with("/*"),
            "unexpected skipped text {gap:?}"
        );
        rebuilt.push_str(gap);
        rebuilt.push_str(&source[token.loc.pos..token.end]);
        cursor = token.end;
    }
    let tail = &source[cursor..];
    assert!(tail.trim_start().is_empty() || tail.trim_start().starts_with("//"));
    rebuilt.push_str(tail);
    assert_eq!(rebuilt, source);
}

#[test]
fn locations_track_lines_and_columns() {
    let found = tokens("Num a;\n  Str b;", true);
    let str_token = &found[3];
    assert_eq!(str_token.grammar, Grammar::Primitive(Primitive::Str));
    assert_eq!((str_token.loc.line, str_token.loc.col), (2, 3));
}

#[test]
fn strings_are_scanned_verbatim() {
    let mut lexer = Lexer::from_source("\"a // not a comment\" ;");
    let open = lexer.next_token(&NoNames, true).expect("open quote");
    assert_eq!(open.grammar, Grammar::QuoteDouble);
    let text = lexer.scan_string(b'"').expect("string body");
    assert_eq!(text, "a // not a comment");
    let close = lexer.next_token(&NoNames, true).expect("close quote");
    assert_eq!(close.grammar, Grammar::QuoteDouble);
    let semi = lexer.next_token(&NoNames, true).expect("semicolon");
    assert_eq!(semi.grammar, Grammar::Semi);
}

#[test]
fn unterminated_string_is_a_syntax_error() {
    let mut lexer = Lexer::from_source("\"never closed");
    lexer.next_token(&NoNames, true).expect("open quote");
    let err = lexer.scan_string(b'"').expect_err("missing quote");
    assert_eq!(err.kind(), Some(DiagnosticKind::Syntax));
}

#[test]
fn braces_capture_nested_bodies() {
    let mut lexer = Lexer::from_source("{ a { b } c } d");
    let open = lexer.next_token(&NoNames, false).expect("open brace");
    assert_eq!(open.grammar, Grammar::BraceLeft);
    let body = lexer.capture_braces().expect("balanced body");
    assert_eq!(body.text(), " a { b } c ");
    assert_eq!(
        lexer.next_token(&NoNames, false).expect("close").grammar,
        Grammar::BraceRight
    );
    let after = lexer.next_token(&NoNames, false).expect("trailing word");
    assert_eq!(after.word(), Some("d"));
}

#[test]
fn unrecognized_bytes_are_reported() {
    let mut lexer = Lexer::from_source("@");
    let err = lexer.next_token(&NoNames, true).expect_err("unknown byte");
    assert_eq!(err.kind(), Some(DiagnosticKind::Syntax));
    assert_eq!(
        err.diagnostic().map(|diag| diag.message.as_str()),
        Some("Unrecognized token '@'")
    );
}

#[test]
fn unterminated_block_comment_fails() {
    let mut lexer = Lexer::from_source("/* open");
    let err = lexer.next_token(&NoNames, true).expect_err("open comment");
    assert_eq!(err.kind(), Some(DiagnosticKind::Syntax));
}
