//! Black-box lexer coverage through the public `semi::front` API:
//! whitespace/comment skipping, bracket-suppressed newlines, and the
//! `..`-vs-decimal-point disambiguation.

use semi::front::{Lexer, TokenKind};

fn kinds(src: &str) -> Vec<TokenKind> {
    let mut lexer = Lexer::new(src.as_bytes()).expect("lexing should start");
    let mut out = Vec::new();
    loop {
        let token = lexer.next_token().expect("lexing should succeed");
        let is_eof = matches!(token.kind, TokenKind::Eof);
        out.push(token.kind);
        if is_eof {
            break;
        }
    }
    out
}

#[test]
fn line_comments_and_whitespace_are_skipped() {
    let ks = kinds("a # trailing comment\n   b  #another\n");
    assert_eq!(
        ks,
        vec![
            TokenKind::Identifier("a".into()),
            TokenKind::Separator,
            TokenKind::Identifier("b".into()),
            TokenKind::Separator,
            TokenKind::Eof,
        ]
    );
}

#[test]
fn newlines_are_separators_outside_brackets_but_not_inside() {
    let with_brackets = kinds("foo(\n1,\n2\n)");
    assert_eq!(
        with_brackets,
        vec![
            TokenKind::Identifier("foo".into()),
            TokenKind::LParen,
            TokenKind::Int(1),
            TokenKind::Comma,
            TokenKind::Int(2),
            TokenKind::RParen,
            TokenKind::Eof,
        ]
    );

    let without_brackets = kinds("a\nb");
    assert_eq!(
        without_brackets,
        vec![
            TokenKind::Identifier("a".into()),
            TokenKind::Separator,
            TokenKind::Identifier("b".into()),
            TokenKind::Eof,
        ]
    );
}

#[test]
fn double_dot_is_not_mistaken_for_a_decimal_point() {
    assert_eq!(
        kinds("0..10"),
        vec![TokenKind::Int(0), TokenKind::DotDot, TokenKind::Int(10), TokenKind::Eof]
    );
    assert_eq!(kinds("3.5"), vec![TokenKind::Float(3.5), TokenKind::Eof]);
}

#[test]
fn blank_lines_produce_one_separator_per_newline() {
    // The lexer emits a `Separator` for every `\n` it sees outside
    // brackets; collapsing runs of them into one is the statement
    // parser's job (`Compiler::skip_separators`), not the lexer's.
    let ks = kinds("a\n\n\nb");
    assert_eq!(
        ks,
        vec![
            TokenKind::Identifier("a".into()),
            TokenKind::Separator,
            TokenKind::Separator,
            TokenKind::Separator,
            TokenKind::Identifier("b".into()),
            TokenKind::Eof,
        ]
    );
}
