//! The lexer.
//!
//! Produces tokens one at a time with one-token lookahead. Newlines only
//! become a [`TokenKind::Separator`] when bracket nesting is zero;
//! inside `()`/`[]`/`{}` a newline is silently discarded. Nesting depth
//! for the three bracket kinds (plus a reserved angle-bracket slot) is
//! packed into a single `u32`, one byte per kind, so "are we inside
//! brackets at all" is a single non-zero check instead of three.

use derive_more::Display;

use crate::common::SourcePos;
use crate::error::{ErrorKind, SemiError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum Keyword {
    #[display("or")]
    Or,
    #[display("in")]
    In,
    #[display("is")]
    Is,
    #[display("if")]
    If,
    #[display("as")]
    As,
    #[display("fn")]
    Fn,
    #[display("and")]
    And,
    #[display("for")]
    For,
    #[display("elif")]
    Elif,
    #[display("else")]
    Else,
    #[display("step")]
    Step,
    #[display("true")]
    True,
    #[display("false")]
    False,
    #[display("defer")]
    Defer,
    #[display("raise")]
    Raise,
    #[display("break")]
    Break,
    #[display("unset")]
    Unset,
    #[display("export")]
    Export,
    #[display("return")]
    Return,
    #[display("import")]
    Import,
    #[display("struct")]
    Struct,
    #[display("continue")]
    Continue,
}

impl Keyword {
    fn lookup(text: &str) -> Option<Keyword> {
        use Keyword::*;
        Some(match text {
            "or" => Or,
            "in" => In,
            "is" => Is,
            "if" => If,
            "as" => As,
            "fn" => Fn,
            "and" => And,
            "for" => For,
            "elif" => Elif,
            "else" => Else,
            "step" => Step,
            "true" => True,
            "false" => False,
            "defer" => Defer,
            "raise" => Raise,
            "break" => Break,
            "unset" => Unset,
            "export" => Export,
            "return" => Return,
            "import" => Import,
            "struct" => Struct,
            "continue" => Continue,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Display)]
pub enum TokenKind {
    #[display("identifier `{_0}`")]
    Identifier(String),
    #[display("type identifier `{_0}`")]
    TypeIdentifier(String),
    #[display("placeholder `{_0}`")]
    Placeholder(u32),
    #[display("keyword `{_0}`")]
    Keyword(Keyword),
    #[display("integer {_0}")]
    Int(i64),
    #[display("float {_0}")]
    Float(f64),
    #[display("string {_0:?}")]
    Str(String),

    #[display("+")]
    Plus,
    #[display("-")]
    Minus,
    #[display("*")]
    Star,
    #[display("**")]
    DoubleStar,
    #[display("/")]
    Slash,
    #[display("//")]
    DoubleSlash,
    #[display("%")]
    Percent,
    #[display("&")]
    Amp,
    #[display("|")]
    Pipe,
    #[display("^")]
    Caret,
    #[display("<<")]
    ShiftLeft,
    #[display(">>")]
    ShiftRight,
    #[display("~")]
    Tilde,
    #[display("!")]
    Bang,

    #[display("=")]
    Assign,
    #[display(":=")]
    ColonAssign,
    #[display("==")]
    EqEq,
    #[display("!=")]
    NotEq,
    #[display("<")]
    Lt,
    #[display("<=")]
    Le,
    #[display(">")]
    Gt,
    #[display(">=")]
    Ge,

    #[display("?")]
    Question,
    #[display(":")]
    Colon,
    #[display(",")]
    Comma,
    #[display(";")]
    Semicolon,
    #[display(".")]
    Dot,
    #[display("..")]
    DotDot,

    #[display("(")]
    LParen,
    #[display(")")]
    RParen,
    #[display("[")]
    LBracket,
    #[display("]")]
    RBracket,
    #[display("{{")]
    LBrace,
    #[display("}}")]
    RBrace,

    #[display("newline")]
    Separator,
    #[display("end of input")]
    Eof,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub pos: SourcePos,
}

/// Packed nesting counters: byte 0 = `()`, byte 1 = `[]`, byte 2 = `{}`,
/// byte 3 reserved.
#[derive(Clone, Copy, Default)]
struct Nesting(u32);

impl Nesting {
    fn get(self, slot: u32) -> u8 {
        (self.0 >> (slot * 8)) as u8
    }
    fn inc(&mut self, slot: u32) {
        let cur = self.get(slot);
        self.0 = (self.0 & !(0xFFu32 << (slot * 8))) | ((cur.wrapping_add(1) as u32) << (slot * 8));
    }
    fn dec(&mut self, slot: u32) {
        let cur = self.get(slot);
        let next = cur.saturating_sub(1);
        self.0 = (self.0 & !(0xFFu32 << (slot * 8))) | ((next as u32) << (slot * 8));
    }
    fn any_open(self) -> bool {
        self.0 != 0
    }
}

const SLOT_PAREN: u32 = 0;
const SLOT_BRACKET: u32 = 1;
const SLOT_BRACE: u32 = 2;

/// Maximum depth any single bracket kind may reach before the lexer
/// reports `BracketsNestedTooDeeply`.
const MAX_BRACKET_DEPTH: u8 = 200;

pub struct Lexer<'src> {
    src: &'src str,
    bytes: &'src [u8],
    pos: usize,
    line: u32,
    column: u32,
    nesting: Nesting,
    lookahead: Token,
}

impl<'src> Lexer<'src> {
    /// `source` is raw bytes rather than `&str` so invalid UTF-8 in the
    /// input surfaces as an ordinary lexical error (`InvalidUtf8`)
    /// instead of a panic or a type error the embedder has to avoid
    /// upstream.
    pub fn new(source: &'src [u8]) -> Result<Self, SemiError> {
        let src = std::str::from_utf8(source).map_err(|_| SemiError::new(ErrorKind::InvalidUtf8))?;
        let bytes = src.as_bytes();
        let mut start = 0;
        if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
            start = 3;
        }
        if bytes[start..].starts_with(b"#!") {
            start += src[start..].find('\n').map(|nl| nl + 1).unwrap_or(bytes.len() - start);
        }
        let mut lexer = Lexer {
            src,
            bytes,
            pos: start,
            line: 1,
            column: 1,
            nesting: Nesting::default(),
            lookahead: Token { kind: TokenKind::Eof, pos: SourcePos::start() },
        };
        lexer.lookahead = lexer.scan()?;
        Ok(lexer)
    }

    pub fn peek(&self) -> &Token {
        &self.lookahead
    }

    pub fn next_token(&mut self) -> Result<Token, SemiError> {
        let next = self.scan()?;
        Ok(std::mem::replace(&mut self.lookahead, next))
    }

    fn err(&self, kind: ErrorKind) -> SemiError {
        SemiError::at(kind, SourcePos { line: self.line, column: self.column })
    }

    fn peek_byte(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_byte_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn peek_char(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek_char()?;
        self.pos += ch.len_utf8();
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek_byte() {
                Some(b' ') | Some(b'\t') | Some(b'\r') => {
                    self.bump();
                }
                Some(b'\n') if self.nesting.any_open() => {
                    self.bump();
                }
                Some(b'#') => {
                    while let Some(b) = self.peek_byte() {
                        if b == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => break,
            }
        }
    }

    fn scan(&mut self) -> Result<Token, SemiError> {
        self.skip_whitespace_and_comments();
        let pos = SourcePos { line: self.line, column: self.column };

        let Some(b) = self.peek_byte() else {
            return Ok(Token { kind: TokenKind::Eof, pos });
        };

        if b == b'\n' {
            self.bump();
            return Ok(Token { kind: TokenKind::Separator, pos });
        }
        if b.is_ascii_digit() {
            return self.scan_number(pos);
        }
        if b == b'"' {
            return self.scan_string(pos);
        }
        if b == b'_' {
            // `_` followed only by digits is a placeholder identifier
            // (`_0`, `_1`, ...); `_` alone or `_` followed by a letter is
            // a normal identifier.
            if self.peek_byte_at(1).map(|c| c.is_ascii_digit()).unwrap_or(false) {
                return self.scan_placeholder(pos);
            }
            return self.scan_identifier(pos);
        }
        if b.is_ascii_alphabetic() || b >= 0x80 {
            return self.scan_identifier(pos);
        }

        self.scan_operator(pos)
    }

    fn scan_placeholder(&mut self, pos: SourcePos) -> Result<Token, SemiError> {
        self.bump(); // '_'
        let digits_start = self.pos;
        while self.peek_byte().map(|b| b.is_ascii_digit()).unwrap_or(false) {
            self.bump();
        }
        let digits = &self.src[digits_start..self.pos];
        let n: u32 = digits.parse().map_err(|_| self.err(ErrorKind::InvalidNumberLiteral))?;
        Ok(Token { kind: TokenKind::Placeholder(n), pos })
    }

    fn scan_identifier(&mut self, pos: SourcePos) -> Result<Token, SemiError> {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c == '_' || c.is_alphanumeric() {
                self.bump();
            } else {
                break;
            }
        }
        let text = &self.src[start..self.pos];
        if text.len() > 255 {
            return Err(self.err(ErrorKind::IdentifierTooLong));
        }
        if let Some(kw) = Keyword::lookup(text) {
            return Ok(Token { kind: TokenKind::Keyword(kw), pos });
        }
        let first = text.chars().next().unwrap();
        let kind = if first.is_uppercase() {
            TokenKind::TypeIdentifier(text.to_string())
        } else {
            TokenKind::Identifier(text.to_string())
        };
        Ok(Token { kind, pos })
    }

    fn scan_number(&mut self, pos: SourcePos) -> Result<Token, SemiError> {
        let start = self.pos;

        if self.peek_byte() == Some(b'0') {
            match self.peek_byte_at(1) {
                Some(b'x') | Some(b'X') => return self.scan_radix_int(pos, 16, |c| c.is_ascii_hexdigit()),
                Some(b'o') | Some(b'O') => return self.scan_radix_int(pos, 8, |c| (b'0'..=b'7').contains(&c)),
                Some(b'b') | Some(b'B') => return self.scan_radix_int(pos, 2, |c| c == b'0' || c == b'1'),
                _ => {}
            }
        }

        self.consume_digits();
        let mut is_float = false;

        // `N..M` must not be parsed as `N.` followed by `.M`: a `.` only
        // starts a decimal point when it is not itself followed by
        // another `.`, and when a digit follows it.
        if self.peek_byte() == Some(b'.')
            && self.peek_byte_at(1) != Some(b'.')
            && self.peek_byte_at(1).map(|c| c.is_ascii_digit()).unwrap_or(false)
        {
            is_float = true;
            self.bump();
            self.consume_digits();
        }

        if matches!(self.peek_byte(), Some(b'e') | Some(b'E')) {
            let save = (self.pos, self.line, self.column);
            self.bump();
            if matches!(self.peek_byte(), Some(b'+') | Some(b'-')) {
                self.bump();
            }
            if self.peek_byte().map(|c| c.is_ascii_digit()).unwrap_or(false) {
                is_float = true;
                self.consume_digits();
            } else {
                (self.pos, self.line, self.column) = save;
            }
        }

        let text: String = self.src[start..self.pos].chars().filter(|&c| c != '_').collect();
        if is_float {
            let value: f64 = text.parse().map_err(|_| self.err(ErrorKind::InvalidNumberLiteral))?;
            Ok(Token { kind: TokenKind::Float(value), pos })
        } else {
            let value: i64 = text.parse().map_err(|_| self.err(ErrorKind::InvalidNumberLiteral))?;
            Ok(Token { kind: TokenKind::Int(value), pos })
        }
    }

    fn consume_digits(&mut self) {
        while let Some(b) = self.peek_byte() {
            if b.is_ascii_digit() || b == b'_' {
                self.bump();
            } else {
                break;
            }
        }
    }

    fn scan_radix_int(&mut self, pos: SourcePos, radix: u32, is_digit: impl Fn(u8) -> bool) -> Result<Token, SemiError> {
        self.bump(); // '0'
        self.bump(); // x/o/b
        let digits_start = self.pos;
        while let Some(b) = self.peek_byte() {
            if is_digit(b) || b == b'_' {
                self.bump();
            } else {
                break;
            }
        }
        if self.pos == digits_start {
            return Err(self.err(ErrorKind::InvalidNumberLiteral));
        }
        let digits: String = self.src[digits_start..self.pos].chars().filter(|&c| c != '_').collect();
        let value = i64::from_str_radix(&digits, radix).map_err(|_| self.err(ErrorKind::InvalidNumberLiteral))?;
        Ok(Token { kind: TokenKind::Int(value), pos })
    }

    fn scan_string(&mut self, pos: SourcePos) -> Result<Token, SemiError> {
        self.bump(); // opening quote
        let mut out = String::new();
        loop {
            match self.peek_char() {
                None => return Err(self.err(ErrorKind::UnterminatedString)),
                Some('"') => {
                    self.bump();
                    break;
                }
                Some('\n') => return Err(self.err(ErrorKind::UnterminatedString)),
                Some('\\') => {
                    self.bump();
                    let escaped = self.peek_char().ok_or_else(|| self.err(ErrorKind::UnterminatedString))?;
                    let resolved = match escaped {
                        '"' => '"',
                        '\'' => '\'',
                        '0' => '\0',
                        'n' => '\n',
                        'r' => '\r',
                        't' => '\t',
                        _ => return Err(self.err(ErrorKind::InvalidEscapeSequence)),
                    };
                    self.bump();
                    out.push(resolved);
                }
                Some(c) => {
                    self.bump();
                    out.push(c);
                }
            }
        }
        Ok(Token { kind: TokenKind::Str(out), pos })
    }

    fn scan_operator(&mut self, pos: SourcePos) -> Result<Token, SemiError> {
        macro_rules! two {
            ($second:expr, $two:expr, $one:expr) => {{
                self.bump();
                if self.peek_byte() == Some($second) {
                    self.bump();
                    $two
                } else {
                    $one
                }
            }};
        }

        let b = self.peek_byte().unwrap();
        let kind = match b {
            b'+' => {
                self.bump();
                TokenKind::Plus
            }
            b'-' => {
                self.bump();
                TokenKind::Minus
            }
            b'*' => two!(b'*', TokenKind::DoubleStar, TokenKind::Star),
            b'/' => two!(b'/', TokenKind::DoubleSlash, TokenKind::Slash),
            b'%' => {
                self.bump();
                TokenKind::Percent
            }
            b'&' => {
                self.bump();
                TokenKind::Amp
            }
            b'|' => {
                self.bump();
                TokenKind::Pipe
            }
            b'^' => {
                self.bump();
                TokenKind::Caret
            }
            b'~' => {
                self.bump();
                TokenKind::Tilde
            }
            b'!' => two!(b'=', TokenKind::NotEq, TokenKind::Bang),
            b'=' => two!(b'=', TokenKind::EqEq, TokenKind::Assign),
            b'<' => {
                self.bump();
                match self.peek_byte() {
                    Some(b'<') => {
                        self.bump();
                        TokenKind::ShiftLeft
                    }
                    Some(b'=') => {
                        self.bump();
                        TokenKind::Le
                    }
                    _ => TokenKind::Lt,
                }
            }
            b'>' => {
                self.bump();
                match self.peek_byte() {
                    Some(b'>') => {
                        self.bump();
                        TokenKind::ShiftRight
                    }
                    Some(b'=') => {
                        self.bump();
                        TokenKind::Ge
                    }
                    _ => TokenKind::Gt,
                }
            }
            b':' => two!(b'=', TokenKind::ColonAssign, TokenKind::Colon),
            b'?' => {
                self.bump();
                TokenKind::Question
            }
            b',' => {
                self.bump();
                TokenKind::Comma
            }
            b';' => {
                self.bump();
                TokenKind::Semicolon
            }
            b'.' => two!(b'.', TokenKind::DotDot, TokenKind::Dot),
            b'(' => {
                self.bump();
                self.nesting.inc(SLOT_PAREN);
                if self.nesting.get(SLOT_PAREN) > MAX_BRACKET_DEPTH {
                    return Err(self.err(ErrorKind::BracketsNestedTooDeeply));
                }
                TokenKind::LParen
            }
            b')' => {
                self.bump();
                self.nesting.dec(SLOT_PAREN);
                TokenKind::RParen
            }
            b'[' => {
                self.bump();
                self.nesting.inc(SLOT_BRACKET);
                if self.nesting.get(SLOT_BRACKET) > MAX_BRACKET_DEPTH {
                    return Err(self.err(ErrorKind::BracketsNestedTooDeeply));
                }
                TokenKind::LBracket
            }
            b']' => {
                self.bump();
                self.nesting.dec(SLOT_BRACKET);
                TokenKind::RBracket
            }
            b'{' => {
                self.bump();
                self.nesting.inc(SLOT_BRACE);
                if self.nesting.get(SLOT_BRACE) > MAX_BRACKET_DEPTH {
                    return Err(self.err(ErrorKind::BracketsNestedTooDeeply));
                }
                TokenKind::LBrace
            }
            b'}' => {
                self.bump();
                self.nesting.dec(SLOT_BRACE);
                TokenKind::RBrace
            }
            _ => return Err(self.err(ErrorKind::UnexpectedToken)),
        };
        Ok(Token { kind, pos })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(src.as_bytes()).unwrap();
        let mut out = Vec::new();
        loop {
            let tok = lexer.next_token().unwrap();
            let done = tok.kind == TokenKind::Eof;
            out.push(tok.kind);
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn whitespace_and_line_comments_are_skipped() {
        let ks = kinds("a # comment\n  b");
        assert_eq!(
            ks,
            vec![
                TokenKind::Identifier("a".into()),
                TokenKind::Separator,
                TokenKind::Identifier("b".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn newlines_inside_brackets_are_suppressed() {
        let ks = kinds("(\n1\n)");
        assert_eq!(ks, vec![TokenKind::LParen, TokenKind::Int(1), TokenKind::RParen, TokenKind::Eof]);
    }

    #[test]
    fn dot_dot_does_not_become_a_decimal_point() {
        let ks = kinds("0..0");
        assert_eq!(ks, vec![TokenKind::Int(0), TokenKind::DotDot, TokenKind::Int(0), TokenKind::Eof]);
    }

    #[test]
    fn float_literals_with_exponent() {
        let ks = kinds("1.5e-3");
        assert_eq!(ks, vec![TokenKind::Float(1.5e-3), TokenKind::Eof]);
    }

    #[test]
    fn numeric_literal_bases() {
        assert_eq!(kinds("0x1F"), vec![TokenKind::Int(31), TokenKind::Eof]);
        assert_eq!(kinds("0o17"), vec![TokenKind::Int(15), TokenKind::Eof]);
        assert_eq!(kinds("0b101"), vec![TokenKind::Int(5), TokenKind::Eof]);
        assert_eq!(kinds("1_000_000"), vec![TokenKind::Int(1_000_000), TokenKind::Eof]);
    }

    #[test]
    fn string_escapes() {
        let ks = kinds(r#""a\nb\tc""#);
        assert_eq!(ks, vec![TokenKind::Str("a\nb\tc".into()), TokenKind::Eof]);
    }

    #[test]
    fn type_identifiers_are_distinguished_by_leading_case() {
        let ks = kinds("Foo foo");
        assert_eq!(
            ks,
            vec![
                TokenKind::TypeIdentifier("Foo".into()),
                TokenKind::Identifier("foo".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn placeholders_are_distinguished_from_identifiers() {
        let ks = kinds("_0 _ _x");
        assert_eq!(
            ks,
            vec![
                TokenKind::Placeholder(0),
                TokenKind::Identifier("_".into()),
                TokenKind::Identifier("_x".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn keywords_are_recognised() {
        let ks = kinds("if elif else for fn");
        assert_eq!(
            ks,
            vec![
                TokenKind::Keyword(Keyword::If),
                TokenKind::Keyword(Keyword::Elif),
                TokenKind::Keyword(Keyword::Else),
                TokenKind::Keyword(Keyword::For),
                TokenKind::Keyword(Keyword::Fn),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn shebang_and_bom_are_consumed() {
        let src = "\u{FEFF}#!/usr/bin/env semi\na";
        let ks = kinds(src);
        assert_eq!(ks, vec![TokenKind::Identifier("a".into()), TokenKind::Eof]);
    }

    #[test]
    fn bracket_nesting_too_deep_is_rejected() {
        let src = "(".repeat(300);
        let mut lexer = Lexer::new(src.as_bytes()).expect("opening the first 200 brackets must succeed");
        let mut saw_error = false;
        for _ in 0..300 {
            if lexer.next_token().is_err() {
                saw_error = true;
                break;
            }
        }
        assert!(saw_error);
    }

    #[test]
    fn invalid_utf8_is_rejected_at_construction() {
        let err = Lexer::new(&[0x61, 0xFF, 0x62]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidUtf8);
    }
}
