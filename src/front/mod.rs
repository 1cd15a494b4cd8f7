//! Source-to-tokens front end.

pub mod lex;

pub use lex::{Keyword, Lexer, Token, TokenKind};
