//! KaRL tokenizer.
//!
//! Comments and whitespace are skipped. Identifiers may carry `{...}` key
//! templates; brace balance is checked by the parser, which knows where the
//! identifier ends.

use std::ops::Range;

use logos::Logos;

use crate::error::{CompileError, CompileErrorKind};

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"//[^\n]*")]
#[logos(skip r"/\*([^*]|\*+[^*/])*\*+/")]
pub(crate) enum Token {
    #[regex(r"[0-9]+\.[0-9]*([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    Double(f64),

    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Integer(i64),

    #[regex(r#""([^"\\]|\\.)*""#, |lex| unescape(lex.slice()))]
    #[regex(r"'([^'\\]|\\.)*'", |lex| unescape(lex.slice()))]
    Str(String),

    #[regex(r"[A-Za-z_.{][A-Za-z0-9_.{}]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[regex(r"#[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice()[1..].to_string())]
    SystemCall(String),

    #[token(";>")]
    Then,
    #[token(";")]
    Semi,
    #[token(",")]
    Comma,
    #[token("=>")]
    Implies,
    #[token("=")]
    Assign,
    #[token("+=")]
    AddAssign,
    #[token("-=")]
    SubAssign,
    #[token("*=")]
    MulAssign,
    #[token("/=")]
    DivAssign,
    #[token("?")]
    Question,
    #[token(":")]
    Colon,
    #[token("||")]
    Or,
    #[token("&&")]
    And,
    #[token("==")]
    Eq,
    #[token("!=")]
    Ne,
    #[token("<")]
    Lt,
    #[token("<=")]
    Le,
    #[token(">")]
    Gt,
    #[token(">=")]
    Ge,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("!")]
    Bang,
    #[token("++")]
    PlusPlus,
    #[token("--")]
    MinusMinus,
    #[token("->")]
    Arrow,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
}

/// A token and its byte range in the source.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Spanned {
    pub token: Token,
    pub span: Range<usize>,
}

/// Strips the quotes from a string literal and resolves escapes.
fn unescape(literal: &str) -> String {
    let inner = &literal[1..literal.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Splits `source` into tokens.
pub(crate) fn tokenize(source: &str) -> Result<Vec<Spanned>, CompileError> {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();
    while let Some(next) = lexer.next() {
        let span = lexer.span();
        match next {
            Ok(token) => tokens.push(Spanned { token, span }),
            Err(()) => {
                let text = lexer.slice();
                let kind = if text.starts_with('"') || text.starts_with('\'') {
                    CompileErrorKind::UnterminatedString
                } else if text.chars().next().is_some_and(|c| c.is_ascii_digit()) {
                    CompileErrorKind::InvalidNumber { text: text.to_string() }
                } else {
                    CompileErrorKind::InvalidToken { text: text.to_string() }
                };
                return Err(CompileError::at(source, span.start, kind));
            }
        }
    }
    Ok(tokens)
}
