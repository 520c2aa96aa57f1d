//! BigQuery token stream for the guard and the semantic checks.
//!
//! Lexing is done by `sqlparser` with its BigQuery dialect. Whitespace and
//! comments are folded into a `spaced` flag on the following token so table
//! paths like `proj-x.ds.t` can be stitched back together.

use sqlparser::dialect::BigQueryDialect;
use sqlparser::tokenizer::{Token as SqlToken, Tokenizer, TokenizerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Word,
    /// Backtick-quoted identifier; `text` excludes the backticks
    QuotedIdent,
    /// String or bytes literal; `text` excludes the quotes
    StringLit,
    Number,
    Punct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    /// Whitespace or a comment sits between this token and the previous one
    pub spaced: bool,
}

impl Token {
    pub fn is_word(&self, word: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(word)
    }

    pub fn is_punct(&self, punct: &str) -> bool {
        self.kind == TokenKind::Punct && self.text == punct
    }

    /// Word or backtick identifier
    pub fn is_ident(&self) -> bool {
        matches!(self.kind, TokenKind::Word | TokenKind::QuotedIdent)
    }
}

fn raw_tokens(sql: &str) -> Result<Vec<SqlToken>, TokenizerError> {
    let dialect = BigQueryDialect {};
    Tokenizer::new(&dialect, sql).tokenize()
}

/// Tokenize `sql`, dropping whitespace and comments. Fails on an unterminated
/// quote, identifier or block comment.
pub fn tokenize(sql: &str) -> Result<Vec<Token>, TokenizerError> {
    let mut tokens = Vec::new();
    let mut spaced = false;

    for raw in raw_tokens(sql)? {
        let (kind, text) = match raw {
            SqlToken::Whitespace(_) => {
                spaced = true;
                continue;
            }
            SqlToken::EOF => continue,
            SqlToken::Word(word) => match word.quote_style {
                Some(_) => (TokenKind::QuotedIdent, word.value),
                None => (TokenKind::Word, word.value),
            },
            SqlToken::Number(n, _) => (TokenKind::Number, n),
            SqlToken::SingleQuotedString(s)
            | SqlToken::DoubleQuotedString(s)
            | SqlToken::SingleQuotedByteStringLiteral(s)
            | SqlToken::DoubleQuotedByteStringLiteral(s) => (TokenKind::StringLit, s),
            other => (TokenKind::Punct, other.to_string()),
        };
        tokens.push(Token { kind, text, spaced });
        spaced = false;
    }

    Ok(tokens)
}

/// Drop statement terminators that are followed only by whitespace or
/// comments. A `;` inside a literal or comment is left alone.
pub fn strip_trailing_semicolons(sql: &str) -> &str {
    let mut head = sql.trim_end();
    'outer: loop {
        for (pos, _) in head.rmatch_indices(';') {
            if only_trivia(&head[pos + 1..]) && ends_with_terminator(&head[..=pos]) {
                head = head[..pos].trim_end();
                continue 'outer;
            }
        }
        return head;
    }
}

fn only_trivia(sql: &str) -> bool {
    raw_tokens(sql).map_or(false, |toks| {
        toks.iter().all(|t| matches!(t, SqlToken::Whitespace(_) | SqlToken::EOF))
    })
}

fn ends_with_terminator(sql: &str) -> bool {
    raw_tokens(sql).map_or(false, |toks| {
        toks.iter()
            .rev()
            .find(|t| !matches!(t, SqlToken::Whitespace(_) | SqlToken::EOF))
            .map_or(false, |t| matches!(t, SqlToken::SemiColon))
    })
}
