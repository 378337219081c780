use std::collections::VecDeque;

use a65_obj::Span;

use crate::diag::Diagnostic;

/// One token as delivered by the external tokenizer. The assembler never
/// sees source text, only these.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Str(String),
    Num {
        value: i64,
        /// Written width of the literal in bytes, when the tokenizer knows
        /// it (`$0010` is two bytes wide regardless of value).
        width: Option<u8>,
    },
    Op(String),
    /// Control symbol: a directive name including the leading dot.
    Cs(String),
    /// Grouped sub-tokens, e.g. a parenthesized run the preprocessor kept
    /// together.
    Grp(Vec<Token>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Option<Span>,
}

impl Token {
    pub fn new(kind: TokenKind) -> Self {
        Self { kind, span: None }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn ident(name: impl Into<String>) -> Self {
        Self::new(TokenKind::Ident(name.into()))
    }

    pub fn str(text: impl Into<String>) -> Self {
        Self::new(TokenKind::Str(text.into()))
    }

    pub fn num(value: i64) -> Self {
        Self::new(TokenKind::Num { value, width: None })
    }

    pub fn num_width(value: i64, width: u8) -> Self {
        Self::new(TokenKind::Num {
            value,
            width: Some(width),
        })
    }

    pub fn op(text: impl Into<String>) -> Self {
        Self::new(TokenKind::Op(text.into()))
    }

    pub fn cs(name: impl Into<String>) -> Self {
        Self::new(TokenKind::Cs(name.into()))
    }

    pub fn grp(tokens: Vec<Token>) -> Self {
        Self::new(TokenKind::Grp(tokens))
    }

    pub fn is_op(&self, text: &str) -> bool {
        matches!(&self.kind, TokenKind::Op(op) if op == text)
    }

    /// Identifier text, case preserved.
    pub fn ident_text(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Ident(name) => Some(name),
            _ => None,
        }
    }

    /// True for an identifier equal to `name` ignoring case (index
    /// registers, attribute keywords).
    pub fn is_ident_ci(&self, name: &str) -> bool {
        self.ident_text()
            .is_some_and(|text| text.eq_ignore_ascii_case(name))
    }

    pub fn str_text(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Str(text) => Some(text),
            _ => None,
        }
    }
}

/// A line of tokens. The token source guarantees lines are non-empty.
pub type Line = Vec<Token>;

/// Pull interface the assembler drains. `next_line` may block while an
/// include stream refills; the assembler holds no borrowed state across the
/// call.
pub trait TokenSource {
    fn next_line(&mut self) -> Result<Option<Line>, Diagnostic>;
}

/// In-memory token source.
#[derive(Debug, Default)]
pub struct VecSource {
    lines: VecDeque<Line>,
}

impl VecSource {
    pub fn new(lines: impl IntoIterator<Item = Line>) -> Self {
        Self {
            lines: lines.into_iter().collect(),
        }
    }
}

impl TokenSource for VecSource {
    fn next_line(&mut self) -> Result<Option<Line>, Diagnostic> {
        Ok(self.lines.pop_front())
    }
}
