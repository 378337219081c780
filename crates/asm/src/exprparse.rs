//! Operand expression parsing over token slices.
//!
//! The grammar is ca65's: unary operators bind tightest, then the
//! multiplicative group (`* / % & ^ << >>`), the additive group (`+ - |`),
//! comparisons, `&&`, `||`. `*` in operand position is the program counter;
//! the `:`-prefixed and `+`/`-` run forms are anonymous, rts and relative
//! label references.

use a65_obj::{BinaryOp, Expr, Span, UnaryOp};

use crate::assembler::Assembler;
use crate::diag::Diagnostic;
use crate::token::{Token, TokenKind};

fn binary_op(text: &str) -> Option<(u8, BinaryOp)> {
    Some(match text {
        "*" => (1, BinaryOp::Mul),
        "/" => (1, BinaryOp::Div),
        "%" => (1, BinaryOp::Mod),
        "&" => (1, BinaryOp::BitAnd),
        "^" => (1, BinaryOp::BitXor),
        "<<" => (1, BinaryOp::Shl),
        ">>" => (1, BinaryOp::Shr),
        "+" => (2, BinaryOp::Add),
        "-" => (2, BinaryOp::Sub),
        "|" => (2, BinaryOp::BitOr),
        "=" => (3, BinaryOp::Eq),
        "<>" => (3, BinaryOp::Ne),
        "<" => (3, BinaryOp::Lt),
        ">" => (3, BinaryOp::Gt),
        "<=" => (3, BinaryOp::Le),
        ">=" => (3, BinaryOp::Ge),
        "&&" => (4, BinaryOp::And),
        "||" => (5, BinaryOp::Or),
        _ => return None,
    })
}

impl Assembler {
    /// Parse a complete expression from `toks`; trailing tokens are an error.
    pub(crate) fn parse_expr(&mut self, toks: &[Token]) -> Result<Expr, Diagnostic> {
        if toks.is_empty() {
            return Err(Diagnostic::error("Bad argument"));
        }
        let mut pos = 0;
        let expr = self.parse_binary(toks, &mut pos, 5)?;
        if pos != toks.len() {
            return Err(Diagnostic::error("Bad argument").at(toks[pos].span));
        }
        Ok(expr)
    }

    fn parse_binary(
        &mut self,
        toks: &[Token],
        pos: &mut usize,
        level: u8,
    ) -> Result<Expr, Diagnostic> {
        if level == 0 {
            return self.parse_unary(toks, pos);
        }

        let mut lhs = self.parse_binary(toks, pos, level - 1)?;
        loop {
            let Some(token) = toks.get(*pos) else { break };
            let TokenKind::Op(text) = &token.kind else {
                break;
            };
            let Some((op_level, op)) = binary_op(text) else {
                break;
            };
            if op_level != level {
                break;
            }
            let span = token.span;
            *pos += 1;
            let rhs = self.parse_binary(toks, pos, level - 1)?;
            lhs = Expr::binary(op, lhs, rhs).with_span(span);
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self, toks: &[Token], pos: &mut usize) -> Result<Expr, Diagnostic> {
        let Some(token) = toks.get(*pos) else {
            return Err(Diagnostic::error("Bad argument"));
        };
        let span = token.span;

        let op = match &token.kind {
            // A trailing lone `-` is a relative backward reference, not a
            // negation with nothing to negate.
            TokenKind::Op(text) if text == "-" && *pos + 1 < toks.len() => Some(UnaryOp::Neg),
            TokenKind::Op(text) if text == "!" => Some(UnaryOp::Not),
            TokenKind::Op(text) if text == "~" => Some(UnaryOp::BitNot),
            TokenKind::Op(text) if text == "<" => Some(UnaryOp::LoByte),
            TokenKind::Op(text) if text == ">" => Some(UnaryOp::HiByte),
            TokenKind::Op(text) if text == "^" => Some(UnaryOp::BankByte),
            _ => None,
        };

        if let Some(op) = op {
            *pos += 1;
            let arg = self.parse_unary(toks, pos)?;
            return Ok(Expr::unary(op, arg).with_span(span));
        }
        self.parse_term(toks, pos)
    }

    fn parse_term(&mut self, toks: &[Token], pos: &mut usize) -> Result<Expr, Diagnostic> {
        let Some(token) = toks.get(*pos) else {
            return Err(Diagnostic::error("Bad argument"));
        };
        let span = token.span;

        match &token.kind {
            TokenKind::Num { value, width } => {
                *pos += 1;
                let mut expr = Expr::num(*value);
                if let Some(width) = width {
                    expr.meta.size = Some(*width);
                }
                Ok(expr.with_span(span))
            }
            TokenKind::Ident(name) => {
                let mut full = name.clone();
                *pos += 1;
                self.consume_path(toks, pos, &mut full);
                self.symbol_expr(&full, span)
            }
            TokenKind::Op(op) if op == "::" => {
                *pos += 1;
                let Some(TokenKind::Ident(name)) = toks.get(*pos).map(|t| &t.kind) else {
                    return Err(Diagnostic::error("Expected identifier").at(span));
                };
                let mut full = format!("::{name}");
                *pos += 1;
                self.consume_path(toks, pos, &mut full);
                self.symbol_expr(&full, span)
            }
            TokenKind::Op(op) if op == "(" => {
                *pos += 1;
                let expr = self.parse_binary(toks, pos, 5)?;
                if !toks.get(*pos).is_some_and(|t| t.is_op(")")) {
                    return Err(Diagnostic::error("Unbalanced (").at(span));
                }
                *pos += 1;
                Ok(expr)
            }
            TokenKind::Grp(inner) => {
                let inner = inner.clone();
                *pos += 1;
                self.parse_expr(&inner)
            }
            TokenKind::Op(op) => {
                let op = op.clone();
                *pos += 1;
                self.label_ref_expr(&op, span)
            }
            _ => Err(Diagnostic::error("Bad argument").at(span)),
        }
    }

    fn consume_path(&self, toks: &[Token], pos: &mut usize, full: &mut String) {
        while toks.get(*pos).is_some_and(|t| t.is_op("::")) {
            let Some(TokenKind::Ident(segment)) = toks.get(*pos + 1).map(|t| &t.kind) else {
                break;
            };
            full.push_str("::");
            full.push_str(segment);
            *pos += 2;
        }
    }

    /// Operand forms that name a position instead of a symbol: `*`,
    /// anonymous (`:+`, `:-3`), rts (`:>rts`, `:<<rts`) and relative
    /// (`+++`, `--`) references.
    fn label_ref_expr(&mut self, text: &str, span: Option<Span>) -> Result<Expr, Diagnostic> {
        if text == "*" {
            return Ok(self.pc().with_span(span));
        }

        if let Some(rest) = text.strip_prefix(':') {
            if !rest.is_empty() && rest.bytes().all(|b| b == b'+') {
                return Ok(self.anon_forward_ref(rest.len(), span));
            }
            if !rest.is_empty() && rest.bytes().all(|b| b == b'-') {
                return self.anon_backward_ref(rest.len(), span);
            }
            if let Some(digits) = rest.strip_prefix('+') {
                if let Ok(count) = digits.parse::<usize>() {
                    if count > 0 {
                        return Ok(self.anon_forward_ref(count, span));
                    }
                }
            }
            if let Some(digits) = rest.strip_prefix('-') {
                if let Ok(count) = digits.parse::<usize>() {
                    if count > 0 {
                        return self.anon_backward_ref(count, span);
                    }
                }
            }
            if let Some(lead) = rest.strip_suffix("rts") {
                if !lead.is_empty() && lead.bytes().all(|b| b == b'>') {
                    return Ok(self.rts_forward_ref(lead.len(), span));
                }
                if !lead.is_empty() && lead.bytes().all(|b| b == b'<') {
                    return self.rts_backward_ref(lead.len(), span);
                }
            }
            return Err(Diagnostic::error("Bad argument").at(span));
        }

        if !text.is_empty() && text.bytes().all(|b| b == b'+') {
            return Ok(self.relative_forward_ref(text.len(), span));
        }
        if !text.is_empty() && text.bytes().all(|b| b == b'-') {
            return self.relative_backward_ref(text.len(), span);
        }
        Err(Diagnostic::error("Bad argument").at(span))
    }
}
