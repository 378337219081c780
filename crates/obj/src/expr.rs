use std::collections::BTreeSet;

use crate::span::Span;

/// Value metadata attached to expression nodes.
///
/// A `Num` without `rel` is a plain constant. A `Num` with `rel` is a byte
/// offset inside `chunk`; its absolute address is `org + num`, which is only
/// known when the chunk has a fixed origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Meta {
    /// Declared or derived operand width in bytes (1, 2, 3 or 4).
    pub size: Option<u8>,
    pub rel: bool,
    pub chunk: Option<usize>,
    pub org: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymRef {
    /// Index into the module's symbol array.
    Id(usize),
    /// Unresolved reference by name; only appears before resolution.
    Name(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
    LoByte,
    HiByte,
    BankByte,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Num(i64),
    Sym(SymRef),
    Import(String),
    Unary {
        op: UnaryOp,
        arg: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// Opaque `.move` payload; the linker copies bytes from the address the
    /// argument resolves to.
    Move(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub meta: Meta,
    pub span: Option<Span>,
}

/// Width a constant needs when no explicit size was written.
pub fn size_of_value(value: i64) -> u8 {
    if value.unsigned_abs() < 256 { 1 } else { 2 }
}

impl Expr {
    pub fn num(value: i64) -> Self {
        Self {
            kind: ExprKind::Num(value),
            meta: Meta {
                size: Some(size_of_value(value)),
                ..Meta::default()
            },
            span: None,
        }
    }

    pub fn num_sized(value: i64, size: u8) -> Self {
        Self {
            kind: ExprKind::Num(value),
            meta: Meta {
                size: Some(size),
                ..Meta::default()
            },
            span: None,
        }
    }

    /// Program-counter value: byte offset `offset` inside `chunk`, with the
    /// chunk origin recorded when it is fixed.
    pub fn rel(offset: usize, chunk: usize, org: Option<u32>) -> Self {
        Self {
            kind: ExprKind::Num(offset as i64),
            meta: Meta {
                size: Some(2),
                rel: true,
                chunk: Some(chunk),
                org,
            },
            span: None,
        }
    }

    pub fn sym(id: usize) -> Self {
        Self {
            kind: ExprKind::Sym(SymRef::Id(id)),
            meta: Meta::default(),
            span: None,
        }
    }

    pub fn import(name: impl Into<String>) -> Self {
        Self {
            kind: ExprKind::Import(name.into()),
            meta: Meta::default(),
            span: None,
        }
    }

    pub fn unary(op: UnaryOp, arg: Expr) -> Self {
        Self {
            kind: ExprKind::Unary {
                op,
                arg: Box::new(arg),
            },
            meta: Meta::default(),
            span: None,
        }
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Self {
            kind: ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            meta: Meta::default(),
            span: None,
        }
    }

    pub fn with_span(mut self, span: Option<Span>) -> Self {
        self.span = span;
        self
    }

    /// The constant value, when this node is a fully reduced non-relative
    /// number.
    pub fn const_value(&self) -> Option<i64> {
        match self.kind {
            ExprKind::Num(value) if !self.meta.rel => Some(value),
            _ => None,
        }
    }

    /// Operand width: declared size, or the symbolic-reference default of 2.
    pub fn size_hint(&self) -> u8 {
        self.meta.size.unwrap_or(2)
    }

    /// Visit this node and all descendants, parents first.
    pub fn walk(&self, visit: &mut impl FnMut(&Expr)) {
        visit(self);
        match &self.kind {
            ExprKind::Num(_) | ExprKind::Sym(_) | ExprKind::Import(_) => {}
            ExprKind::Unary { arg, .. } | ExprKind::Move(arg) => arg.walk(visit),
            ExprKind::Binary { lhs, rhs, .. } => {
                lhs.walk(visit);
                rhs.walk(visit);
            }
        }
    }

    /// Names of all by-name symbol references reachable from this node.
    pub fn named_symbols(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.walk(&mut |node| {
            if let ExprKind::Sym(SymRef::Name(name)) = &node.kind {
                names.insert(name.clone());
            }
        });
        names
    }
}

/// Partial bottom-up evaluation.
///
/// Folds every subtree whose operands are known: plain constants combine
/// arithmetically, a relative position in a fixed-origin chunk becomes the
/// absolute constant `org + num`, and the difference of two relative
/// positions in the same chunk becomes the chunk-offset delta. Unresolved
/// symbols and imports are preserved along with the operators above them.
pub fn evaluate(expr: &Expr) -> Expr {
    match &expr.kind {
        ExprKind::Num(value) => {
            if expr.meta.rel {
                if let Some(org) = expr.meta.org {
                    // Fixed chunk: the position has a known absolute address.
                    return Expr {
                        kind: ExprKind::Num(i64::from(org) + value),
                        meta: Meta {
                            size: Some(2),
                            ..Meta::default()
                        },
                        span: expr.span,
                    };
                }
            }
            expr.clone()
        }
        ExprKind::Sym(_) | ExprKind::Import(_) => expr.clone(),
        ExprKind::Unary { op, arg } => {
            let arg = evaluate(arg);
            if let Some(value) = arg.const_value() {
                if let Some(folded) = fold_unary(*op, value) {
                    return folded.with_span(expr.span);
                }
            }
            Expr {
                kind: ExprKind::Unary {
                    op: *op,
                    arg: Box::new(arg),
                },
                meta: expr.meta,
                span: expr.span,
            }
        }
        ExprKind::Binary { op, lhs, rhs } => {
            let lhs = evaluate(lhs);
            let rhs = evaluate(rhs);

            if let (Some(a), Some(b)) = (lhs.const_value(), rhs.const_value()) {
                if let Some(folded) = fold_binary(*op, a, b) {
                    return folded.with_span(expr.span);
                }
            }

            // Two positions in the same chunk are a fixed distance apart even
            // before the chunk is placed.
            if *op == BinaryOp::Sub {
                if let (ExprKind::Num(a), ExprKind::Num(b)) = (&lhs.kind, &rhs.kind) {
                    if lhs.meta.rel
                        && rhs.meta.rel
                        && lhs.meta.chunk == rhs.meta.chunk
                        && lhs.meta.chunk.is_some()
                    {
                        return Expr::num(a - b).with_span(expr.span);
                    }
                }
            }

            Expr {
                kind: ExprKind::Binary {
                    op: *op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                meta: expr.meta,
                span: expr.span,
            }
        }
        ExprKind::Move(arg) => Expr {
            kind: ExprKind::Move(Box::new(evaluate(arg))),
            meta: expr.meta,
            span: expr.span,
        },
    }
}

fn fold_unary(op: UnaryOp, value: i64) -> Option<Expr> {
    let folded = match op {
        UnaryOp::Neg => Expr::num(-value),
        UnaryOp::Not => Expr::num(i64::from(value == 0)),
        UnaryOp::BitNot => Expr::num(!value),
        UnaryOp::LoByte => Expr::num_sized(value & 0xFF, 1),
        UnaryOp::HiByte => Expr::num_sized((value >> 8) & 0xFF, 1),
        UnaryOp::BankByte => Expr::num_sized((value >> 16) & 0xFF, 1),
    };
    Some(folded)
}

fn fold_binary(op: BinaryOp, a: i64, b: i64) -> Option<Expr> {
    let value = match op {
        BinaryOp::Add => a.wrapping_add(b),
        BinaryOp::Sub => a.wrapping_sub(b),
        BinaryOp::Mul => a.wrapping_mul(b),
        // Refuse to fold division by zero; the consumer reports it when it
        // demands a constant.
        BinaryOp::Div => a.checked_div(b)?,
        BinaryOp::Mod => a.checked_rem(b)?,
        BinaryOp::BitAnd => a & b,
        BinaryOp::BitOr => a | b,
        BinaryOp::BitXor => a ^ b,
        BinaryOp::Shl => a.wrapping_shl(b as u32),
        BinaryOp::Shr => a.wrapping_shr(b as u32),
        BinaryOp::Eq => i64::from(a == b),
        BinaryOp::Ne => i64::from(a != b),
        BinaryOp::Lt => i64::from(a < b),
        BinaryOp::Gt => i64::from(a > b),
        BinaryOp::Le => i64::from(a <= b),
        BinaryOp::Ge => i64::from(a >= b),
        BinaryOp::And => i64::from(a != 0 && b != 0),
        BinaryOp::Or => i64::from(a != 0 || b != 0),
    };
    Some(Expr::num(value))
}
