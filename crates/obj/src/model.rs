use serde::{Deserialize, Serialize};

use crate::expr::{BinaryOp, Expr, ExprKind, SymRef, UnaryOp};
use crate::intervals::IntervalSet;

/// What to do when two emissions land on the same file offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverwriteMode {
    #[default]
    Allow,
    Forbid,
    Warn,
}

/// Zero-page segments hold one-byte addresses; everything else is absolute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Addressing {
    ZeroPage,
    #[default]
    Absolute,
}

/// Deferred patch: the linker writes the resolved value of `expr` into
/// `size` bytes at `offset` in the owning chunk's data.
#[derive(Debug, Clone, PartialEq)]
pub struct Substitution {
    pub offset: usize,
    pub size: usize,
    pub expr: Expr,
}

/// Contiguous run of emitted bytes; the linker's unit of placement.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Segments that were active when the chunk was opened.
    pub segments: Vec<String>,
    pub data: Vec<u8>,
    /// Fixed origin from `.org`; `None` for relocatable chunks.
    pub org: Option<u32>,
    /// Adopted from the first label bound at the chunk start.
    pub name: Option<String>,
    pub subs: Vec<Substitution>,
    /// Assertions that could not be decided at assembly time.
    pub asserts: Vec<Expr>,
    pub overwrite: OverwriteMode,
}

impl Chunk {
    pub fn new(segments: Vec<String>, org: Option<u32>, overwrite: OverwriteMode) -> Self {
        Self {
            segments,
            data: Vec::new(),
            org,
            name: None,
            subs: Vec::new(),
            asserts: Vec::new(),
            overwrite,
        }
    }
}

/// Module-level symbol. Unresolved references in chunk substitutions point
/// into the symbol array by index.
#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    pub expr: Expr,
    pub export: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub name: String,
    pub bank: Option<u32>,
    pub size: Option<u32>,
    /// File offset of the segment start.
    pub offset: Option<u32>,
    /// Runtime base address.
    pub memory: Option<u32>,
    pub fill: Option<u8>,
    /// Output file override; carried through for the linker.
    pub out: Option<String>,
    pub overlay: Option<String>,
    pub addressing: Addressing,
    /// Address ranges available for linker placement.
    pub free: IntervalSet,
}

impl Segment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bank: None,
            size: None,
            offset: None,
            memory: None,
            fill: None,
            out: None,
            overlay: None,
            addressing: Addressing::Absolute,
            free: IntervalSet::new(),
        }
    }

    /// File offset of an absolute address, when this segment maps it.
    pub fn file_offset(&self, addr: u32) -> Option<u32> {
        let memory = self.memory?;
        let size = self.size?;
        let offset = self.offset?;
        if addr >= memory && addr - memory < size {
            Some(offset + (addr - memory))
        } else {
            None
        }
    }

    /// True if `addr` lies inside `[memory, memory + size)`.
    pub fn contains(&self, addr: u32) -> bool {
        match (self.memory, self.size) {
            (Some(memory), Some(size)) => addr >= memory && addr - memory < size,
            _ => false,
        }
    }
}

/// The assembler's output: everything the linker needs to place chunks,
/// patch substitutions and resolve imports.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Module {
    pub chunks: Vec<Chunk>,
    pub symbols: Vec<Symbol>,
    pub segments: Vec<Segment>,
}

impl Module {
    /// Resolve an expression against this module: symbol indices are chased
    /// through the symbol array and fixed-chunk positions become absolute.
    /// `None` while an import or an unplaced chunk keeps the value open.
    pub fn resolve(&self, expr: &Expr) -> Option<i64> {
        match &expr.kind {
            ExprKind::Num(value) => {
                if expr.meta.rel {
                    let org = expr
                        .meta
                        .org
                        .or_else(|| expr.meta.chunk.and_then(|c| self.chunks.get(c)?.org))?;
                    Some(i64::from(org) + value)
                } else {
                    Some(*value)
                }
            }
            ExprKind::Sym(SymRef::Id(id)) => self.resolve(&self.symbols.get(*id)?.expr),
            ExprKind::Sym(SymRef::Name(_)) | ExprKind::Import(_) => None,
            ExprKind::Unary { op, arg } => {
                let value = self.resolve(arg)?;
                Some(match op {
                    UnaryOp::Neg => -value,
                    UnaryOp::Not => i64::from(value == 0),
                    UnaryOp::BitNot => !value,
                    UnaryOp::LoByte => value & 0xFF,
                    UnaryOp::HiByte => (value >> 8) & 0xFF,
                    UnaryOp::BankByte => (value >> 16) & 0xFF,
                })
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let a = self.resolve(lhs)?;
                let b = self.resolve(rhs)?;
                Some(match op {
                    BinaryOp::Add => a.wrapping_add(b),
                    BinaryOp::Sub => a.wrapping_sub(b),
                    BinaryOp::Mul => a.wrapping_mul(b),
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
                })
            }
            ExprKind::Move(_) => None,
        }
    }

    /// Chunk bytes with every substitution this module can already resolve
    /// patched in. Test and inspection helper; the linker does the real pass
    /// once placement is known.
    pub fn patched_data(&self, chunk: &Chunk) -> Vec<u8> {
        let mut data = chunk.data.clone();
        for sub in &chunk.subs {
            if let Some(value) = self.resolve(&sub.expr) {
                for (i, byte) in data[sub.offset..sub.offset + sub.size].iter_mut().enumerate() {
                    *byte = ((value >> (8 * i)) & 0xFF) as u8;
                }
            }
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{BinaryOp, UnaryOp};

    #[test]
    fn segment_file_offsets() {
        let mut segment = Segment::new("code");
        segment.memory = Some(0x8000);
        segment.size = Some(0x4000);
        segment.offset = Some(0x10);
        assert_eq!(segment.file_offset(0x8000), Some(0x10));
        assert_eq!(segment.file_offset(0x8123), Some(0x133));
        assert_eq!(segment.file_offset(0xC000), None);
        assert_eq!(segment.file_offset(0x7FFF), None);
    }

    #[test]
    fn resolve_chases_symbol_chains() {
        let module = Module {
            chunks: Vec::new(),
            symbols: vec![
                Symbol {
                    expr: Expr::sym(1),
                    export: None,
                },
                Symbol {
                    expr: Expr::num(0x42),
                    export: None,
                },
            ],
            segments: Vec::new(),
        };
        assert_eq!(module.resolve(&Expr::sym(0)), Some(0x42));
        assert_eq!(
            module.resolve(&Expr::unary(UnaryOp::LoByte, Expr::sym(0))),
            Some(0x42)
        );
        assert_eq!(module.resolve(&Expr::import("ext")), None);
    }

    #[test]
    fn resolve_places_relative_positions_through_chunk_origins() {
        let mut chunk = Chunk::new(vec!["code".to_string()], Some(0x8000), OverwriteMode::Allow);
        chunk.data = vec![0; 8];
        let module = Module {
            chunks: vec![chunk],
            symbols: Vec::new(),
            segments: Vec::new(),
        };
        let pos = Expr::rel(5, 0, None);
        assert_eq!(module.resolve(&pos), Some(0x8005));

        let unplaced = Expr::rel(5, 1, None);
        assert_eq!(module.resolve(&unplaced), None);
    }

    #[test]
    fn patching_fills_resolvable_substitutions() {
        let mut chunk = Chunk::new(vec!["code".to_string()], None, OverwriteMode::Allow);
        chunk.data = vec![0xAD, 0x00, 0x00];
        chunk.subs.push(Substitution {
            offset: 1,
            size: 2,
            expr: Expr::binary(BinaryOp::Add, Expr::sym(0), Expr::num(2)),
        });
        let module = Module {
            chunks: vec![chunk],
            symbols: vec![Symbol {
                expr: Expr::num(0x1234),
                export: None,
            }],
            segments: Vec::new(),
        };
        assert_eq!(module.patched_data(&module.chunks[0]), vec![0xAD, 0x36, 0x12]);
    }
}
