use anyhow::{Result, bail};

use crate::model::{Chunk, Module};

/// Structural checks over a finished module. The assembler runs this before
/// handing the module out; the linker may run it again on untrusted input.
pub fn validate_module(module: &Module) -> Result<()> {
    for (index, chunk) in module.chunks.iter().enumerate() {
        validate_chunk(index, chunk)?;
    }

    for (index, symbol) in module.symbols.iter().enumerate() {
        for name in symbol.expr.named_symbols() {
            bail!("symbol {index} contains unresolved name reference '{name}'");
        }
    }

    for segment in &module.segments {
        let (Some(memory), Some(size)) = (segment.memory, segment.size) else {
            if !segment.free.is_empty() {
                bail!(
                    "segment '{}' has a free list but no memory range",
                    segment.name
                );
            }
            continue;
        };
        for (lo, hi) in segment.free.iter() {
            if lo < memory || hi > memory + size {
                bail!(
                    "segment '{}' free range {:#X}..{:#X} is outside {:#X}..{:#X}",
                    segment.name,
                    lo,
                    hi,
                    memory,
                    memory + size
                );
            }
        }
    }

    Ok(())
}

fn validate_chunk(index: usize, chunk: &Chunk) -> Result<()> {
    if chunk.segments.is_empty() {
        bail!("chunk {index} belongs to no segment");
    }

    for sub in &chunk.subs {
        if sub.size == 0 {
            bail!("chunk {index} has a zero-size substitution at {:#X}", sub.offset);
        }
        let end = sub
            .offset
            .checked_add(sub.size)
            .filter(|&end| end <= chunk.data.len());
        if end.is_none() {
            bail!(
                "chunk {index} substitution {:#X}+{} is outside its {} data bytes",
                sub.offset,
                sub.size,
                chunk.data.len()
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;
    use crate::model::{OverwriteMode, Segment, Substitution, Symbol};

    fn chunk_with_sub(len: usize, offset: usize, size: usize) -> Chunk {
        let mut chunk = Chunk::new(vec!["code".to_string()], None, OverwriteMode::Allow);
        chunk.data = vec![0; len];
        chunk.subs.push(Substitution {
            offset,
            size,
            expr: Expr::sym(0),
        });
        chunk
    }

    #[test]
    fn accepts_in_range_substitution() {
        let module = Module {
            chunks: vec![chunk_with_sub(4, 1, 2)],
            symbols: vec![Symbol {
                expr: Expr::num(1),
                export: None,
            }],
            segments: Vec::new(),
        };
        validate_module(&module).expect("valid module");
    }

    #[test]
    fn rejects_substitution_past_data_end() {
        let module = Module {
            chunks: vec![chunk_with_sub(4, 3, 2)],
            symbols: Vec::new(),
            segments: Vec::new(),
        };
        let err = validate_module(&module).expect_err("must fail");
        assert!(err.to_string().contains("substitution"));
    }

    #[test]
    fn rejects_unresolved_name_in_symbol() {
        let module = Module {
            chunks: Vec::new(),
            symbols: vec![Symbol {
                expr: Expr {
                    kind: crate::expr::ExprKind::Sym(crate::expr::SymRef::Name("lost".into())),
                    meta: crate::expr::Meta::default(),
                    span: None,
                },
                export: None,
            }],
            segments: Vec::new(),
        };
        let err = validate_module(&module).expect_err("must fail");
        assert!(err.to_string().contains("unresolved name"));
    }

    #[test]
    fn rejects_free_range_outside_segment() {
        let mut segment = Segment::new("code");
        segment.memory = Some(0x8000);
        segment.size = Some(0x100);
        segment.free.add(0x8100, 0x8200);
        let module = Module {
            chunks: Vec::new(),
            symbols: Vec::new(),
            segments: vec![segment],
        };
        let err = validate_module(&module).expect_err("must fail");
        assert!(err.to_string().contains("free range"));
    }
}
