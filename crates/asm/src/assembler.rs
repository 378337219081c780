use std::collections::VecDeque;

use indexmap::IndexMap;

use a65_isa6502::{AddressingMode, Cpu};
use a65_obj::{
    BinaryOp, Chunk, Expr, IntervalSet, OverwriteMode, Segment, Span, Substitution, evaluate,
};

use crate::diag::{AssembleError, Diagnostic};
use crate::options::{AssemblerOptions, DiagnosticSink, LogSink, RefExtractor};
use crate::scope::{CheapLocals, ScopeEntry, ScopeId, ScopeKind, ScopeTree, SymbolRecord};
use crate::token::{Line, Token, TokenKind, TokenSource};

/// Requested linkage for a module-level name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Global {
    Import,
    Export,
}

/// Instruction argument as classified by the operand parser, before
/// zero-page/absolute disambiguation.
#[derive(Debug)]
pub(crate) enum Arg {
    Implied,
    Accumulator,
    Immediate(Expr),
    Indirect(Expr),
    IndirectX(Expr),
    IndirectY(Expr),
    /// Plain address operand; sized into zero page, absolute or relative.
    Address(Expr),
    AddressX(Expr),
    AddressY(Expr),
    /// `z:`-forced variants.
    ZeroPage(Expr),
    ZeroPageX(Expr),
    ZeroPageY(Expr),
    /// `a:`-forced variants.
    Absolute(Expr),
    AbsoluteX(Expr),
    AbsoluteY(Expr),
}

/// Single-pass assembler over a stream of token lines. Owns all scopes,
/// symbols, chunks and segment descriptors; [`Assembler::module`] closes the
/// run and hands the object module out.
pub struct Assembler {
    pub(crate) cpu: &'static Cpu,
    pub(crate) options: AssemblerOptions,
    pub(crate) sink: Box<dyn DiagnosticSink>,
    pub(crate) ref_extractor: Option<Box<dyn RefExtractor>>,

    // Symbols and scopes.
    pub(crate) symbols: Vec<SymbolRecord>,
    pub(crate) scopes: ScopeTree,
    pub(crate) current: ScopeId,
    pub(crate) cheap: CheapLocals,
    pub(crate) globals: IndexMap<String, Global>,

    // Anonymous (`:`), relative (`+`/`-`) and rts label registries.
    pub(crate) anon_back: Vec<Expr>,
    pub(crate) anon_fwd: VecDeque<Option<usize>>,
    pub(crate) rel_back: Vec<Option<Expr>>,
    pub(crate) rel_fwd: Vec<Option<usize>>,
    pub(crate) rts_back: Vec<Expr>,
    pub(crate) rts_fwd: VecDeque<Option<usize>>,

    // Chunk and segment state.
    pub(crate) chunks: Vec<Chunk>,
    pub(crate) chunk: Option<usize>,
    pub(crate) org: Option<u32>,
    pub(crate) segments: Vec<String>,
    pub(crate) segment_data: IndexMap<String, Segment>,
    pub(crate) segment_stack: Vec<(Vec<String>, Option<usize>)>,
    pub(crate) segment_prefix: String,
    pub(crate) next_file_offset: u32,
    pub(crate) written: IntervalSet,
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new(Cpu::mos6502())
    }
}

impl Assembler {
    pub fn new(cpu: &'static Cpu) -> Self {
        Self::with_options(cpu, AssemblerOptions::default())
    }

    pub fn with_options(cpu: &'static Cpu, options: AssemblerOptions) -> Self {
        Self {
            cpu,
            options,
            sink: Box::new(LogSink),
            ref_extractor: None,
            symbols: Vec::new(),
            scopes: ScopeTree::default(),
            current: ScopeId::ROOT,
            cheap: CheapLocals::default(),
            globals: IndexMap::new(),
            anon_back: Vec::new(),
            anon_fwd: VecDeque::new(),
            rel_back: Vec::new(),
            rel_fwd: Vec::new(),
            rts_back: Vec::new(),
            rts_fwd: VecDeque::new(),
            chunks: Vec::new(),
            chunk: None,
            org: None,
            segments: vec!["code".to_string()],
            segment_data: IndexMap::new(),
            segment_stack: Vec::new(),
            segment_prefix: String::new(),
            next_file_offset: 0,
            written: IntervalSet::new(),
        }
    }

    pub fn set_sink(&mut self, sink: Box<dyn DiagnosticSink>) {
        self.sink = sink;
    }

    pub fn set_ref_extractor(&mut self, extractor: Box<dyn RefExtractor>) {
        self.ref_extractor = Some(extractor);
    }

    /// Drain the token source, aborting on the first error.
    pub fn assemble(&mut self, source: &mut dyn TokenSource) -> Result<(), AssembleError> {
        while let Some(line) = source.next_line().map_err(AssembleError)? {
            self.line(&line).map_err(AssembleError)?;
        }
        Ok(())
    }

    /// Classify and dispatch one line of tokens.
    pub fn line(&mut self, line: &Line) -> Result<(), Diagnostic> {
        if line.is_empty() {
            return Ok(());
        }

        if line.len() >= 2 {
            match &line[1].kind {
                TokenKind::Op(op) if op == "=" || op == ":=" => {
                    return self.assignment(line, false);
                }
                TokenKind::Cs(cs) if cs == ".set" => {
                    return self.assignment(line, true);
                }
                _ => {}
            }
        }

        let last = line.last().expect("line is non-empty");
        if line.len() <= 2 && last.is_op(":") {
            // A lone `:` is itself the anonymous label.
            if line.len() == 1 {
                return self.define_anon_label();
            }
            return self.label(&line[0]);
        }

        match &line[0].kind {
            TokenKind::Cs(name) => {
                let name = name.clone();
                self.directive(&name, line)
            }
            _ => self.instruction(line),
        }
    }

    fn assignment(&mut self, line: &Line, mutable: bool) -> Result<(), Diagnostic> {
        let span = line[0].span;
        let name = line[0]
            .ident_text()
            .ok_or_else(|| Diagnostic::error("Expected identifier").at(span))?
            .to_string();
        let expr = self.parse_expr(&line[2..])?;
        let value = evaluate(&expr).const_value();
        self.assign_symbol(&name, mutable, expr, span)?;
        if let Some(value) = value {
            if let Some(extractor) = self.ref_extractor.as_deref_mut() {
                extractor.assign(&name, value);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Labels
    // ------------------------------------------------------------------

    fn label(&mut self, token: &Token) -> Result<(), Diagnostic> {
        let span = token.span;
        match &token.kind {
            TokenKind::Op(op) if op == ":" => self.define_anon_label(),
            TokenKind::Op(op) if !op.is_empty() && op.bytes().all(|b| b == b'+') => {
                self.define_relative_forward(op.len())
            }
            TokenKind::Op(op) if !op.is_empty() && op.bytes().all(|b| b == b'-') => {
                self.define_relative_backward(op.len())
            }
            TokenKind::Ident(name) if name.starts_with('@') => {
                let name = name.clone();
                self.define_cheap_label(&name, span)
            }
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.define_label(&name, span)
            }
            _ => Err(Diagnostic::error("Expected identifier").at(span)),
        }
    }

    pub(crate) fn define_label(&mut self, name: &str, span: Option<Span>) -> Result<(), Diagnostic> {
        self.cheap_clear()?;
        let pc = self.pc();
        let idx = self.chunk.expect("pc opened a chunk");

        // An unnamed chunk with no bytes yet adopts the first label, which
        // gives the linker something to call it.
        if self.chunks[idx].name.is_none() && self.chunks[idx].data.is_empty() {
            self.chunks[idx].name = Some(name.to_string());
        }

        let addr = self.chunks[idx]
            .org
            .map(|org| org + self.chunks[idx].data.len() as u32);
        if let Some(extractor) = self.ref_extractor.as_deref_mut() {
            extractor.label(name, addr, &self.segments);
        }

        self.assign_symbol(name, false, pc, span)
    }

    fn define_cheap_label(&mut self, name: &str, span: Option<Span>) -> Result<(), Diagnostic> {
        let pc = self.pc();
        let id = match self.cheap.get(name) {
            Some(id) => id,
            None => {
                let id = self.new_symbol(span, false);
                self.cheap.insert(name, id);
                id
            }
        };
        if self.symbols[id].expr.is_some() {
            return Err(Diagnostic::error(format!("Redefining symbol '{name}'")).at(span));
        }
        self.symbols[id].expr = Some(pc);
        Ok(())
    }

    fn define_anon_label(&mut self) -> Result<(), Diagnostic> {
        let pc = self.pc();
        self.anon_back.push(pc.clone());
        if let Some(Some(id)) = self.anon_fwd.pop_front() {
            self.symbols[id].expr = Some(pc);
        }
        Ok(())
    }

    fn define_relative_forward(&mut self, count: usize) -> Result<(), Diagnostic> {
        let pc = self.pc();
        if let Some(slot) = self.rel_fwd.get_mut(count - 1) {
            if let Some(id) = slot.take() {
                self.symbols[id].expr = Some(pc);
            }
        }
        Ok(())
    }

    fn define_relative_backward(&mut self, count: usize) -> Result<(), Diagnostic> {
        let pc = self.pc();
        if self.rel_back.len() < count {
            self.rel_back.resize(count, None);
        }
        self.rel_back[count - 1] = Some(pc);
        Ok(())
    }

    pub(crate) fn cheap_clear(&mut self) -> Result<(), Diagnostic> {
        self.cheap.clear(&self.symbols)
    }

    // ------------------------------------------------------------------
    // Anonymous / relative / rts references
    // ------------------------------------------------------------------

    pub(crate) fn anon_forward_ref(&mut self, count: usize, span: Option<Span>) -> Expr {
        while self.anon_fwd.len() < count {
            self.anon_fwd.push_back(None);
        }
        if self.anon_fwd[count - 1].is_none() {
            let id = self.new_symbol(span, false);
            self.anon_fwd[count - 1] = Some(id);
        }
        Expr::sym(self.anon_fwd[count - 1].expect("slot just filled")).with_span(span)
    }

    pub(crate) fn anon_backward_ref(
        &self,
        count: usize,
        span: Option<Span>,
    ) -> Result<Expr, Diagnostic> {
        if count == 0 || count > self.anon_back.len() {
            return Err(Diagnostic::error("Bad anonymous backref").at(span));
        }
        Ok(self.anon_back[self.anon_back.len() - count].clone())
    }

    pub(crate) fn relative_forward_ref(&mut self, count: usize, span: Option<Span>) -> Expr {
        if self.rel_fwd.len() < count {
            self.rel_fwd.resize(count, None);
        }
        if self.rel_fwd[count - 1].is_none() {
            let id = self.new_symbol(span, false);
            self.rel_fwd[count - 1] = Some(id);
        }
        Expr::sym(self.rel_fwd[count - 1].expect("slot just filled")).with_span(span)
    }

    pub(crate) fn relative_backward_ref(
        &self,
        count: usize,
        span: Option<Span>,
    ) -> Result<Expr, Diagnostic> {
        match self.rel_back.get(count - 1) {
            Some(Some(expr)) => Ok(expr.clone()),
            _ => Err(Diagnostic::error("Bad relative backref").at(span)),
        }
    }

    pub(crate) fn rts_forward_ref(&mut self, count: usize, span: Option<Span>) -> Expr {
        while self.rts_fwd.len() < count {
            self.rts_fwd.push_back(None);
        }
        if self.rts_fwd[count - 1].is_none() {
            let id = self.new_symbol(span, false);
            self.rts_fwd[count - 1] = Some(id);
        }
        Expr::sym(self.rts_fwd[count - 1].expect("slot just filled")).with_span(span)
    }

    pub(crate) fn rts_backward_ref(
        &self,
        count: usize,
        span: Option<Span>,
    ) -> Result<Expr, Diagnostic> {
        if count == 0 || count > self.rts_back.len() {
            return Err(Diagnostic::error("Bad rts backref").at(span));
        }
        Ok(self.rts_back[self.rts_back.len() - count].clone())
    }

    // ------------------------------------------------------------------
    // Symbols
    // ------------------------------------------------------------------

    pub(crate) fn new_symbol(&mut self, ref_span: Option<Span>, scoped: bool) -> usize {
        self.symbols.push(SymbolRecord {
            expr: None,
            export: None,
            scoped,
            ref_span,
        });
        self.symbols.len() - 1
    }

    /// Assign `expr` to `name`. Definitions always land in the navigated (or
    /// current) scope; references are what walk the parent chain.
    pub(crate) fn assign_symbol(
        &mut self,
        name: &str,
        mutable: bool,
        expr: Expr,
        span: Option<Span>,
    ) -> Result<(), Diagnostic> {
        if name.starts_with('@') {
            return Err(
                Diagnostic::error(format!("Cheap locals may only be labels: {name}")).at(span),
            );
        }

        let value = evaluate(&expr);
        let (from_global, path, tail) = split_scoped(name);
        let scope = if from_global || !path.is_empty() {
            self.scopes.navigate(self.current, from_global, &path, span)?
        } else {
            self.current
        };

        let existing = self.scopes.get(scope).symbols.get(tail).cloned();

        if mutable {
            if value.const_value().is_none() {
                return Err(Diagnostic::error("Mutable set requires constant").at(span));
            }
            if matches!(existing, Some(ScopeEntry::Module(_))) {
                return Err(
                    Diagnostic::error(format!("Cannot change mutability of '{name}'")).at(span),
                );
            }
            self.scopes
                .get_mut(scope)
                .symbols
                .insert(tail.to_string(), ScopeEntry::Mutable(value));
            return Ok(());
        }

        let id = match existing {
            Some(ScopeEntry::Mutable(_)) => {
                return Err(
                    Diagnostic::error(format!("Cannot change mutability of '{name}'")).at(span),
                );
            }
            Some(ScopeEntry::Module(id)) => {
                if self.symbols[id].expr.is_some() {
                    return Err(Diagnostic::error(format!("Redefining symbol '{name}'")).at(span));
                }
                id
            }
            None => {
                let id = self.new_symbol(span, false);
                self.scopes
                    .get_mut(scope)
                    .symbols
                    .insert(tail.to_string(), ScopeEntry::Module(id));
                id
            }
        };

        self.symbols[id].expr = Some(value);
        Ok(())
    }

    /// Expression for a reference to `name`. Defined symbols are inlined;
    /// undefined ones become (or stay) forward references.
    pub(crate) fn symbol_expr(&mut self, name: &str, span: Option<Span>) -> Result<Expr, Diagnostic> {
        if name.starts_with('@') {
            return self.cheap_symbol_expr(name, span);
        }

        let (from_global, path, tail) = split_scoped(name);
        let explicit = from_global || !path.is_empty();

        if explicit {
            let scope = self.scopes.navigate(self.current, from_global, &path, span)?;
            match self.scopes.get(scope).symbols.get(tail).cloned() {
                Some(ScopeEntry::Mutable(value)) => Ok(value),
                Some(ScopeEntry::Module(id)) => {
                    self.symbols[id].scoped = true;
                    Ok(self.sym_or_inline(id, span))
                }
                None => {
                    let id = self.new_symbol(span, true);
                    self.scopes
                        .get_mut(scope)
                        .symbols
                        .insert(tail.to_string(), ScopeEntry::Module(id));
                    Ok(Expr::sym(id).with_span(span))
                }
            }
        } else {
            match self.scopes.lookup_walk(self.current, tail) {
                Some((_, ScopeEntry::Mutable(value))) => Ok(value),
                Some((_, ScopeEntry::Module(id))) => Ok(self.sym_or_inline(id, span)),
                None => {
                    let id = self.new_symbol(span, false);
                    self.scopes
                        .get_mut(self.current)
                        .symbols
                        .insert(tail.to_string(), ScopeEntry::Module(id));
                    Ok(Expr::sym(id).with_span(span))
                }
            }
        }
    }

    fn cheap_symbol_expr(&mut self, name: &str, span: Option<Span>) -> Result<Expr, Diagnostic> {
        let id = match self.cheap.get(name) {
            Some(id) => id,
            None => {
                let id = self.new_symbol(span, false);
                self.cheap.insert(name, id);
                id
            }
        };
        Ok(self.sym_or_inline(id, span))
    }

    fn sym_or_inline(&mut self, id: usize, span: Option<Span>) -> Expr {
        match &self.symbols[id].expr {
            Some(expr) => expr.clone(),
            None => {
                if self.symbols[id].ref_span.is_none() {
                    self.symbols[id].ref_span = span;
                }
                Expr::sym(id).with_span(span)
            }
        }
    }

    // ------------------------------------------------------------------
    // Symbol-table queries (the preprocessor's surface)
    // ------------------------------------------------------------------

    /// True if `name` resolves to a defined symbol, walking the parent chain
    /// for unqualified names, or is imported at module scope.
    pub fn defined_symbol(&self, name: &str) -> bool {
        if name.starts_with('@') {
            return self
                .cheap
                .get(name)
                .is_some_and(|id| self.symbols[id].expr.is_some());
        }

        let (from_global, path, tail) = split_scoped(name);
        let entry = if from_global || !path.is_empty() {
            self.scopes
                .navigate(self.current, from_global, &path, None)
                .ok()
                .and_then(|scope| self.scopes.get(scope).symbols.get(tail).cloned())
        } else {
            self.scopes
                .lookup_walk(self.current, tail)
                .map(|(_, entry)| entry)
        };

        match entry {
            Some(ScopeEntry::Mutable(_)) => true,
            Some(ScopeEntry::Module(id)) if self.symbols[id].expr.is_some() => true,
            _ => matches!(self.globals.get(tail), Some(Global::Import)),
        }
    }

    /// True if the current scope holds an immutable, defined symbol `name`.
    pub fn constant_symbol(&self, name: &str) -> bool {
        match self.scopes.get(self.current).symbols.get(name) {
            Some(ScopeEntry::Module(id)) => self.symbols[*id].expr.is_some(),
            _ => false,
        }
    }

    /// True if the current scope holds any symbol `name`.
    pub fn referenced_symbol(&self, name: &str) -> bool {
        self.scopes.get(self.current).symbols.contains_key(name)
    }

    // ------------------------------------------------------------------
    // Scopes
    // ------------------------------------------------------------------

    pub(crate) fn enter_scope(
        &mut self,
        name: Option<&str>,
        kind: ScopeKind,
        span: Option<Span>,
    ) -> Result<(), Diagnostic> {
        match name {
            Some(name) => {
                if let Some(&existing) = self.scopes.get(self.current).children.get(name) {
                    if self.options.reentrant_scopes {
                        self.current = existing;
                        return Ok(());
                    }
                    return Err(
                        Diagnostic::error(format!("Cannot re-enter scope '{name}'")).at(span)
                    );
                }
                self.current = self.scopes.push_named(self.current, name, kind);
            }
            None => {
                self.current = self.scopes.push_anon(self.current, kind);
            }
        }
        Ok(())
    }

    pub(crate) fn close_scope(&mut self, kind: ScopeKind, span: Option<Span>) -> Result<(), Diagnostic> {
        let (directive, opener) = match kind {
            ScopeKind::Scope => (".endscope", ".scope"),
            ScopeKind::Proc => (".endproc", ".proc"),
        };
        let scope = self.scopes.get(self.current);
        let Some(parent) = scope.parent else {
            return Err(Diagnostic::error(format!("{directive} without {opener}")).at(span));
        };
        if scope.kind != kind {
            return Err(Diagnostic::error(format!("{directive} without {opener}")).at(span));
        }
        self.current = parent;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Chunks, segments, emission
    // ------------------------------------------------------------------

    /// Materialize the active chunk, snapping the current segments, origin
    /// and overwrite mode.
    pub(crate) fn ensure_chunk(&mut self) -> usize {
        if let Some(idx) = self.chunk {
            return idx;
        }
        for name in &self.segments {
            if !self.segment_data.contains_key(name) {
                self.segment_data
                    .insert(name.clone(), Segment::new(name.clone()));
            }
        }
        log::debug!(
            "open chunk {} in {:?} (org {:?})",
            self.chunks.len(),
            self.segments,
            self.org
        );
        self.chunks.push(Chunk::new(
            self.segments.clone(),
            self.org,
            self.options.overwrite_mode,
        ));
        let idx = self.chunks.len() - 1;
        self.chunk = Some(idx);
        idx
    }

    /// Program counter as an expression: the current offset in the active
    /// chunk, tagged with the chunk origin when it is fixed.
    pub(crate) fn pc(&mut self) -> Expr {
        let idx = self.ensure_chunk();
        let chunk = &self.chunks[idx];
        Expr::rel(chunk.data.len(), idx, chunk.org)
    }

    /// Address the next emitted byte will land on, when it is known.
    pub(crate) fn current_address(&self) -> Option<u32> {
        match self.chunk {
            Some(idx) => {
                let chunk = &self.chunks[idx];
                chunk.org.map(|org| org + chunk.data.len() as u32)
            }
            None => self.org,
        }
    }

    /// Track `len` bytes about to be emitted at the current position and
    /// police duplicate writes per the chunk's overwrite mode. Positions
    /// without a file offset (relocatable, or pure-RAM segments) are not
    /// tracked.
    pub(crate) fn mark_written(&mut self, idx: usize, len: usize, span: Option<Span>) -> Result<(), Diagnostic> {
        let chunk = &self.chunks[idx];
        let Some(org) = chunk.org else {
            return Ok(());
        };
        let addr = org + chunk.data.len() as u32;
        let overwrite = chunk.overwrite;
        let Some(offset) = file_offset_in(&self.segment_data, &chunk.segments, addr) else {
            return Ok(());
        };

        let (lo, hi) = (offset, offset + len as u32);
        if self.written.overlaps(lo, hi) {
            match overwrite {
                OverwriteMode::Forbid => {
                    return Err(Diagnostic::error(format!(
                        "Overlapping write to file offset {lo:#X}"
                    ))
                    .at(span));
                }
                OverwriteMode::Warn => {
                    self.sink
                        .warning(&format!("overlapping write to file offset {lo:#X}"));
                }
                OverwriteMode::Allow => {}
            }
        }
        self.written.add(lo, hi);
        Ok(())
    }

    /// Emit literal bytes at the current position.
    pub(crate) fn emit_bytes(&mut self, bytes: &[u8], span: Option<Span>) -> Result<(), Diagnostic> {
        let idx = self.ensure_chunk();
        self.mark_written(idx, bytes.len(), span)?;
        self.chunks[idx].data.extend_from_slice(bytes);
        Ok(())
    }

    /// Emit an expression as `size` little-endian bytes, deferring to a
    /// substitution when it does not reduce to a constant.
    pub(crate) fn emit_expr(&mut self, expr: Expr, size: usize, span: Option<Span>) -> Result<(), Diagnostic> {
        let idx = self.ensure_chunk();
        self.mark_written(idx, size, span)?;
        self.push_expr(idx, expr, size, span)
    }

    /// Append an (already accounted) operand to the chunk tail.
    fn push_expr(&mut self, idx: usize, expr: Expr, size: usize, span: Option<Span>) -> Result<(), Diagnostic> {
        let expr = evaluate(&expr);
        if let Some(value) = expr.const_value() {
            let data = &mut self.chunks[idx].data;
            for i in 0..size {
                data.push(((value >> (8 * i)) & 0xFF) as u8);
            }
            return Ok(());
        }

        let offset = self.chunks[idx].data.len();
        let addr = self.chunks[idx].org.map(|org| org + offset as u32);
        let new_len = offset + size;
        self.chunks[idx].data.resize(new_len, 0);
        if let Some(extractor) = self.ref_extractor.as_deref_mut() {
            extractor.reference(&expr, size, addr, &self.segments);
        }
        self.chunks[idx].subs.push(Substitution {
            offset,
            size,
            expr: expr.with_span(span),
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Instructions
    // ------------------------------------------------------------------

    pub(crate) fn instruction(&mut self, line: &[Token]) -> Result<(), Diagnostic> {
        let span = line[0].span;
        let mnemonic = line[0]
            .ident_text()
            .ok_or_else(|| Diagnostic::error("Expected identifier").at(span))?
            .to_string();
        self.cpu
            .require_mnemonic(&mnemonic)
            .map_err(|err| Diagnostic::error(err.to_string()).at(span))?;

        // `rts` doubles as a landmark for `:<rts` / `:>rts` references; the
        // label is the address of the instruction itself.
        let rts_pc = mnemonic
            .eq_ignore_ascii_case("rts")
            .then(|| self.pc());

        let arg = self.parse_arg(&line[1..])?;
        self.encode(&mnemonic, arg, span)?;

        if let Some(pc) = rts_pc {
            self.rts_back.push(pc.clone());
            if let Some(Some(id)) = self.rts_fwd.pop_front() {
                self.symbols[id].expr = Some(pc);
            }
        }
        Ok(())
    }

    /// Operand tokens to `Arg`.
    fn parse_arg(&mut self, toks: &[Token]) -> Result<Arg, Diagnostic> {
        if toks.is_empty() {
            return Ok(Arg::Implied);
        }
        if toks.len() == 1 && toks[0].is_ident_ci("a") {
            return Ok(Arg::Accumulator);
        }
        if toks[0].is_op("#") {
            return Ok(Arg::Immediate(self.parse_expr(&toks[1..])?));
        }

        // `z:` / `a:` size overrides.
        if toks.len() > 2 && toks[1].is_op(":") {
            if toks[0].is_ident_ci("z") {
                let inner = self.parse_arg(&toks[2..])?;
                return force_direct(inner, toks[0].span);
            }
            if toks[0].is_ident_ci("a") {
                let inner = self.parse_arg(&toks[2..])?;
                return force_absolute(inner, toks[0].span);
            }
        }

        // Indirect forms. A parenthesized group that is not one of the three
        // indirect shapes falls through to plain expression parsing.
        if let Some(indirect) = self.try_indirect(toks)? {
            return Ok(indirect);
        }

        if let Some(comma) = top_level_comma(toks) {
            let after = &toks[comma + 1..];
            let before = &toks[..comma];
            if after.len() == 1 && after[0].is_ident_ci("x") {
                return Ok(Arg::AddressX(self.parse_expr(before)?));
            }
            if after.len() == 1 && after[0].is_ident_ci("y") {
                return Ok(Arg::AddressY(self.parse_expr(before)?));
            }
            return Err(Diagnostic::error("Bad argument").at(toks[comma].span));
        }

        Ok(Arg::Address(self.parse_expr(toks)?))
    }

    fn try_indirect(&mut self, toks: &[Token]) -> Result<Option<Arg>, Diagnostic> {
        let (inside, after, bracketed): (Vec<Token>, &[Token], bool) = match &toks[0].kind {
            TokenKind::Grp(inner) => (inner.clone(), &toks[1..], false),
            TokenKind::Op(op) if op == "(" => {
                let close = matching_close(toks, "(", ")")
                    .ok_or_else(|| Diagnostic::error("Unbalanced (").at(toks[0].span))?;
                (toks[1..close].to_vec(), &toks[close + 1..], false)
            }
            TokenKind::Op(op) if op == "[" && self.options.allow_brackets => {
                let close = matching_close(toks, "[", "]")
                    .ok_or_else(|| Diagnostic::error("Unbalanced (").at(toks[0].span))?;
                (toks[1..close].to_vec(), &toks[close + 1..], true)
            }
            _ => return Ok(None),
        };

        let ends_with_x = inside.len() >= 2
            && inside[inside.len() - 2].is_op(",")
            && inside[inside.len() - 1].is_ident_ci("x");

        if after.is_empty() {
            if ends_with_x {
                let expr = self.parse_expr(&inside[..inside.len() - 2])?;
                return Ok(Some(Arg::IndirectX(expr)));
            }
            return Ok(Some(Arg::Indirect(self.parse_expr(&inside)?)));
        }
        if !ends_with_x && after.len() == 2 && after[0].is_op(",") && after[1].is_ident_ci("y") {
            return Ok(Some(Arg::IndirectY(self.parse_expr(&inside)?)));
        }

        if bracketed {
            return Err(Diagnostic::error("Bad argument").at(toks[0].span));
        }
        // `(...)` followed by more tokens: ordinary parenthesized arithmetic.
        Ok(None)
    }

    fn encode(&mut self, mnemonic: &str, arg: Arg, span: Option<Span>) -> Result<(), Diagnostic> {
        use AddressingMode as M;

        match arg {
            Arg::Implied => {
                // Bare `asl` and friends mean the accumulator form.
                if let Some(opcode) = self.cpu.opcode(mnemonic, M::Implied) {
                    return self.emit_instruction(opcode, None, span);
                }
                if let Some(opcode) = self.cpu.opcode(mnemonic, M::Accumulator) {
                    return self.emit_instruction(opcode, None, span);
                }
                Err(bad_mode("imp", mnemonic, span))
            }
            Arg::Accumulator => {
                let opcode = self.opcode_or(mnemonic, M::Accumulator, "acc", span)?;
                self.emit_instruction(opcode, None, span)
            }
            Arg::Immediate(expr) => {
                let opcode = self.opcode_or(mnemonic, M::Immediate, "imm", span)?;
                self.emit_instruction(opcode, Some((expr, 1)), span)
            }
            Arg::Indirect(expr) => {
                let opcode = self.opcode_or(mnemonic, M::Indirect, "ind", span)?;
                self.emit_instruction(opcode, Some((expr, 2)), span)
            }
            Arg::IndirectX(expr) => {
                let opcode = self.opcode_or(mnemonic, M::IndexedIndirectX, "inx", span)?;
                self.emit_instruction(opcode, Some((expr, 1)), span)
            }
            Arg::IndirectY(expr) => {
                let opcode = self.opcode_or(mnemonic, M::IndirectIndexedY, "iny", span)?;
                self.emit_instruction(opcode, Some((expr, 1)), span)
            }
            Arg::ZeroPage(expr) => {
                let opcode = self.opcode_or(mnemonic, M::ZeroPage, "zpg", span)?;
                self.emit_instruction(opcode, Some((expr, 1)), span)
            }
            Arg::ZeroPageX(expr) => {
                let opcode = self.opcode_or(mnemonic, M::ZeroPageX, "zpx", span)?;
                self.emit_instruction(opcode, Some((expr, 1)), span)
            }
            Arg::ZeroPageY(expr) => {
                let opcode = self.opcode_or(mnemonic, M::ZeroPageY, "zpy", span)?;
                self.emit_instruction(opcode, Some((expr, 1)), span)
            }
            Arg::Absolute(expr) => {
                let opcode = self.opcode_or(mnemonic, M::Absolute, "abs", span)?;
                self.emit_instruction(opcode, Some((expr, 2)), span)
            }
            Arg::AbsoluteX(expr) => {
                let opcode = self.opcode_or(mnemonic, M::AbsoluteX, "abx", span)?;
                self.emit_instruction(opcode, Some((expr, 2)), span)
            }
            Arg::AbsoluteY(expr) => {
                let opcode = self.opcode_or(mnemonic, M::AbsoluteY, "aby", span)?;
                self.emit_instruction(opcode, Some((expr, 2)), span)
            }
            Arg::Address(expr) => {
                let expr = evaluate(&expr);
                let size = expr.size_hint();
                if size == 1 {
                    if let Some(opcode) = self.cpu.opcode(mnemonic, M::ZeroPage) {
                        return self.emit_instruction(opcode, Some((expr, 1)), span);
                    }
                }
                if let Some(opcode) = self.cpu.opcode(mnemonic, M::Absolute) {
                    return self.emit_instruction(opcode, Some((expr, 2)), span);
                }
                if let Some(opcode) = self.cpu.opcode(mnemonic, M::Relative) {
                    return self.emit_branch(opcode, expr, span);
                }
                Err(bad_mode("add", mnemonic, span))
            }
            Arg::AddressX(expr) => {
                let expr = evaluate(&expr);
                if expr.size_hint() == 1 {
                    if let Some(opcode) = self.cpu.opcode(mnemonic, M::ZeroPageX) {
                        return self.emit_instruction(opcode, Some((expr, 1)), span);
                    }
                }
                if let Some(opcode) = self.cpu.opcode(mnemonic, M::AbsoluteX) {
                    return self.emit_instruction(opcode, Some((expr, 2)), span);
                }
                Err(bad_mode("a,x", mnemonic, span))
            }
            Arg::AddressY(expr) => {
                let expr = evaluate(&expr);
                if expr.size_hint() == 1 {
                    if let Some(opcode) = self.cpu.opcode(mnemonic, M::ZeroPageY) {
                        return self.emit_instruction(opcode, Some((expr, 1)), span);
                    }
                }
                if let Some(opcode) = self.cpu.opcode(mnemonic, M::AbsoluteY) {
                    return self.emit_instruction(opcode, Some((expr, 2)), span);
                }
                Err(bad_mode("a,y", mnemonic, span))
            }
        }
    }

    fn opcode_or(
        &self,
        mnemonic: &str,
        mode: AddressingMode,
        tag: &str,
        span: Option<Span>,
    ) -> Result<u8, Diagnostic> {
        self.cpu
            .opcode(mnemonic, mode)
            .ok_or_else(|| bad_mode(tag, mnemonic, span))
    }

    fn emit_instruction(
        &mut self,
        opcode: u8,
        operand: Option<(Expr, usize)>,
        span: Option<Span>,
    ) -> Result<(), Diagnostic> {
        let idx = self.ensure_chunk();
        let arg_len = operand.as_ref().map_or(0, |(_, size)| *size);
        self.mark_written(idx, 1 + arg_len, span)?;
        self.chunks[idx].data.push(opcode);
        if let Some((expr, size)) = operand {
            self.push_expr(idx, expr, size, span)?;
        }
        Ok(())
    }

    /// Branches take the displacement to the target from the address after
    /// the instruction.
    fn emit_branch(&mut self, opcode: u8, target: Expr, span: Option<Span>) -> Result<(), Diagnostic> {
        let idx = self.ensure_chunk();
        let org = self.chunks[idx].org;
        let next = self.chunks[idx].data.len() + 2;
        let next_pc = Expr::rel(next, idx, org);
        let displacement = evaluate(&Expr::binary(BinaryOp::Sub, target, next_pc));

        if let Some(value) = displacement.const_value() {
            if !(-128..=127).contains(&value) {
                return Err(
                    Diagnostic::error(format!("Branch out of range ({value} bytes)")).at(span),
                );
            }
        }

        self.mark_written(idx, 2, span)?;
        self.chunks[idx].data.push(opcode);
        self.push_expr(idx, displacement, 1, span)
    }
}

fn bad_mode(tag: &str, mnemonic: &str, span: Option<Span>) -> Diagnostic {
    Diagnostic::error(format!("Bad address mode {tag} for {mnemonic}")).at(span)
}

fn force_direct(arg: Arg, span: Option<Span>) -> Result<Arg, Diagnostic> {
    match arg {
        Arg::Address(expr) => Ok(Arg::ZeroPage(expr)),
        Arg::AddressX(expr) => Ok(Arg::ZeroPageX(expr)),
        Arg::AddressY(expr) => Ok(Arg::ZeroPageY(expr)),
        Arg::Accumulator => Err(Diagnostic::error("Cannot force direct on acc").at(span)),
        Arg::Immediate(_) => Err(Diagnostic::error("Cannot force direct on imm").at(span)),
        _ => Err(Diagnostic::error("Bad argument").at(span)),
    }
}

fn force_absolute(arg: Arg, span: Option<Span>) -> Result<Arg, Diagnostic> {
    match arg {
        Arg::Address(expr) => Ok(Arg::Absolute(expr)),
        Arg::AddressX(expr) => Ok(Arg::AbsoluteX(expr)),
        Arg::AddressY(expr) => Ok(Arg::AbsoluteY(expr)),
        Arg::Accumulator => Err(Diagnostic::error("Cannot force absolute on acc").at(span)),
        Arg::Immediate(_) => Err(Diagnostic::error("Cannot force absolute on imm").at(span)),
        _ => Err(Diagnostic::error("Bad argument").at(span)),
    }
}

/// Split an explicit scope path: `(from_global, path segments, tail)`.
pub(crate) fn split_scoped(name: &str) -> (bool, Vec<&str>, &str) {
    let (from_global, rest) = match name.strip_prefix("::") {
        Some(rest) => (true, rest),
        None => (false, name),
    };
    let mut parts: Vec<&str> = rest.split("::").collect();
    let tail = parts.pop().expect("split yields at least one part");
    (from_global, parts, tail)
}

/// File offset of `addr` through the first active segment that maps it.
pub(crate) fn file_offset_in(
    segment_data: &IndexMap<String, Segment>,
    names: &[String],
    addr: u32,
) -> Option<u32> {
    names
        .iter()
        .filter_map(|name| segment_data.get(name))
        .find_map(|segment| segment.file_offset(addr))
}

/// Index of the close token matching the opener at index 0.
fn matching_close(toks: &[Token], open: &str, close: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (index, token) in toks.iter().enumerate() {
        if token.is_op(open) {
            depth += 1;
        } else if token.is_op(close) {
            depth -= 1;
            if depth == 0 {
                return Some(index);
            }
        }
    }
    None
}

/// First comma outside any parenthesis or bracket nesting.
fn top_level_comma(toks: &[Token]) -> Option<usize> {
    let mut depth = 0usize;
    for (index, token) in toks.iter().enumerate() {
        match &token.kind {
            TokenKind::Op(op) if op == "(" || op == "[" => depth += 1,
            TokenKind::Op(op) if op == ")" || op == "]" => depth = depth.saturating_sub(1),
            TokenKind::Op(op) if op == "," && depth == 0 => return Some(index),
            _ => {}
        }
    }
    None
}
