use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use a65_obj::{Addressing, Expr, ExprKind, Meta, Segment, Span, evaluate};

use crate::assembler::{Assembler, Global, file_offset_in};
use crate::diag::Diagnostic;
use crate::scope::ScopeKind;
use crate::token::{Line, Token, TokenKind};

impl Assembler {
    pub(crate) fn directive(&mut self, name: &str, line: &Line) -> Result<(), Diagnostic> {
        let span = line[0].span;
        let args = &line[1..];
        match name {
            ".org" => self.dir_org(args, span),
            ".reloc" => {
                self.org = None;
                self.chunk = None;
                Ok(())
            }
            ".segment" => self.dir_segment(args, span),
            ".pushseg" => self.dir_pushseg(args, span),
            ".popseg" => self.dir_popseg(span),
            ".segmentprefix" => {
                let prefix = single_str(args)
                    .ok_or_else(|| Diagnostic::error("Bad argument").at(span))?;
                self.segment_prefix = prefix.to_string();
                Ok(())
            }
            ".byte" => self.dir_byte(args, span),
            ".word" => self.dir_word(args, span),
            ".res" => self.dir_res(args, span),
            ".bytestr" => self.dir_bytestr(args, span),
            ".free" => self.dir_free(args, span),
            ".assert" => self.dir_assert(args, span),
            ".scope" => {
                let name = match args {
                    [] => None,
                    [token] => Some(
                        token
                            .ident_text()
                            .ok_or_else(|| Diagnostic::error("Expected identifier").at(span))?
                            .to_string(),
                    ),
                    _ => return Err(Diagnostic::error("Bad argument").at(span)),
                };
                self.enter_scope(name.as_deref(), ScopeKind::Scope, span)
            }
            ".endscope" => self.close_scope(ScopeKind::Scope, span),
            ".proc" => {
                let [token] = args else {
                    return Err(Diagnostic::error("Expected identifier").at(span));
                };
                let name = token
                    .ident_text()
                    .ok_or_else(|| Diagnostic::error("Expected identifier").at(span))?
                    .to_string();
                self.define_label(&name, token.span)?;
                self.enter_scope(Some(&name), ScopeKind::Proc, span)
            }
            ".endproc" => self.close_scope(ScopeKind::Proc, span),
            ".import" => self.dir_global(args, Global::Import, span),
            ".export" => self.dir_global(args, Global::Export, span),
            ".move" => self.dir_move(args, span),
            ".out" => {
                let message = single_str(args)
                    .ok_or_else(|| Diagnostic::error("Bad argument").at(span))?
                    .to_string();
                self.sink.out(&message);
                Ok(())
            }
            ".warning" => {
                let message = single_str(args)
                    .ok_or_else(|| Diagnostic::error("Bad argument").at(span))?
                    .to_string();
                self.sink.warning(&message);
                Ok(())
            }
            ".error" => {
                let message = single_str(args)
                    .ok_or_else(|| Diagnostic::error("Bad argument").at(span))?;
                Err(Diagnostic::error(message.to_string()).at(span))
            }
            _ => Err(Diagnostic::error(format!("Unknown directive {name}")).at(span)),
        }
    }

    fn const_expr(&mut self, toks: &[Token], span: Option<Span>) -> Result<i64, Diagnostic> {
        let expr = evaluate(&self.parse_expr(toks)?);
        expr.const_value()
            .ok_or_else(|| Diagnostic::error("Expression is not constant").at(span))
    }

    fn const_u32(&mut self, toks: &[Token], span: Option<Span>) -> Result<u32, Diagnostic> {
        let value = self.const_expr(toks, span)?;
        u32::try_from(value).map_err(|_| Diagnostic::error("Bad argument").at(span))
    }

    fn dir_org(&mut self, args: &[Token], span: Option<Span>) -> Result<(), Diagnostic> {
        let addr = self.const_u32(args, span)?;

        // Continuing exactly where the open chunk ends is not a relocation,
        // so keep appending to it.
        if let Some(idx) = self.chunk {
            let chunk = &self.chunks[idx];
            if chunk.org.map(|org| org + chunk.data.len() as u32) == Some(addr) {
                self.org = Some(addr);
                return Ok(());
            }
        }
        self.org = Some(addr);
        self.chunk = None;
        Ok(())
    }

    fn dir_segment(&mut self, args: &[Token], span: Option<Span>) -> Result<(), Diagnostic> {
        if args.is_empty() {
            return Err(Diagnostic::error("Expected a segment list").at(span));
        }

        let mut names = Vec::new();
        for part in split_commas(args) {
            let Some((first, attrs)) = part.split_first() else {
                return Err(Diagnostic::error("Expected a segment list").at(span));
            };
            let Some(text) = first.str_text() else {
                return Err(Diagnostic::error("Expected a segment list").at(first.span));
            };
            let name = format!("{}{}", self.segment_prefix, text);
            self.apply_segment_attrs(&name, attrs)?;
            names.push(name);
        }

        self.segments = names;
        self.chunk = None;
        Ok(())
    }

    /// Attribute list after a segment name: `ident value` pairs plus the
    /// bare `zp` flag.
    fn apply_segment_attrs(&mut self, name: &str, attrs: &[Token]) -> Result<(), Diagnostic> {
        if !self.segment_data.contains_key(name) {
            self.segment_data
                .insert(name.to_string(), Segment::new(name));
        }

        let mut index = 0;
        while index < attrs.len() {
            let token = &attrs[index];
            let key = token
                .ident_text()
                .ok_or_else(|| Diagnostic::error("Bad argument").at(token.span))?
                .to_ascii_lowercase();

            if key == "zp" {
                let segment = self.segment_data.get_mut(name).expect("segment exists");
                segment.addressing = Addressing::ZeroPage;
                index += 1;
                continue;
            }

            let value = attrs
                .get(index + 1)
                .ok_or_else(|| Diagnostic::error("Bad argument").at(token.span))?;
            match key.as_str() {
                "bank" | "size" | "off" | "mem" | "fill" => {
                    let TokenKind::Num { value: number, .. } = &value.kind else {
                        return Err(Diagnostic::error("Bad argument").at(value.span));
                    };
                    let number = *number;
                    let segment = self.segment_data.get_mut(name).expect("segment exists");
                    match key.as_str() {
                        "bank" => segment.bank = Some(to_u32(number, value.span)?),
                        "size" => segment.size = Some(to_u32(number, value.span)?),
                        "off" => segment.offset = Some(to_u32(number, value.span)?),
                        "mem" => segment.memory = Some(to_u32(number, value.span)?),
                        "fill" => {
                            segment.fill = Some(
                                u8::try_from(number)
                                    .map_err(|_| Diagnostic::error("Bad argument").at(value.span))?,
                            )
                        }
                        _ => unreachable!(),
                    }
                }
                "out" | "overlay" => {
                    let Some(text) = value.str_text() else {
                        return Err(Diagnostic::error("Bad argument").at(value.span));
                    };
                    let segment = self.segment_data.get_mut(name).expect("segment exists");
                    match key.as_str() {
                        "out" => segment.out = Some(text.to_string()),
                        "overlay" => segment.overlay = Some(text.to_string()),
                        _ => unreachable!(),
                    }
                }
                _ => return Err(Diagnostic::error("Bad argument").at(token.span)),
            }
            index += 2;
        }

        // A sized segment without an explicit file offset claims the next
        // free span of the output file.
        let segment = self.segment_data.get_mut(name).expect("segment exists");
        if let Some(size) = segment.size {
            if segment.offset.is_none() {
                segment.offset = Some(self.next_file_offset);
                self.next_file_offset += size;
            }
            // Fillable segments start out entirely free for placement.
            if segment.fill.is_some() {
                if let Some(memory) = segment.memory {
                    segment.free.add(memory, memory + size);
                }
            }
        }
        Ok(())
    }

    fn dir_pushseg(&mut self, args: &[Token], span: Option<Span>) -> Result<(), Diagnostic> {
        self.segment_stack.push((self.segments.clone(), self.chunk));
        if args.is_empty() {
            return Ok(());
        }

        let mut names = Vec::new();
        for part in split_commas(args) {
            let [token] = part else {
                return Err(Diagnostic::error("Expected a segment list").at(span));
            };
            let Some(text) = token.str_text() else {
                return Err(Diagnostic::error("Expected a segment list").at(token.span));
            };
            names.push(format!("{}{}", self.segment_prefix, text));
        }
        self.segments = names;
        self.chunk = None;
        Ok(())
    }

    fn dir_popseg(&mut self, span: Option<Span>) -> Result<(), Diagnostic> {
        let Some((segments, chunk)) = self.segment_stack.pop() else {
            return Err(Diagnostic::error(".popseg without .pushseg").at(span));
        };
        self.segments = segments;
        self.chunk = chunk;
        Ok(())
    }

    fn dir_byte(&mut self, args: &[Token], span: Option<Span>) -> Result<(), Diagnostic> {
        for part in split_commas(args) {
            match part {
                [] => return Err(Diagnostic::error("Bad argument").at(span)),
                [token] if token.str_text().is_some() => {
                    let bytes = token
                        .str_text()
                        .expect("checked above")
                        .bytes()
                        .collect::<Vec<_>>();
                    self.emit_bytes(&bytes, token.span)?;
                }
                _ => {
                    let expr = self.parse_expr(part)?;
                    self.emit_expr(expr, 1, span)?;
                }
            }
        }
        Ok(())
    }

    fn dir_word(&mut self, args: &[Token], span: Option<Span>) -> Result<(), Diagnostic> {
        for part in split_commas(args) {
            if part.is_empty() {
                return Err(Diagnostic::error("Bad argument").at(span));
            }
            let expr = self.parse_expr(part)?;
            self.emit_expr(expr, 2, span)?;
        }
        Ok(())
    }

    fn dir_res(&mut self, args: &[Token], span: Option<Span>) -> Result<(), Diagnostic> {
        let parts = split_commas(args);
        let (count_toks, value_toks) = match parts.as_slice() {
            [count] => (*count, None),
            [count, value] => (*count, Some(*value)),
            _ => return Err(Diagnostic::error("Bad argument").at(span)),
        };

        let count = self.const_u32(count_toks, span)? as usize;
        let value = match value_toks {
            Some(toks) => {
                let value = self.const_expr(toks, span)?;
                u8::try_from(value & 0xFF).expect("masked to a byte")
            }
            None => 0,
        };
        self.emit_bytes(&vec![value; count], span)
    }

    fn dir_bytestr(&mut self, args: &[Token], span: Option<Span>) -> Result<(), Diagnostic> {
        let Some(text) = single_str(args) else {
            return Err(Diagnostic::error("Bad argument").at(span));
        };
        let bytes = BASE64
            .decode(text)
            .map_err(|_| Diagnostic::error("Bad base64 string in .bytestr").at(span))?;
        self.emit_bytes(&bytes, span)
    }

    fn dir_free(&mut self, args: &[Token], span: Option<Span>) -> Result<(), Diagnostic> {
        let length = self.const_u32(args, span)?;
        let Some(addr) = self.current_address() else {
            return Err(Diagnostic::error(".free in .reloc mode").at(span));
        };

        let containing: Vec<String> = self
            .segments
            .iter()
            .filter(|name| {
                self.segment_data
                    .get(*name)
                    .is_some_and(|segment| segment.contains(addr))
            })
            .cloned()
            .collect();
        let [name] = containing.as_slice() else {
            return Err(
                Diagnostic::error(format!(
                    "Expected a single containing segment for .free at {addr:#X}"
                ))
                .at(span),
            );
        };

        // Freed file ranges count as written so later `.org` code cannot
        // silently land on them.
        if let Some(offset) = file_offset_in(&self.segment_data, &self.segments, addr) {
            self.written.add(offset, offset + length);
        }

        let segment = self.segment_data.get_mut(name).expect("segment exists");
        segment.free.add(addr, addr + length);

        self.chunk = None;
        self.org = Some(addr + length);
        Ok(())
    }

    fn dir_assert(&mut self, args: &[Token], span: Option<Span>) -> Result<(), Diagnostic> {
        let parts = split_commas(args);
        let (expr_toks, level, message) = match parts.as_slice() {
            [expr] => (*expr, AssertLevel::Error, None),
            [expr, level] => (*expr, assert_level(level, span)?, None),
            [expr, level, message] => {
                let [token] = message else {
                    return Err(Diagnostic::error("Bad argument").at(span));
                };
                let text = token
                    .str_text()
                    .ok_or_else(|| Diagnostic::error("Bad argument").at(token.span))?;
                (*expr, assert_level(level, span)?, Some(text.to_string()))
            }
            _ => return Err(Diagnostic::error("Bad argument").at(span)),
        };

        let expr = evaluate(&self.parse_expr(expr_toks)?);
        match expr.const_value() {
            Some(0) => {
                let message = message.unwrap_or_else(|| "Assertion failed".to_string());
                match level {
                    AssertLevel::Error => Err(Diagnostic::error(message).at(span)),
                    AssertLevel::Warning => {
                        self.sink.warning(&message);
                        Ok(())
                    }
                }
            }
            Some(_) => Ok(()),
            None => {
                // Not decidable here; the linker re-evaluates it after
                // placement.
                let idx = self.ensure_chunk();
                self.chunks[idx].asserts.push(expr);
                Ok(())
            }
        }
    }

    fn dir_global(
        &mut self,
        args: &[Token],
        kind: Global,
        span: Option<Span>,
    ) -> Result<(), Diagnostic> {
        for part in split_commas(args) {
            let [token] = part else {
                return Err(Diagnostic::error("Expected identifier").at(span));
            };
            let name = token
                .ident_text()
                .ok_or_else(|| Diagnostic::error("Expected identifier").at(token.span))?;
            if self.globals.get(name).is_some_and(|existing| *existing != kind) {
                return Err(Diagnostic::error(format!(
                    "Symbol '{name}' cannot be both imported and exported"
                ))
                .at(token.span));
            }
            self.globals.insert(name.to_string(), kind);
        }
        Ok(())
    }

    fn dir_move(&mut self, args: &[Token], span: Option<Span>) -> Result<(), Diagnostic> {
        let parts = split_commas(args);
        let [count_toks, expr_toks] = parts.as_slice() else {
            return Err(Diagnostic::error("Bad argument").at(span));
        };
        let length = self.const_u32(count_toks, span)? as usize;
        let arg = evaluate(&self.parse_expr(expr_toks)?);
        let expr = Expr {
            kind: ExprKind::Move(Box::new(arg)),
            meta: Meta::default(),
            span,
        };
        self.emit_expr(expr, length, span)
    }
}

#[derive(Debug, Clone, Copy)]
enum AssertLevel {
    Error,
    Warning,
}

fn assert_level(toks: &[Token], span: Option<Span>) -> Result<AssertLevel, Diagnostic> {
    let [token] = toks else {
        return Err(Diagnostic::error("Bad argument").at(span));
    };
    if token.is_ident_ci("error") {
        return Ok(AssertLevel::Error);
    }
    if token.is_ident_ci("warning") {
        return Ok(AssertLevel::Warning);
    }
    Err(Diagnostic::error("Bad argument").at(token.span))
}

fn to_u32(value: i64, span: Option<Span>) -> Result<u32, Diagnostic> {
    u32::try_from(value).map_err(|_| Diagnostic::error("Bad argument").at(span))
}

fn single_str(args: &[Token]) -> Option<&str> {
    match args {
        [token] => token.str_text(),
        _ => None,
    }
}

/// Split on commas outside any parenthesis or bracket nesting.
fn split_commas(toks: &[Token]) -> Vec<&[Token]> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (index, token) in toks.iter().enumerate() {
        match &token.kind {
            TokenKind::Op(op) if op == "(" || op == "[" => depth += 1,
            TokenKind::Op(op) if op == ")" || op == "]" => depth = depth.saturating_sub(1),
            TokenKind::Op(op) if op == "," && depth == 0 => {
                parts.push(&toks[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    parts.push(&toks[start..]);
    parts
}
