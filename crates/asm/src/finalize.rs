//! End-of-input processing: close out label registries, promote unresolved
//! references to parent scopes, resolve imports and exports, and build the
//! object module.

use a65_obj::{Expr, Module, Symbol, validate_module};

use crate::assembler::{Assembler, Global};
use crate::diag::{AssembleError, Diagnostic};
use crate::scope::{ScopeEntry, ScopeId};

impl Assembler {
    /// Finish the assembly and produce the object module.
    pub fn module(mut self) -> Result<Module, AssembleError> {
        self.finalize().map_err(AssembleError)
    }

    fn finalize(&mut self) -> Result<Module, Diagnostic> {
        // The final cheap-local region ends here; everything must be defined.
        self.cheap_clear()?;
        self.check_dangling_forward_refs()?;

        if self.current != ScopeId::ROOT {
            return Err(Diagnostic::error("Scope never closed"));
        }

        self.promote_tree(ScopeId::ROOT)?;
        self.resolve_globals()?;

        // Whatever is still open at module scope was never defined anywhere.
        let root_entries: Vec<(String, ScopeEntry)> = self
            .scopes
            .get(ScopeId::ROOT)
            .symbols
            .iter()
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect();
        for (name, entry) in root_entries {
            if let ScopeEntry::Module(id) = entry {
                if self.symbols[id].expr.is_none() {
                    return Err(Diagnostic::error(format!("Symbol '{name}' undefined"))
                        .at(self.symbols[id].ref_span));
                }
            }
        }

        let symbols = self
            .symbols
            .iter()
            .map(|record| Symbol {
                expr: record
                    .expr
                    .clone()
                    .expect("every reachable symbol is defined after promotion"),
                export: record.export.clone(),
            })
            .collect();
        let module = Module {
            chunks: std::mem::take(&mut self.chunks),
            symbols,
            segments: std::mem::take(&mut self.segment_data)
                .into_values()
                .collect(),
        };

        validate_module(&module).map_err(|err| Diagnostic::error(err.to_string()))?;
        Ok(module)
    }

    /// Forward references to anonymous, relative or rts labels that never
    /// materialized cannot be promoted; they are errors here.
    fn check_dangling_forward_refs(&self) -> Result<(), Diagnostic> {
        let pending = self
            .anon_fwd
            .iter()
            .map(|slot| (*slot, "Anonymous"))
            .chain(self.rel_fwd.iter().map(|slot| (*slot, "Relative")))
            .chain(self.rts_fwd.iter().map(|slot| (*slot, "Rts")));
        for (slot, what) in pending {
            if let Some(id) = slot {
                if self.symbols[id].expr.is_none() {
                    return Err(Diagnostic::error(format!(
                        "{what} forward reference never defined"
                    ))
                    .at(self.symbols[id].ref_span));
                }
            }
        }
        Ok(())
    }

    /// Post-order sweep: each scope's undefined, unscoped symbols move to
    /// its parent, either by aliasing the record or by pointing it at the
    /// parent's binding.
    fn promote_tree(&mut self, scope: ScopeId) -> Result<(), Diagnostic> {
        let children: Vec<ScopeId> = {
            let data = self.scopes.get(scope);
            data.children
                .values()
                .copied()
                .chain(data.anon_children.iter().copied())
                .collect()
        };
        for child in children {
            self.promote_tree(child)?;
            self.promote_into_parent(child, scope)?;
        }
        Ok(())
    }

    fn promote_into_parent(&mut self, scope: ScopeId, parent: ScopeId) -> Result<(), Diagnostic> {
        let pending: Vec<(String, usize)> = self
            .scopes
            .get(scope)
            .symbols
            .iter()
            .filter_map(|(name, entry)| match entry {
                ScopeEntry::Module(id) if self.symbols[*id].expr.is_none() => {
                    Some((name.clone(), *id))
                }
                _ => None,
            })
            .collect();

        for (name, id) in pending {
            if self.symbols[id].scoped {
                return Err(Diagnostic::error(format!("Symbol '{name}' undefined"))
                    .at(self.symbols[id].ref_span));
            }
            match self.scopes.get(parent).symbols.get(&name).cloned() {
                None => {
                    self.scopes
                        .get_mut(parent)
                        .symbols
                        .insert(name, ScopeEntry::Module(id));
                }
                Some(ScopeEntry::Module(parent_id)) => {
                    self.symbols[id].expr = Some(Expr::sym(parent_id));
                }
                Some(ScopeEntry::Mutable(value)) => {
                    self.symbols[id].expr = Some(value);
                }
            }
        }
        Ok(())
    }

    fn resolve_globals(&mut self) -> Result<(), Diagnostic> {
        let globals: Vec<(String, Global)> = self
            .globals
            .iter()
            .map(|(name, kind)| (name.clone(), *kind))
            .collect();

        for (name, kind) in globals {
            let entry = self.scopes.get(ScopeId::ROOT).symbols.get(&name).cloned();
            match kind {
                Global::Export => match entry {
                    Some(ScopeEntry::Module(id)) => {
                        if self.symbols[id].expr.is_none() {
                            return Err(Diagnostic::error(format!("Symbol '{name}' undefined"))
                                .at(self.symbols[id].ref_span));
                        }
                        self.symbols[id].export = Some(name);
                    }
                    // Exporting a mutable snapshots its final value into the
                    // symbol array.
                    Some(ScopeEntry::Mutable(value)) => {
                        let id = self.new_symbol(None, false);
                        self.symbols[id].expr = Some(value);
                        self.symbols[id].export = Some(name);
                    }
                    None => {
                        return Err(Diagnostic::error(format!("Symbol '{name}' undefined")));
                    }
                },
                Global::Import => match entry {
                    Some(ScopeEntry::Module(id)) => {
                        if self.symbols[id].expr.is_some() {
                            return Err(Diagnostic::error(format!(
                                "Symbol '{name}' cannot be both defined and imported"
                            )));
                        }
                        self.symbols[id].expr = Some(Expr::import(name));
                    }
                    Some(ScopeEntry::Mutable(_)) => {
                        return Err(Diagnostic::error(format!(
                            "Symbol '{name}' cannot be both defined and imported"
                        )));
                    }
                    None => {
                        let id = self.new_symbol(None, false);
                        self.symbols[id].expr = Some(Expr::import(name.clone()));
                        self.scopes
                            .get_mut(ScopeId::ROOT)
                            .symbols
                            .insert(name, ScopeEntry::Module(id));
                    }
                },
            }
        }
        Ok(())
    }
}
