use indexmap::IndexMap;

use a65_obj::{Expr, Span};

use crate::diag::Diagnostic;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Scope,
    Proc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(usize);

impl ScopeId {
    pub const ROOT: ScopeId = ScopeId(0);
}

/// What a name in a scope points at.
#[derive(Debug, Clone)]
pub enum ScopeEntry {
    /// Immutable symbol; index into the module symbol array.
    Module(usize),
    /// Mutable symbol (`.set`). Holds the current constant and never becomes
    /// link-visible.
    Mutable(Expr),
}

/// Backing record of a module-array symbol. The index of the record is the
/// symbol id that `Expr::Sym` references use.
#[derive(Debug, Clone, Default)]
pub struct SymbolRecord {
    pub expr: Option<Expr>,
    pub export: Option<String>,
    /// Set when the symbol was referenced through an explicit scope path;
    /// such references are never promoted to a parent scope.
    pub scoped: bool,
    /// First reference site, for diagnostics on undefined symbols.
    pub ref_span: Option<Span>,
}

#[derive(Debug)]
pub struct ScopeData {
    pub kind: ScopeKind,
    pub parent: Option<ScopeId>,
    pub children: IndexMap<String, ScopeId>,
    pub anon_children: Vec<ScopeId>,
    pub symbols: IndexMap<String, ScopeEntry>,
}

impl ScopeData {
    fn new(kind: ScopeKind, parent: Option<ScopeId>) -> Self {
        Self {
            kind,
            parent,
            children: IndexMap::new(),
            anon_children: Vec::new(),
            symbols: IndexMap::new(),
        }
    }
}

/// The scope tree, arena-allocated. Scopes are never removed: closed scopes
/// stay in the tree so the finalizer can promote their leftover forward
/// references.
#[derive(Debug)]
pub struct ScopeTree {
    scopes: Vec<ScopeData>,
}

impl Default for ScopeTree {
    fn default() -> Self {
        Self {
            scopes: vec![ScopeData::new(ScopeKind::Scope, None)],
        }
    }
}

impl ScopeTree {
    pub fn get(&self, id: ScopeId) -> &ScopeData {
        &self.scopes[id.0]
    }

    pub fn get_mut(&mut self, id: ScopeId) -> &mut ScopeData {
        &mut self.scopes[id.0]
    }

    pub fn push_named(&mut self, parent: ScopeId, name: &str, kind: ScopeKind) -> ScopeId {
        let id = ScopeId(self.scopes.len());
        self.scopes.push(ScopeData::new(kind, Some(parent)));
        self.get_mut(parent).children.insert(name.to_string(), id);
        id
    }

    pub fn push_anon(&mut self, parent: ScopeId, kind: ScopeKind) -> ScopeId {
        let id = ScopeId(self.scopes.len());
        self.scopes.push(ScopeData::new(kind, Some(parent)));
        self.get_mut(parent).anon_children.push(id);
        id
    }

    /// Walk the parent chain looking up `name`, nearest scope first.
    pub fn lookup_walk(&self, from: ScopeId, name: &str) -> Option<(ScopeId, ScopeEntry)> {
        let mut scope = Some(from);
        while let Some(id) = scope {
            if let Some(entry) = self.get(id).symbols.get(name) {
                return Some((id, entry.clone()));
            }
            scope = self.get(id).parent;
        }
        None
    }

    /// Resolve an explicit scope path (`a::b` in `a::b::tail`). The first
    /// segment may fall back one level to the parent scope; every other
    /// segment must be a direct named child.
    pub fn navigate(
        &self,
        from: ScopeId,
        from_global: bool,
        path: &[&str],
        span: Option<Span>,
    ) -> Result<ScopeId, Diagnostic> {
        let start = if from_global { ScopeId::ROOT } else { from };
        let mut scope = start;
        for (index, segment) in path.iter().enumerate() {
            let mut next = self.get(scope).children.get(*segment).copied();
            if next.is_none() && index == 0 && !from_global {
                if let Some(parent) = self.get(scope).parent {
                    next = self.get(parent).children.get(*segment).copied();
                }
            }
            scope = next.ok_or_else(|| {
                Diagnostic::error(format!("Could not resolve scope '{segment}'")).at(span)
            })?;
        }
        Ok(scope)
    }
}

/// Labels starting with `@`, live between two non-cheap labels. The records
/// themselves sit in the module symbol arena so forward references to cheap
/// labels patch like any other.
#[derive(Debug, Default)]
pub struct CheapLocals {
    symbols: IndexMap<String, usize>,
}

impl CheapLocals {
    pub fn get(&self, name: &str) -> Option<usize> {
        self.symbols.get(name).copied()
    }

    pub fn insert(&mut self, name: &str, id: usize) {
        self.symbols.insert(name.to_string(), id);
    }

    /// End the current cheap-local region: every cheap symbol must have been
    /// defined by now.
    pub fn clear(&mut self, records: &[SymbolRecord]) -> Result<(), Diagnostic> {
        for (name, &id) in &self.symbols {
            let record = &records[id];
            if record.expr.is_none() {
                return Err(
                    Diagnostic::error(format!("Cheap local label '{name}' never defined"))
                        .at(record.ref_span),
                );
            }
        }
        self.symbols.clear();
        Ok(())
    }
}
