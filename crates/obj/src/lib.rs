pub mod expr;
pub mod intervals;
pub mod model;
pub mod span;
pub mod validate;

pub use expr::{BinaryOp, Expr, ExprKind, Meta, SymRef, UnaryOp, evaluate, size_of_value};
pub use intervals::IntervalSet;
pub use model::{
    Addressing, Chunk, Module, OverwriteMode, Segment, Substitution, Symbol,
};
pub use span::{SourceId, SourceMap, Span};
pub use validate::validate_module;
