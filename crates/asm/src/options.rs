use serde::Deserialize;

use a65_obj::{Expr, OverwriteMode};

/// Assembly-wide configuration. Deserializable so a host can load it from
/// its project config alongside the linker's.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AssemblerOptions {
    /// Accept `[...]` in addition to `(...)` for indirect operands.
    pub allow_brackets: bool,
    /// Permit `.scope name` to re-enter an existing scope.
    pub reentrant_scopes: bool,
    /// Stamped onto every chunk; governs duplicate writes to a file offset.
    pub overwrite_mode: OverwriteMode,
}

/// Side-channel reference database hooks. All methods default to no-ops so
/// implementors override only what they record.
pub trait RefExtractor {
    fn label(&mut self, name: &str, addr: Option<u32>, segments: &[String]) {
        let _ = (name, addr, segments);
    }

    fn reference(&mut self, expr: &Expr, size: usize, addr: Option<u32>, segments: &[String]) {
        let _ = (expr, size, addr, segments);
    }

    fn assign(&mut self, name: &str, value: i64) {
        let _ = (name, value);
    }
}

/// Sink for `.out` and `.warning` directives (and overwrite warnings).
/// `.error` does not pass through here; it aborts the assembly.
pub trait DiagnosticSink {
    fn out(&mut self, message: &str);
    fn warning(&mut self, message: &str);
}

/// Default sink: forward to the `log` facade.
#[derive(Debug, Default)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn out(&mut self, message: &str) {
        log::info!("{message}");
    }

    fn warning(&mut self, message: &str) {
        log::warn!("{message}");
    }
}
