use std::fmt;

use ariadne::{Color, Label, Report, ReportKind, Source};
use thiserror::Error;

use a65_obj::{SourceMap, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// One assembler diagnostic. The span is optional because tokens are not
/// required to carry source locations.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub span: Option<Span>,
    pub hint: Option<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            span: None,
            hint: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
            span: None,
            hint: None,
        }
    }

    pub fn at(mut self, span: Option<Span>) -> Self {
        if self.span.is_none() {
            self.span = span;
        }
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// First-error failure of an assembly run. Rendering with source context is
/// the host's job via [`render_diagnostic`].
#[derive(Debug, Error)]
#[error("{0}")]
pub struct AssembleError(pub Diagnostic);

/// Render a diagnostic against the host's source map. Falls back to a plain
/// one-liner when the diagnostic has no span or the source is unknown.
pub fn render_diagnostic(source_map: &SourceMap, diagnostic: &Diagnostic) -> String {
    let kind = match diagnostic.severity {
        Severity::Error => ReportKind::Error,
        Severity::Warning => ReportKind::Warning,
    };

    let Some(file) = diagnostic
        .span
        .and_then(|span| source_map.get(span.source_id).map(|file| (span, file)))
    else {
        let prefix = match diagnostic.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        return match &diagnostic.hint {
            Some(hint) => format!("{prefix}: {}\n  note: {hint}\n", diagnostic.message),
            None => format!("{prefix}: {}\n", diagnostic.message),
        };
    };
    let (span, file) = file;

    let mut output = Vec::new();
    let mut report = Report::build(kind, file.name.clone(), span.start)
        .with_message(diagnostic.message.clone())
        .with_label(
            Label::new((file.name.clone(), span.start..span.end))
                .with_color(Color::Red)
                .with_message("here"),
        );

    if let Some(hint) = &diagnostic.hint {
        report = report.with_note(hint.clone());
    }

    let _ = report.finish().write(
        (file.name.clone(), Source::from(file.text.clone())),
        &mut output,
    );

    String::from_utf8_lossy(&output).into_owned()
}
