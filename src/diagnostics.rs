//! Source-ranged diagnostic rendering (§7, SPEC_FULL §3).

use std::fmt;

use crate::span::{Interner, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

/// A single rendered diagnostic: `{filename}:{line}:{col}: {severity}: {message}`.
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub span: Span,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, span: Span) -> Self {
        Self { severity: Severity::Error, message: message.into(), span }
    }

    pub fn warning(message: impl Into<String>, span: Span) -> Self {
        Self { severity: Severity::Warning, message: message.into(), span }
    }

    /// Render against `source`, the full text of the span's file, and
    /// `interner`, used to resolve the filename.
    pub fn render(&self, source: &str, interner: &Interner) -> String {
        let (line, col) = line_col(source, self.span.start);
        let filename = interner.resolve(self.span.file);
        format!("{filename}:{line}:{col}: {}: {}", self.severity, self.message)
    }
}

/// 1-based line/column for a byte offset, counting newlines up to it.
fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut col = 1;
    for (i, ch) in source.char_indices() {
        if i >= offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::Id;

    #[test]
    fn line_col_counts_newlines_before_the_offset() {
        let source = "mov q0,1\nadd q0,q0,q1\n";
        assert_eq!(line_col(source, 0), (1, 1));
        assert_eq!(line_col(source, 9), (2, 1));
        assert_eq!(line_col(source, 13), (2, 5));
    }

    #[test]
    fn render_includes_filename_line_and_column() {
        let mut interner = Interner::new();
        let file = interner.intern("main.nyx");
        let source = "mov q0,1\nhlt\n";
        let span = Span::new(file, 9, 12);
        let diag = Diagnostic::error("bad opcode", span);
        let rendered = diag.render(source, &interner);
        assert_eq!(rendered, "main.nyx:2:1: error: bad opcode");
    }
}
