//! Diagnostics: severities, stable codes, locations, and rendering
//!
//! Every pass accumulates `Diagnostic` values instead of short-circuiting so
//! a single run surfaces as many problems as possible. A pass fails only
//! when it cannot construct its output at all.
//!
//! Codes are stable across releases and grouped by origin:
//! `E1xx` parse, `E2xx` type, `E3xx` IR build, `E4xx` memory planning,
//! `E5xx` code generation, `E9xx` internal invariant violations.
//! Warnings use `W5xx`.

use serde::Serialize;

/// Diagnostic severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// Stable error codes. The numeric part is part of the public contract;
/// messages are not.
pub mod codes {
    // Parse
    pub const UNEXPECTED_TOKEN: &str = "E101";
    pub const UNCLOSED_STRING: &str = "E102";
    pub const BAD_LITERAL: &str = "E103";
    pub const EXPECTED_DECLARATION: &str = "E104";

    // Type
    pub const UNKNOWN_TYPE: &str = "E201";
    pub const UNKNOWN_IDENTIFIER: &str = "E202";
    pub const TYPE_MISMATCH: &str = "E203";
    pub const INVALID_LVALUE: &str = "E204";
    pub const NOT_INDEXABLE: &str = "E205";
    pub const UNKNOWN_MEMBER: &str = "E206";
    pub const BAD_BUILTIN: &str = "E207";
    pub const DUPLICATE_DEFINITION: &str = "E208";

    // IR build
    pub const MISSING_RETURN: &str = "E301";
    pub const STORAGE_THROUGH_LOCAL: &str = "E302";
    pub const LOOP_CONTROL_OUTSIDE_LOOP: &str = "E303";
    pub const UNSUPPORTED_EXPRESSION: &str = "E304";

    // Memory planning
    pub const ALLOCATION_FAILED: &str = "E401";
    pub const INVALID_LAYOUT: &str = "E402";

    // Code generation
    pub const UNRESOLVED_PHI: &str = "E501";
    pub const UNALLOCATED_VALUE: &str = "E502";
    pub const SLICE_OF_STORAGE: &str = "W501";
    pub const UNSUPPORTED_INSTRUCTION: &str = "W502";
    pub const UNKNOWN_CALL: &str = "W503";
    pub const SHORT_STRING_LENGTH: &str = "W504";

    // Internal
    pub const MISSING_JUMP_TARGET: &str = "E901";
    pub const STACK_SHAPE: &str = "E902";
    pub const INVARIANT_VIOLATED: &str = "E903";
}

/// A half-open span in the source text, 0-indexed lines and columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SourceLocation {
    pub line: usize,
    pub column: usize,
    /// Length of the offending lexeme in characters; 1 when unknown.
    pub length: usize,
}

impl SourceLocation {
    pub fn new(line: usize, column: usize) -> Self {
        SourceLocation {
            line,
            column,
            length: 1,
        }
    }

    pub fn with_length(line: usize, column: usize, length: usize) -> Self {
        SourceLocation {
            line,
            column,
            length: length.max(1),
        }
    }
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 1-indexed for user display
        write!(f, "{}:{}", self.line + 1, self.column + 1)
    }
}

/// One diagnostic produced by any pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Stable code from [`codes`].
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
    pub message: String,
}

impl Diagnostic {
    pub fn error(code: &'static str, message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            code,
            location: None,
            message: message.into(),
        }
    }

    pub fn warning(code: &'static str, message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Warning,
            code,
            location: None,
            message: message.into(),
        }
    }

    pub fn at(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    /// Render with a source excerpt and caret underline when the location is
    /// known:
    ///
    /// ```text
    /// error[E203]: expected uint256, found bool
    ///  --> transfer.mb:4:9
    ///   |
    /// 4 |     let x: uint256 = true;
    ///   |         ^
    /// ```
    pub fn render(&self, source: &str, source_path: &str) -> String {
        let header = match self.severity {
            Severity::Error => format!("error[{}]: {}", self.code, self.message),
            Severity::Warning => format!("warning[{}]: {}", self.code, self.message),
        };
        let Some(loc) = self.location else {
            return header;
        };
        let mut out = header;
        out.push_str(&format!("\n --> {}:{}", source_path, loc));
        if let Some(line_text) = source.lines().nth(loc.line) {
            let line_no = (loc.line + 1).to_string();
            let gutter = " ".repeat(line_no.len());
            out.push_str(&format!("\n{} |", gutter));
            out.push_str(&format!("\n{} | {}", line_no, line_text));
            let caret_pad = " ".repeat(loc.column);
            let carets = "^".repeat(loc.length.min(line_text.len().saturating_sub(loc.column)).max(1));
            out.push_str(&format!("\n{} | {}{}", gutter, caret_pad, carets));
        }
        out
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sev = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        match self.location {
            Some(loc) => write!(f, "{}[{}] at {}: {}", sev, self.code, loc, self.message),
            None => write!(f, "{}[{}]: {}", sev, self.code, self.message),
        }
    }
}

/// True when any diagnostic in the list is an error.
pub fn has_errors(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(Diagnostic::is_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_filtering() {
        let list = vec![
            Diagnostic::warning(codes::UNKNOWN_CALL, "unknown builtin"),
            Diagnostic::error(codes::TYPE_MISMATCH, "expected uint256"),
        ];
        assert!(has_errors(&list));
        assert!(!has_errors(&list[..1]));
    }

    #[test]
    fn render_with_caret() {
        let source = "name X;\nlet x = true;\n";
        let d = Diagnostic::error(codes::TYPE_MISMATCH, "expected uint256, found bool")
            .at(SourceLocation::with_length(1, 8, 4));
        let rendered = d.render(source, "test.mb");
        assert!(rendered.contains("error[E203]"));
        assert!(rendered.contains("--> test.mb:2:9"));
        assert!(rendered.contains("let x = true;"));
        assert!(rendered.contains("        ^^^^"));
    }

    #[test]
    fn render_without_location() {
        let d = Diagnostic::error(codes::MISSING_JUMP_TARGET, "no offset for block b3");
        assert_eq!(d.render("", "x"), "error[E901]: no offset for block b3");
    }
}
