//! Diagnostics.
//!
//! Errors in this crate are counted, not thrown: a malformed program should
//! produce as many useful messages as possible in one run, and the assembler
//! listing is still written below a configurable error threshold to aid
//! diagnosis. Passes that need well-formed input check the counter and skip.
//!
//! Every diagnostic carries a [`SourceLoc`]. Sites with no natural source
//! position (helper-library glue, synthesized labels) use
//! [`SourceLoc::builtin`]; a diagnostic with no location at all cannot be
//! constructed.

use std::fmt;
use thiserror::Error;

/// A source position: file name and 1-based line number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLoc {
    /// Name of the source file.
    pub file: String,
    /// Line number, or 0 for synthesized locations.
    pub line: u32,
}

impl SourceLoc {
    /// A location in user source.
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }

    /// The location used for compiler-synthesized constructs.
    pub fn builtin() -> Self {
        Self {
            file: "<builtin>".to_string(),
            line: 0,
        }
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.line == 0 {
            write!(f, "{}", self.file)
        } else {
            write!(f, "{}:{}", self.file, self.line)
        }
    }
}

/// Diagnostic severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    /// Problems that do not stop compilation; promoted to errors under
    /// `warnings_are_errors`.
    Warning,
    /// Problems that make the output unusable.
    Error,
    /// A bug in the compiler itself, never in user source.
    Internal,
}

/// A recorded diagnostic.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    /// How bad it is.
    pub severity: Severity,
    /// Where it happened.
    pub loc: SourceLoc,
    /// The message.
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let tag = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Internal => "internal error",
        };
        write!(f, "{}: {}: {}", self.loc, tag, self.message)
    }
}

/// The diagnostics sink shared by all passes through the compile context.
#[derive(Default)]
pub struct Diagnostics {
    messages: Vec<Diagnostic>,
    errors: u32,
    warnings: u32,
    /// Treat warnings as errors.
    pub warnings_are_errors: bool,
    /// Stop reporting (but keep counting) past this many errors.
    pub max_errors: u32,
}

impl Diagnostics {
    /// Create a sink with the default error threshold.
    pub fn new() -> Self {
        Self {
            max_errors: 25,
            ..Self::default()
        }
    }

    /// Record an error.
    pub fn error(&mut self, loc: SourceLoc, message: impl Into<String>) {
        self.report(Severity::Error, loc, message.into());
    }

    /// Record a warning (or an error under `warnings_are_errors`).
    pub fn warning(&mut self, loc: SourceLoc, message: impl Into<String>) {
        if self.warnings_are_errors {
            self.report(Severity::Error, loc, message.into());
        } else {
            self.report(Severity::Warning, loc, message.into());
        }
    }

    /// Record an internal error. These always indicate a compiler bug.
    pub fn internal(&mut self, loc: SourceLoc, message: impl Into<String>) {
        self.report(Severity::Internal, loc, message.into());
    }

    fn report(&mut self, severity: Severity, loc: SourceLoc, message: String) {
        let diag = Diagnostic {
            severity,
            loc,
            message,
        };
        match severity {
            Severity::Warning => {
                self.warnings += 1;
                log::warn!("{}", diag);
            }
            Severity::Error | Severity::Internal => {
                self.errors += 1;
                log::error!("{}", diag);
            }
        }
        if self.errors <= self.max_errors {
            self.messages.push(diag);
        }
    }

    /// Number of errors recorded so far.
    pub fn error_count(&self) -> u32 {
        self.errors
    }

    /// Number of warnings recorded so far.
    pub fn warning_count(&self) -> u32 {
        self.warnings
    }

    /// True if any error has been recorded.
    pub fn has_errors(&self) -> bool {
        self.errors > 0
    }

    /// True if the error count is past the threshold where passes should
    /// stop doing real work.
    pub fn over_limit(&self) -> bool {
        self.errors > self.max_errors
    }

    /// All recorded diagnostics, in report order.
    pub fn messages(&self) -> &[Diagnostic] {
        &self.messages
    }
}

/// A compilation failure, reported by API entry points once a pass has left
/// errors in the [`Diagnostics`] sink.
#[derive(Error, Debug)]
pub enum CodegenError {
    /// The source program was rejected; the sink holds the details.
    #[error("compilation failed with {0} error(s)")]
    Errors(u32),
    /// A bug in the compiler.
    #[error("internal compiler error at {0}: {1}")]
    Internal(SourceLoc, String),
}

/// The result type used by this crate's entry points.
pub type CodegenResult<T> = Result<T, CodegenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts() {
        let mut d = Diagnostics::new();
        d.warning(SourceLoc::new("x.spin", 3), "suspicious");
        d.error(SourceLoc::new("x.spin", 4), "bad");
        assert_eq!(d.error_count(), 1);
        assert_eq!(d.warning_count(), 1);
        assert!(d.has_errors());
    }

    #[test]
    fn warnings_promoted() {
        let mut d = Diagnostics::new();
        d.warnings_are_errors = true;
        d.warning(SourceLoc::builtin(), "suspicious");
        assert_eq!(d.error_count(), 1);
        assert_eq!(d.warning_count(), 0);
    }

    #[test]
    fn builtin_loc_display() {
        assert_eq!(SourceLoc::builtin().to_string(), "<builtin>");
        assert_eq!(SourceLoc::new("a.bas", 7).to_string(), "a.bas:7");
    }
}
