use std::fmt;

use thiserror::Error;

/// A cursor position: byte offset into the fed buffer, plus 1-based line and column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeLocation {
    pub pos: usize,
    pub col: usize,
    pub line: usize,
}

impl CodeLocation {
    pub const fn new(pos: usize, col: usize, line: usize) -> Self {
        Self { pos, col, line }
    }

    pub const fn start() -> Self {
        Self::new(0, 1, 1)
    }
}

impl Default for CodeLocation {
    fn default() -> Self {
        Self::start()
    }
}

/// Why an import could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFailure {
    NotFound,
    PermissionDenied,
    NotAFile,
    Transport,
}

/// Classification of a diagnostic event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    Syntax,
    TypeMismatch,
    MissingProp,
    File(FileFailure),
    Code,
    Critical,
    Thrown,
}

impl DiagnosticKind {
    pub fn label(self) -> &'static str {
        match self {
            DiagnosticKind::Syntax => "SyntaxError",
            DiagnosticKind::TypeMismatch => "TypeMismatchError",
            DiagnosticKind::MissingProp => "MissingPropError",
            DiagnosticKind::File(_) => "FileError",
            DiagnosticKind::Code => "CodeError",
            DiagnosticKind::Critical => "CriticalError",
            DiagnosticKind::Thrown => "UncaughtThrow",
        }
    }
}

/// Where an error was raised, attached by the interpret loop that first catches it.
#[derive(Debug, Clone)]
pub struct Origin {
    pub path: String,
    pub loc: CodeLocation,
    pub code: String,
}

/// One import, class body or function call the error unwound through.
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub path: String,
    pub loc: CodeLocation,
    pub tag: String,
}

/// Rich diagnostic information surfaced to end users.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
    pub origin: Option<Origin>,
    pub pending_loc: Option<CodeLocation>,
    pub trace: Vec<TraceFrame>,
    pub notes: Vec<String>,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            origin: None,
            pending_loc: None,
            trace: Vec::new(),
            notes: Vec::new(),
        }
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(DiagnosticKind::Syntax, message)
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::new(DiagnosticKind::TypeMismatch, message)
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self::new(DiagnosticKind::Critical, message)
    }

    /// Records where the error happened when the raise site does not know the path.
    pub fn at(mut self, loc: CodeLocation) -> Self {
        self.pending_loc = Some(loc);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn is_annotated(&self) -> bool {
        self.origin.is_some()
    }

    /// Attaches the origin once. Later calls leave the first origin untouched.
    pub fn annotate(&mut self, path: &str, loc: CodeLocation, code: impl Into<String>) {
        if self.origin.is_some() {
            return;
        }
        let loc = self.pending_loc.take().unwrap_or(loc);
        self.origin = Some(Origin {
            path: path.to_string(),
            loc,
            code: code.into(),
        });
    }

    pub fn add_trace(&mut self, path: &str, loc: CodeLocation, tag: impl Into<String>) {
        self.trace.push(TraceFrame {
            path: path.to_string(),
            loc,
            tag: tag.into(),
        });
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.trace.is_empty() || self.origin.is_some() {
            writeln!(f, "Traceback (most recent call last):")?;
        }
        for frame in self.trace.iter().rev() {
            writeln!(
                f,
                "  {} at \"{}\", line {}, col {}",
                frame.tag, frame.path, frame.loc.line, frame.loc.col
            )?;
        }
        if let Some(origin) = &self.origin {
            writeln!(
                f,
                "  \"{}\", line {}, col {}",
                origin.path, origin.loc.line, origin.loc.col
            )?;
            let code = origin.code.trim_end();
            if !code.is_empty() {
                let indent = code.len() - code.trim_start().len();
                writeln!(f, "    {}", code.trim_start())?;
                let caret = origin.loc.col.saturating_sub(1).saturating_sub(indent);
                writeln!(f, "    {}^", " ".repeat(caret))?;
            }
        }
        write!(f, "{}: {}", self.kind.label(), self.message)?;
        for note in &self.notes {
            write!(f, "\n  note: {note}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Diagnostic {}

/// Unified error type for the dit toolchain.
#[derive(Debug, Error)]
pub enum DitError {
    #[error("{0}")]
    Diagnostic(#[from] Diagnostic),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DitError {
    pub fn kind(&self) -> Option<DiagnosticKind> {
        match self {
            DitError::Diagnostic(diag) => Some(diag.kind),
            DitError::Io(_) => None,
        }
    }

    pub fn diagnostic(&self) -> Option<&Diagnostic> {
        match self {
            DitError::Diagnostic(diag) => Some(diag),
            DitError::Io(_) => None,
        }
    }

    pub(crate) fn annotate(mut self, path: &str, loc: CodeLocation, code: impl Into<String>) -> Self {
        if let DitError::Diagnostic(diag) = &mut self {
            diag.annotate(path, loc, code);
        }
        self
    }

    pub(crate) fn traced(mut self, path: &str, loc: CodeLocation, tag: impl Into<String>) -> Self {
        if let DitError::Diagnostic(diag) = &mut self {
            diag.add_trace(path, loc, tag);
        }
        self
    }
}

pub type Result<T> = std::result::Result<T, DitError>;
