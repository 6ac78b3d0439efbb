use std::{borrow::Cow, fmt};

use crate::token::{SourceId, Token};

/// Category of a compile error, used for telemetry and test assertions.
///
/// Internal invariant violations are deliberately NOT a category here: those
/// panic, so that a bug in the compiler is always distinguishable from a bug
/// in the user's program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// Unexpected token, premature EOF, malformed literal, mismatched delimiter.
    Syntax,
    /// Unexpected end of input. Always fatal: there is nothing left to recover to.
    Eof,
    /// Duplicate declaration, illegal forward reference, circular inheritance,
    /// illegal declaration location.
    Structural,
    /// Non-castable conversion, bad operand type, missing field or method on a
    /// known type.
    Type,
    /// `this`/`super` in static context, `break` outside a loop, return type
    /// mismatch, assignment to a non-lvalue.
    Context,
    /// Regex modifier misuse, negative string repeat, division by zero during
    /// constant folding.
    Special,
}

/// A user-visible compile error.
///
/// Every error points at a token position (source id + offset), never at a
/// node without one. Non-fatal errors are collected and reported together;
/// fatal errors abort the enclosing production via early return.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CompileError {
    pub kind: ErrorKind,
    pub message: Cow<'static, str>,
    pub source: SourceId,
    pub offset: u32,
    pub fatal: bool,
}

impl CompileError {
    pub fn syntax(msg: impl Into<Cow<'static, str>>, token: &Token) -> Self {
        Self {
            kind: ErrorKind::Syntax,
            message: msg.into(),
            source: token.source,
            offset: token.offset,
            fatal: false,
        }
    }

    /// Unexpected end of input. Fatal by construction.
    pub fn eof(msg: impl Into<Cow<'static, str>>, token: &Token) -> Self {
        Self {
            kind: ErrorKind::Eof,
            message: msg.into(),
            source: token.source,
            offset: token.offset,
            fatal: true,
        }
    }

    pub fn structural(msg: impl Into<Cow<'static, str>>, token: &Token) -> Self {
        Self {
            kind: ErrorKind::Structural,
            message: msg.into(),
            source: token.source,
            offset: token.offset,
            fatal: false,
        }
    }

    pub fn type_error(msg: impl Into<Cow<'static, str>>, token: &Token) -> Self {
        Self {
            kind: ErrorKind::Type,
            message: msg.into(),
            source: token.source,
            offset: token.offset,
            fatal: false,
        }
    }

    pub fn context(msg: impl Into<Cow<'static, str>>, token: &Token) -> Self {
        Self {
            kind: ErrorKind::Context,
            message: msg.into(),
            source: token.source,
            offset: token.offset,
            fatal: false,
        }
    }

    pub fn special(msg: impl Into<Cow<'static, str>>, token: &Token) -> Self {
        Self {
            kind: ErrorKind::Special,
            message: msg.into(),
            source: token.source,
            offset: token.offset,
            fatal: false,
        }
    }

    /// Marks this error fatal, so the enclosing production unwinds to its
    /// recovery anchor instead of continuing.
    #[must_use]
    pub fn into_fatal(mut self) -> Self {
        self.fatal = true;
        self
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}:{}", self.message, self.source.index(), self.offset)
    }
}

impl std::error::Error for CompileError {}

/// The collected outcome of a failed compilation: one or more errors in
/// source order.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CompileErrors(Vec<CompileError>);

impl CompileErrors {
    pub fn new(errors: Vec<CompileError>) -> Self {
        debug_assert!(!errors.is_empty(), "CompileErrors must carry at least one error");
        Self(errors)
    }

    pub fn errors(&self) -> &[CompileError] {
        &self.0
    }

    pub fn first(&self) -> &CompileError {
        &self.0[0]
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Renders every error against the source text, one per line, with a
    /// caret line under the offending token.
    pub fn display_against(&self, source: &str) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        for err in &self.0 {
            let offset = err.offset as usize;
            let line_start = source[..offset.min(source.len())].rfind('\n').map_or(0, |i| i + 1);
            let line_no = source[..line_start].matches('\n').count() + 1;
            let line_end = source[line_start..].find('\n').map_or(source.len(), |i| line_start + i);
            let col = offset.saturating_sub(line_start);
            let _ = writeln!(out, "{}: line {line_no}, column {}", err.message, col + 1);
            let _ = writeln!(out, "  {}", &source[line_start..line_end]);
            let _ = writeln!(out, "  {}^", " ".repeat(col));
        }
        out
    }
}

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileErrors {}

impl From<CompileError> for CompileErrors {
    fn from(err: CompileError) -> Self {
        Self(vec![err])
    }
}
