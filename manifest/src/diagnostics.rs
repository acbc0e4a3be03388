// Diagnostics shared by the lexer, parser and IR compiler.
// This is the format downstream validators and CLIs consume.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::lexer::Position;

/// Diagnostic severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Info => write!(f, "info"),
        }
    }
}

/// Stable diagnostic codes. `L` = lexer, `P` = parser, `S` = semantic.
pub mod codes {
    pub const UNKNOWN_CHARACTER: &str = "L001";
    pub const UNTERMINATED_STRING: &str = "L002";
    pub const UNTERMINATED_COMMENT: &str = "L003";
    pub const UNEXPECTED_TOKEN: &str = "P001";
    pub const RESERVED_WORD: &str = "P002";
    pub const DUPLICATE_CONSTRAINT_CODE: &str = "S001";
    pub const COMPUTED_CYCLE: &str = "S002";
    pub const NOT_LOWERED: &str = "S003";
    pub const NON_CONSTANT_DEFAULT: &str = "S004";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl Diagnostic {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            line: None,
            column: None,
            code: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Severity::Info, message)
    }

    pub fn at(mut self, position: Position) -> Self {
        self.line = Some(position.line);
        self.column = Some(position.column);
        self
    }

    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.severity)?;
        if let Some(code) = &self.code {
            write!(f, "[{}]", code)?;
        }
        match (self.line, self.column) {
            (Some(line), Some(column)) => write!(f, " {}:{}: {}", line, column, self.message),
            (Some(line), None) => write!(f, " {}: {}", line, self.message),
            _ => write!(f, ": {}", self.message),
        }
    }
}

/// True when any diagnostic in the list is an error.
pub fn has_errors(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(Diagnostic::is_error)
}
