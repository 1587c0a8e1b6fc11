//! Compile-Time Error Taxonomy
//!
//! Every diagnostic surfaced by the compiler carries a stable code
//! (`E001..E031`, `E900` for internal invariant violations), a category,
//! and an optional source location. The compiler accumulates diagnostics
//! per pass rather than stopping at the first failure.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Line/column position in the source text (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    pub fn new(line: u32, column: u32) -> Self {
        SourceLocation { line, column }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Diagnostic category, used for grouping in tooling output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    Reference,
    Type,
    Syntax,
    Semantic,
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Reference => "Reference",
            ErrorCategory::Type => "Type",
            ErrorCategory::Syntax => "Syntax",
            ErrorCategory::Semantic => "Semantic",
            ErrorCategory::Internal => "Internal",
        };
        write!(f, "{name}")
    }
}

/// A compile-time diagnostic.
///
/// Type names in messages are canonical renders, so two errors about
/// set-equal unions print identically and de-duplicate.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    // === Syntax ===
    #[error("parse error: {message}")]
    ParseError {
        message: String,
        location: SourceLocation,
    },

    #[error("unexpected token '{found}', expected {expected}")]
    UnexpectedToken {
        expected: String,
        found: String,
        location: SourceLocation,
    },

    // === Reference ===
    #[error("undefined variable '{name}'")]
    UndefinedVariable {
        name: String,
        location: Option<SourceLocation>,
    },

    #[error("undefined function '{name}'")]
    UndefinedFunction {
        name: String,
        location: Option<SourceLocation>,
    },

    #[error("undefined type '{name}'")]
    UndefinedType {
        name: String,
        location: Option<SourceLocation>,
    },

    #[error("undefined namespace '{name}'")]
    UndefinedNamespace {
        name: String,
        location: Option<SourceLocation>,
    },

    #[error("ambiguous function '{name}': imported from both {first} and {second}")]
    AmbiguousFunction {
        name: String,
        first: String,
        second: String,
        location: Option<SourceLocation>,
    },

    #[error("cannot project field '{field}' out of {ty}")]
    InvalidProjection {
        field: String,
        ty: String,
        location: Option<SourceLocation>,
    },

    #[error("cannot access field '{field}' on {ty}")]
    InvalidFieldAccess {
        field: String,
        ty: String,
        location: Option<SourceLocation>,
    },

    // === Type ===
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: String,
        found: String,
        location: Option<SourceLocation>,
    },

    #[error("operator '{op}' cannot be applied to {left} and {right}")]
    IncompatibleOperator {
        op: String,
        left: String,
        right: String,
        location: Option<SourceLocation>,
    },

    #[error("cannot merge {left} with {right}: field '{field}' is {left_field} vs {right_field}")]
    IncompatibleMerge {
        left: String,
        right: String,
        field: String,
        left_field: String,
        right_field: String,
        location: Option<SourceLocation>,
    },

    #[error("values of type {left} and {right} cannot be compared")]
    UnsupportedComparison {
        left: String,
        right: String,
        location: Option<SourceLocation>,
    },

    #[error("arithmetic is not defined on {left} and {right}")]
    UnsupportedArithmetic {
        left: String,
        right: String,
        location: Option<SourceLocation>,
    },

    #[error("invalid value for option '{option}': {reason}")]
    InvalidOptionValue {
        option: String,
        reason: String,
        location: Option<SourceLocation>,
    },

    #[error("fallback type {found} is not a subtype of the module return type {expected}")]
    FallbackTypeMismatch {
        expected: String,
        found: String,
        location: Option<SourceLocation>,
    },

    #[error("match is not exhaustive: unmatched variants {missing}")]
    NonExhaustiveMatch {
        missing: String,
        location: Option<SourceLocation>,
    },

    #[error("pattern expects {expected}, but the scrutinee is {found}")]
    PatternTypeMismatch {
        expected: String,
        found: String,
        location: Option<SourceLocation>,
    },

    #[error("invalid pattern: {reason}")]
    InvalidPattern {
        reason: String,
        location: Option<SourceLocation>,
    },

    // === Semantic ===
    #[error("duplicate definition of '{name}'")]
    DuplicateDefinition {
        name: String,
        location: Option<SourceLocation>,
    },

    #[error("circular dependency involving {cycle}")]
    CircularDependency {
        cycle: String,
        location: Option<SourceLocation>,
    },

    #[error("unsupported construct: {construct}")]
    Unsupported {
        construct: String,
        location: Option<SourceLocation>,
    },

    // === Internal ===
    #[error("internal compiler error: {message}")]
    InternalError { message: String },
}

impl CompileError {
    /// Stable diagnostic code.
    pub fn code(&self) -> &'static str {
        match self {
            CompileError::ParseError { .. } => "E001",
            CompileError::UnexpectedToken { .. } => "E002",
            CompileError::UndefinedVariable { .. } => "E003",
            CompileError::UndefinedFunction { .. } => "E004",
            CompileError::UndefinedType { .. } => "E005",
            CompileError::UndefinedNamespace { .. } => "E006",
            CompileError::AmbiguousFunction { .. } => "E007",
            CompileError::InvalidProjection { .. } => "E008",
            CompileError::InvalidFieldAccess { .. } => "E009",
            CompileError::TypeMismatch { .. } => "E010",
            CompileError::IncompatibleOperator { .. } => "E011",
            CompileError::IncompatibleMerge { .. } => "E012",
            CompileError::UnsupportedComparison { .. } => "E013",
            CompileError::UnsupportedArithmetic { .. } => "E014",
            CompileError::InvalidOptionValue { .. } => "E015",
            CompileError::FallbackTypeMismatch { .. } => "E016",
            CompileError::NonExhaustiveMatch { .. } => "E017",
            CompileError::PatternTypeMismatch { .. } => "E018",
            CompileError::InvalidPattern { .. } => "E019",
            CompileError::DuplicateDefinition { .. } => "E020",
            CompileError::CircularDependency { .. } => "E021",
            CompileError::Unsupported { .. } => "E030",
            CompileError::InternalError { .. } => "E900",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            CompileError::ParseError { .. } | CompileError::UnexpectedToken { .. } => {
                ErrorCategory::Syntax
            }
            CompileError::UndefinedVariable { .. }
            | CompileError::UndefinedFunction { .. }
            | CompileError::UndefinedType { .. }
            | CompileError::UndefinedNamespace { .. }
            | CompileError::AmbiguousFunction { .. }
            | CompileError::InvalidProjection { .. }
            | CompileError::InvalidFieldAccess { .. } => ErrorCategory::Reference,
            CompileError::TypeMismatch { .. }
            | CompileError::IncompatibleOperator { .. }
            | CompileError::IncompatibleMerge { .. }
            | CompileError::UnsupportedComparison { .. }
            | CompileError::UnsupportedArithmetic { .. }
            | CompileError::InvalidOptionValue { .. }
            | CompileError::FallbackTypeMismatch { .. }
            | CompileError::NonExhaustiveMatch { .. }
            | CompileError::PatternTypeMismatch { .. }
            | CompileError::InvalidPattern { .. } => ErrorCategory::Type,
            CompileError::DuplicateDefinition { .. }
            | CompileError::CircularDependency { .. }
            | CompileError::Unsupported { .. } => ErrorCategory::Semantic,
            CompileError::InternalError { .. } => ErrorCategory::Internal,
        }
    }

    /// Source location, if the diagnostic has one.
    pub fn location(&self) -> Option<SourceLocation> {
        match self {
            CompileError::ParseError { location, .. }
            | CompileError::UnexpectedToken { location, .. } => Some(*location),
            CompileError::UndefinedVariable { location, .. }
            | CompileError::UndefinedFunction { location, .. }
            | CompileError::UndefinedType { location, .. }
            | CompileError::UndefinedNamespace { location, .. }
            | CompileError::AmbiguousFunction { location, .. }
            | CompileError::InvalidProjection { location, .. }
            | CompileError::InvalidFieldAccess { location, .. }
            | CompileError::TypeMismatch { location, .. }
            | CompileError::IncompatibleOperator { location, .. }
            | CompileError::IncompatibleMerge { location, .. }
            | CompileError::UnsupportedComparison { location, .. }
            | CompileError::UnsupportedArithmetic { location, .. }
            | CompileError::InvalidOptionValue { location, .. }
            | CompileError::FallbackTypeMismatch { location, .. }
            | CompileError::NonExhaustiveMatch { location, .. }
            | CompileError::PatternTypeMismatch { location, .. }
            | CompileError::InvalidPattern { location, .. }
            | CompileError::DuplicateDefinition { location, .. }
            | CompileError::CircularDependency { location, .. }
            | CompileError::Unsupported { location, .. } => *location,
            CompileError::InternalError { .. } => None,
        }
    }

    /// Render as `error[E###] at line:col: message`.
    pub fn render(&self) -> String {
        match self.location() {
            Some(loc) => format!("error[{}] at {}: {}", self.code(), loc, self),
            None => format!("error[{}]: {}", self.code(), self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_categories() {
        let err = CompileError::UndefinedVariable {
            name: "x".to_string(),
            location: Some(SourceLocation::new(3, 7)),
        };
        assert_eq!(err.code(), "E003");
        assert_eq!(err.category(), ErrorCategory::Reference);
        assert_eq!(err.render(), "error[E003] at 3:7: undefined variable 'x'");
    }

    #[test]
    fn test_internal_errors_have_no_location() {
        let err = CompileError::InternalError {
            message: "missing node".to_string(),
        };
        assert_eq!(err.code(), "E900");
        assert_eq!(err.category(), ErrorCategory::Internal);
        assert_eq!(err.location(), None);
    }
}
