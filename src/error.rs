//! Error types for KaRL.
//!
//! All errors in KaRL are strongly typed using thiserror.
//! Conditions that are normal in a loosely consistent system (stale
//! updates, insufficient write quality, wait timeouts) are not errors;
//! they are returned as plain values by the operations that produce them.

use std::fmt;

use thiserror::Error;

/// What went wrong while compiling KaRL source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileErrorKind {
    /// A token the grammar does not allow at this position.
    UnexpectedToken {
        found: String,
        expected: &'static str,
    },
    /// Input ended while an expression was still open.
    UnexpectedEnd {
        expected: &'static str,
    },
    /// Characters that do not form any KaRL token.
    InvalidToken {
        text: String,
    },
    /// A string literal without its closing quote.
    UnterminatedString,
    /// The left side of an assignment is not a variable or array element.
    InvalidAssignmentTarget,
    /// A sequence or operator is missing one of its operands.
    MissingOperand {
        operator: &'static str,
    },
    /// `#name` is not a known system call.
    UnknownSystemCall {
        name: String,
    },
    /// A system call received the wrong number of arguments.
    SystemCallArity {
        name: &'static str,
        expected: &'static str,
        actual: usize,
    },
    /// A key template whose `{` and `}` do not pair up.
    UnbalancedBraces {
        key: String,
    },
    /// A numeric literal out of range.
    InvalidNumber {
        text: String,
    },
    /// Operands or subexpressions nested past the compiler's limit.
    NestingTooDeep {
        max: usize,
    },
}

impl fmt::Display for CompileErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedToken { found, expected } => {
                write!(f, "unexpected '{found}', expected {expected}")
            }
            Self::UnexpectedEnd { expected } => write!(f, "unexpected end of input, expected {expected}"),
            Self::InvalidToken { text } => write!(f, "invalid token '{text}'"),
            Self::UnterminatedString => write!(f, "unterminated string literal"),
            Self::InvalidAssignmentTarget => {
                write!(f, "assignment target must be a variable or array element")
            }
            Self::MissingOperand { operator } => write!(f, "'{operator}' is missing an operand"),
            Self::UnknownSystemCall { name } => write!(f, "unknown system call '#{name}'"),
            Self::SystemCallArity {
                name,
                expected,
                actual,
            } => write!(f, "#{name} takes {expected} argument(s), got {actual}"),
            Self::UnbalancedBraces { key } => write!(f, "unbalanced braces in key '{key}'"),
            Self::InvalidNumber { text } => write!(f, "invalid numeric literal '{text}'"),
            Self::NestingTooDeep { max } => write!(f, "expression nested deeper than {max} levels"),
        }
    }
}

/// A structured compile diagnostic. The compiler never produces a tree
/// when it reports one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{line}:{column}: {kind}")]
pub struct CompileError {
    /// 1-based line of the offending token.
    pub line: usize,
    /// 1-based column of the offending token.
    pub column: usize,
    pub kind: CompileErrorKind,
}

impl CompileError {
    /// Builds a diagnostic for the byte `offset` into `source`.
    #[must_use]
    pub fn at(source: &str, offset: usize, kind: CompileErrorKind) -> Self {
        let offset = offset.min(source.len());
        let prefix = &source[..offset];
        let line = prefix.matches('\n').count() + 1;
        let column = prefix
            .rfind('\n')
            .map_or(prefix.chars().count(), |nl| prefix[nl + 1..].chars().count())
            + 1;
        Self { line, column, kind }
    }
}

/// Errors raised while evaluating an already compiled tree.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("function call depth exceeded (max: {max_depth})")]
    CallDepthExceeded {
        max_depth: usize,
    },

    #[error("function '{name}' failed: {message}")]
    FunctionFailed {
        name: String,
        message: String,
    },

    #[error("#evaluate could not compile its argument: {0}")]
    Compile(#[from] CompileError),
}

/// Transport errors for peer-to-peer synchronization.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport '{id}' is unavailable (shutting down)")]
    Unavailable {
        id: String,
    },

    #[error("Message of {size} bytes exceeds maximum of {max} bytes")]
    MessageTooLarge {
        size: usize,
        max: usize,
    },

    #[error("Failed to decode message: {message}")]
    Decode {
        message: String,
    },

    #[error("Failed to send message: {message}")]
    Send {
        message: String,
    },
}

/// Top-level error type for KaRL.
#[derive(Debug, Error)]
pub enum KarlError {
    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("Evaluation error: {0}")]
    Eval(#[from] EvalError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {message}")]
    Config {
        message: String,
    },

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl KarlError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns true if this is a compile error, including one raised at
    /// runtime by `#evaluate`.
    #[must_use]
    pub const fn is_compile(&self) -> bool {
        matches!(self, Self::Compile(_) | Self::Eval(EvalError::Compile(_)))
    }

    /// Returns true if this is an evaluation error.
    #[must_use]
    pub const fn is_eval(&self) -> bool {
        matches!(self, Self::Eval(_))
    }

    /// Returns true if this is a transport error.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Returns true if retrying the same call could succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => matches!(e, TransportError::Send { .. }),
            _ => false,
        }
    }
}

/// Result type alias for KaRL operations.
pub type KarlResult<T> = Result<T, KarlError>;
