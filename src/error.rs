//! Error types for loxvm
//!
//! Compile errors are collected as diagnostics; runtime errors carry the
//! source line of the faulting instruction.

use std::fmt;
use thiserror::Error;

/// Where a diagnostic points within the source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// End of input
    End,
    /// A concrete lexeme
    Lexeme(String),
    /// Lexer errors, whose message already describes the offending text
    Unspecified,
}

/// One reported compile-time error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub line: usize,
    pub location: Location,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] Error", self.line)?;
        match &self.location {
            Location::End => write!(f, " at end")?,
            Location::Lexeme(lexeme) => write!(f, " at '{}'", lexeme)?,
            Location::Unspecified => {}
        }
        write!(f, ": {}", self.message)
    }
}

/// Compilation failed; every diagnostic reported during the pass is kept.
#[derive(Debug, Clone, Error)]
#[error("{}", render_diagnostics(.diagnostics))]
pub struct CompileError {
    pub diagnostics: Vec<Diagnostic>,
}

fn render_diagnostics(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Runtime error kinds
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeErrorKind {
    #[error("Stack overflow.")]
    StackOverflow,

    #[error("Stack underflow.")]
    StackUnderflow,

    #[error("Operand must be a number.")]
    OperandMustBeNumber,

    #[error("Operands must be numbers.")]
    OperandsMustBeNumbers,

    #[error("Operands must be two numbers or two strings.")]
    OperandsMustBeNumbersOrStrings,

    #[error("Undefined variable '{0}'.")]
    UndefinedVariable(String),

    #[error("Unknown opcode {0}.")]
    UnknownOpcode(u8),

    #[error("Unexpected end of bytecode.")]
    UnexpectedEndOfCode,

    #[error("Constant {0} is not a variable name.")]
    InvalidName(u8),

    #[error("Failed to write output: {0}")]
    Io(String),
}

/// A runtime error with the line of the instruction that raised it
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}\n[line {line}] in script")]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub line: usize,
}

impl RuntimeError {
    pub fn new(kind: RuntimeErrorKind, line: usize) -> Self {
        Self { kind, line }
    }
}

/// Outcome of `VM::interpret`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

/// Result type for execution
pub type Result<T> = std::result::Result<T, RuntimeError>;
