//! Compilation and resolution errors.

use thiserror::Error;

/// Symbolic resolution failures.
///
/// These are program-level errors: the runtime turns them into exceptions
/// raised in the thread that needed the resolution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("class {0} not found")]
    ClassNotFound(String),
    #[error("method {class}.{name}{descriptor} not found")]
    MethodNotFound {
        class: String,
        name: String,
        descriptor: String,
    },
    #[error("field {class}.{name} not found")]
    FieldNotFound { class: String, name: String },
    #[error("incompatible class change: {0}")]
    IncompatibleChange(String),
}

/// Emission failures reported by an assembler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssemblerError {
    #[error("label {0} was never bound")]
    UnboundLabel(u32),
    #[error("branch displacement out of range")]
    DisplacementOverflow,
}

/// Reasons a method could not be compiled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("{0} is abstract")]
    Abstract(String),
    #[error("malformed bytecode in {method} at {offset}: {reason}")]
    Malformed {
        method: String,
        offset: u32,
        reason: &'static str,
    },
    #[error(transparent)]
    Assembler(#[from] AssemblerError),
}

/// Failures capturing or resuming a continuation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContinuationError {
    #[error("no compiled frames to capture")]
    NoFrames,
    #[error("continuation needs {needed} stack words, {available} available")]
    StackOverflow { needed: u64, available: u64 },
}
