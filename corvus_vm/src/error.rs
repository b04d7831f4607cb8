//! Runtime errors.
//!
//! Program-level failures (null dereference, bad index, missing symbols)
//! never show up here while a handler can still catch them: they become
//! exception objects and unwind through compiled frames. A [`VmError`] is
//! what reaches the embedder once an invocation cannot continue.

use crate::config::ConfigError;
use corvus_bytecode::DescriptorError;
use corvus_gc::HeapError;
use corvus_jit::{AssemblerError, CompileError, ContinuationError, ResolveError};
use thiserror::Error;

/// Errors surfaced at the embedding boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("thunk generation failed: {0}")]
    Assembler(#[from] AssemblerError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    /// An exception propagated to the invocation boundary.
    #[error("uncaught {class}{}", message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    Uncaught {
        class: String,
        message: Option<String>,
        /// Handle of the exception object.
        exception: u64,
    },
    #[error("{method} takes {expected} argument words, {given} given")]
    ArgumentCount {
        method: String,
        expected: usize,
        given: usize,
    },
    #[error("native stack exhausted")]
    StackOverflow,
    #[error(transparent)]
    Continuation(#[from] ContinuationError),
    #[error(transparent)]
    Heap(#[from] HeapError),
    #[error("thread is not attached to this runtime")]
    ForeignThread,
    #[error("runtime has been shut down")]
    ShutDown,
}

impl VmError {
    /// Class name of an uncaught exception.
    pub fn exception_class(&self) -> Option<&str> {
        match self {
            VmError::Uncaught { class, .. } => Some(class),
            _ => None,
        }
    }
}

/// Class definition failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("class {0} is already defined")]
    Duplicate(String),
    #[error("class {0} has no superclass and is not the root class")]
    MissingSuperclass(String),
    #[error("bad descriptor for {class}.{member}: {source}")]
    Descriptor {
        class: String,
        member: String,
        source: DescriptorError,
    },
    #[error("{class}.{method} overrides a method with a different kind")]
    IncompatibleOverride { class: String, method: String },
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// Failures reported by native method implementations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NativeError {
    /// Throw an existing exception object.
    #[error("native threw exception {0:#x}")]
    Throw(u64),
    /// Construct and throw an instance of `class`.
    #[error("{class}: {message}")]
    Raise { class: String, message: String },
}

impl NativeError {
    pub fn raise(class: &str, message: impl Into<String>) -> Self {
        NativeError::Raise {
            class: class.to_string(),
            message: message.into(),
        }
    }
}
