//! Crate-wide error type.
//!
//! Compile-time stages (parser, compiler) *collect* their errors so one run
//! reports everything; this enum is the surface the embedding host sees when
//! a stage as a whole fails or the VM stops. Script-visible runtime faults
//! are modelled separately in [`crate::vm`] because they can be caught by
//! `try`/`catch` without ever becoming a host-visible error.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// One or more syntax errors; the payload is the collected
    /// `"Line L:C - MESSAGE"` lines joined with newlines.
    #[error("Syntax error: {0}")]
    Syntax(String),

    #[error("Compile error: {0}")]
    Compile(String),

    #[error("Deserialization error: {0}")]
    Deserialize(String),

    /// An unhandled script fault; the payload is the rendered diagnostic.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Heap budget exhausted. Never catchable by script code.
    #[error("Out of memory: heap budget of {0} bytes exhausted")]
    OutOfMemory(u32),
}

pub type Result<T> = std::result::Result<T, Error>;
