//! Code generation error types.

use std::error::Error;
use std::fmt;

use crate::ir::VarIdx;

/// Failures while materializing the IR onto the value stack. All of
/// these are fatal for the compilation unit.
#[derive(Debug)]
pub enum CodegenError {
    /// The simulated stack exceeded 255 entries.
    TooDeepStack,
    /// An op referenced a variable that is not on the stack; the IR is
    /// malformed - a compiler bug, not a user error.
    UnknownVariable(VarIdx),
    /// A construct the generator cannot express.
    Unsupported(String),
    Internal(String),
}

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodegenError::TooDeepStack => write!(f, "too deep stack"),
            CodegenError::UnknownVariable(v) => {
                write!(f, "variable _{} not found on the stack", v)
            }
            CodegenError::Unsupported(s) => write!(f, "unsupported construct: {}", s),
            CodegenError::Internal(s) => write!(f, "internal codegen error: {}", s),
        }
    }
}

impl Error for CodegenError {}
