//! Tolk compiler middle/back-end
//!
//! A language-independent pipeline from a typed expression IR down to
//! optimized TVM stack-machine assembly:
//!
//! 1. Hindley-Milner style type inference over structural types with
//!    stack widths ([`types`], [`unification`])
//! 2. an abstract IR of operations over virtual variables and its
//!    analyses - splitting, liveness, value facts, no-return marking
//!    ([`ir`], [`expr`], [`analysis`], [`descriptors`])
//! 3. a stack code generator that simulates the value stack and emits
//!    the minimum necessary shuffling ([`codegen`])
//! 4. a peephole optimizer equating instruction windows through the
//!    stack-transform monoid ([`optimizer`])
//!
//! The front-end (lexer, parser, symbol resolution) is an external
//! collaborator: it builds [`expr::Expr`] trees and [`ir::CodeBlob`]s
//! through this crate's API and hands a populated
//! [`context::CompilerContext`] to [`context::CompilerContext::compile_to`].
//!
//! # Example
//!
//! ```rust,ignore
//! use tolkc::{CompilerConfig, CompilerContext};
//!
//! let mut ctx = CompilerContext::new(CompilerConfig::default());
//! // ... define functions through the Expr / CodeBlob API ...
//! let mut out = Vec::new();
//! ctx.compile_to(&mut out)?;
//! ```

pub mod analysis;
pub mod builtins;
pub mod codegen;
pub mod config;
pub mod context;
pub mod descriptors;
pub mod expr;
pub mod ir;
pub mod optimizer;
pub mod types;
pub mod unification;

use std::error::Error;
use std::fmt;
use std::io;

pub use codegen::{AsmOp, AsmOpList, CodegenError};
pub use config::{fs_read_callback, CompilerConfig, OptimizationLevel, ReadCallbackKind};
pub use context::{CompilerContext, FnFlag, FunId, FunctionBody, GlobId};
pub use expr::{Expr, ExprKind};
pub use ir::{CodeBlob, Op, OpKind, SrcLocation};
pub use types::{Atomic, TypeArena, TypeRef};
pub use unification::UnifyError;

/// Exported for banners.
pub const TOLK_VERSION: &str = "0.4.5";

/// Anything that aborts compilation of the current unit.
#[derive(Debug)]
pub enum CompileError {
    /// A type error, reported with both sides pretty-printed.
    Unify { loc: SrcLocation, err: UnifyError },
    /// Undefined symbols, bad l/r-values, redefinitions and friends.
    Semantic { loc: SrcLocation, msg: String },
    /// Stack codegen failure; always fatal for the unit.
    Codegen { function: String, err: CodegenError },
    Io(io::Error),
    /// A broken compiler invariant, not a user error.
    Internal(String),
}

impl CompileError {
    pub fn semantic(loc: SrcLocation, msg: String) -> Self {
        CompileError::Semantic { loc, msg }
    }

    pub fn unify(loc: SrcLocation, err: UnifyError) -> Self {
        CompileError::Unify { loc, err }
    }

    pub fn codegen(function: &str, err: CodegenError) -> Self {
        CompileError::Codegen {
            function: function.to_string(),
            err,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        CompileError::Internal(msg.into())
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Unify { loc, err } => write!(f, "{}: error: {}", loc, err),
            CompileError::Semantic { loc, msg } => write!(f, "{}: error: {}", loc, msg),
            CompileError::Codegen { function, err } => {
                write!(f, "error: in function `{}`: {}", function, err)
            }
            CompileError::Io(e) => write!(f, "error: {}", e),
            CompileError::Internal(msg) => {
                write!(f, "internal error: {} (this is a compiler bug)", msg)
            }
        }
    }
}

impl Error for CompileError {}

impl From<io::Error> for CompileError {
    fn from(e: io::Error) -> Self {
        CompileError::Io(e)
    }
}

/// Run the peephole optimizer over a textual assembly listing, line by
/// line. Unknown instructions pass through untouched as barriers.
pub fn optimize_listing(input: &str, level: OptimizationLevel) -> String {
    let mut ops: Vec<AsmOp> = input.lines().map(AsmOp::parse).collect();
    optimizer::optimize(&mut ops, level);
    let mut out = String::new();
    for op in &ops {
        if op.is_nop() {
            continue;
        }
        out.push_str(&op.to_string());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_banner() {
        assert_eq!(TOLK_VERSION, "0.4.5");
    }

    #[test]
    fn test_error_rendering() {
        let e = CompileError::semantic(SrcLocation::new(3, 14), "undefined symbol `foo`".into());
        assert_eq!(e.to_string(), "3:14: error: undefined symbol `foo`");
        let e = CompileError::internal("oops");
        assert!(e.to_string().contains("compiler bug"));
    }

    #[test]
    fn test_optimize_listing() {
        let out = optimize_listing("SWAP\nSWAP\ns2 PUSH\nDROP\nADD\n", OptimizationLevel::O2);
        assert_eq!(out, "ADD\n");
    }

    #[test]
    fn test_optimize_listing_keeps_unknown_ops() {
        let src = "MYOP\nSWAP\nSWAP\n";
        let out = optimize_listing(src, OptimizationLevel::O2);
        assert_eq!(out, "MYOP\n");
    }
}
