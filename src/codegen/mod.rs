//! Stack-machine code generation
//!
//! Turns analyzed IR into TVM assembly text. The generation is split
//! into focused submodules:
//!
//! - `asm.rs`: output instructions (`AsmOp`) and per-function lists
//! - `stack.rs`: the simulated value stack and the primitive moves
//! - `emit.rs`: per-op generation, control flow, branch merging
//! - `error.rs`: error types
//!
//! The generator's contract is simple: after every op, the simulated
//! stack matches what the real machine would hold, and every fixup it
//! emits is made of XCHG/PUSH/POP (plus a single block rotation for
//! consumed operands) so the peephole optimizer can rewrite the result
//! into canonical form.

pub mod asm;
pub mod emit;
pub mod error;
pub mod stack;

pub use asm::{AsmOp, AsmOpList};
pub use error::CodegenError;
pub use stack::{Stack, StackMode};
