//! Compiler context
//!
//! Everything that used to be process-global in older stack-machine
//! compilers - the type arena, the function and global tables, counters
//! and configuration - lives in one [`CompilerContext`] value that is
//! threaded through the pipeline. Nothing in the core touches process
//! state.

use std::collections::HashMap;
use std::io::Write;

use enumset::{EnumSet, EnumSetType};

use crate::builtins::define_builtins;
use crate::codegen::asm::{AsmOp, AsmOpList};
use crate::codegen::emit::compile_blob;
use crate::config::CompilerConfig;
use crate::descriptors::VarDescr;
use crate::ir::{CodeBlob, Op, OpKind, SrcLocation};
use crate::types::{TypeArena, TypeRef};
use crate::CompileError;

/// Index into the context's function table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunId(pub u32);

/// Index into the context's global-variable table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobId(pub u32);

#[derive(EnumSetType, Debug)]
pub enum FnFlag {
    /// Body is substituted at every call site.
    Inline,
    /// Body is emitted once as a PROCREF and referenced from call sites.
    InlineRef,
    /// `fn f(...args) { return g(...args) }`; calls to f become calls to g.
    WrapsAnotherF,
    /// Used as a first-class value, not only called directly.
    UsedAsNonCall,
    /// Declared pure; dead invocations may be dropped.
    MarkedAsPure,
    /// Registered by `define_builtins`, not compiled from source.
    BuiltinFunction,
    /// A get method; gets an auto-assigned method id.
    GetMethod,
    /// Control never returns from a call (throw and friends).
    NeverReturns,
}

/// Simple builtin backend: one instruction computed from the operand
/// descriptors. Doubles as the value-fact transfer function: it fills
/// the `out` descriptors and may mark absorbed constant inputs unused.
pub type SimpleCompileFn = fn(&mut [VarDescr], &mut [VarDescr], SrcLocation) -> AsmOp;

/// Extended builtin backend: appends arbitrarily many instructions.
pub type ExtCompileFn = fn(&mut AsmOpList, &mut [VarDescr], &mut [VarDescr]) -> bool;

/// How a builtin turns into code.
#[derive(Clone, Copy)]
pub enum BuiltinCompile {
    Simple(SimpleCompileFn),
    Ext(ExtCompileFn),
}

/// The three flavors of function bodies.
pub enum FunctionBody {
    /// User code lowered to IR.
    Code(CodeBlob),
    /// A fixed instruction sequence.
    AsmMacro(Vec<AsmOp>),
    /// A compile function producing instructions per call site.
    Compiled(BuiltinCompile),
}

pub struct Function {
    pub name: String,
    pub ty: TypeRef,
    pub flags: EnumSet<FnFlag>,
    pub method_id: Option<u32>,
    /// Permutation applied to the arguments before codegen, for asm
    /// builtins whose instruction wants operands in a different order.
    pub arg_order: Vec<usize>,
    pub body: FunctionBody,
    pub loc: SrcLocation,
    /// Reached from an entry point; computed before codegen when the
    /// `remove_unused_functions` pragma is on.
    pub is_really_used: bool,
}

impl Function {
    pub fn is_inline(&self) -> bool {
        self.flags.contains(FnFlag::Inline)
    }

    pub fn is_inline_ref(&self) -> bool {
        self.flags.contains(FnFlag::InlineRef)
    }

    pub fn is_pure(&self) -> bool {
        self.flags.contains(FnFlag::MarkedAsPure)
    }

    pub fn is_builtin(&self) -> bool {
        self.flags.contains(FnFlag::BuiltinFunction)
    }

    pub fn is_get_method(&self) -> bool {
        self.flags.contains(FnFlag::GetMethod)
    }
}

pub struct GlobalVar {
    pub name: String,
    pub ty: TypeRef,
    pub is_really_used: bool,
}

/// CRC-16/XMODEM, used to derive get-method ids from names.
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &b in data {
        crc ^= (b as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Method ids live above 2^16 so they never collide with the two
/// reserved entry points (0 and -1 map elsewhere).
pub fn method_id_for(name: &str) -> u32 {
    (crc16(name.as_bytes()) as u32 & 0xffff) | 0x10000
}

pub struct CompilerContext {
    pub config: CompilerConfig,
    pub types: TypeArena,
    pub functions: Vec<Function>,
    pub globals: Vec<GlobalVar>,
    fun_by_name: HashMap<String, FunId>,
}

impl CompilerContext {
    pub fn new(config: CompilerConfig) -> Self {
        let mut ctx = CompilerContext {
            config,
            types: TypeArena::new(),
            functions: Vec::new(),
            globals: Vec::new(),
            fun_by_name: HashMap::new(),
        };
        define_builtins(&mut ctx);
        ctx
    }

    pub fn fun(&self, id: FunId) -> &Function {
        &self.functions[id.0 as usize]
    }

    pub fn fun_mut(&mut self, id: FunId) -> &mut Function {
        &mut self.functions[id.0 as usize]
    }

    pub fn glob(&self, id: GlobId) -> &GlobalVar {
        &self.globals[id.0 as usize]
    }

    pub fn lookup_function(&self, name: &str) -> Option<FunId> {
        self.fun_by_name.get(name).copied()
    }

    pub fn define_function(
        &mut self,
        name: impl Into<String>,
        ty: TypeRef,
        flags: EnumSet<FnFlag>,
        body: FunctionBody,
        loc: SrcLocation,
    ) -> Result<FunId, CompileError> {
        let name = name.into();
        if self.fun_by_name.contains_key(&name) {
            return Err(CompileError::semantic(
                loc,
                format!("redefinition of function `{}`", name),
            ));
        }
        let method_id = flags
            .contains(FnFlag::GetMethod)
            .then(|| method_id_for(&name));
        let id = FunId(self.functions.len() as u32);
        self.functions.push(Function {
            name: name.clone(),
            ty,
            flags,
            method_id,
            arg_order: Vec::new(),
            body,
            loc,
            is_really_used: false,
        });
        self.fun_by_name.insert(name, id);
        Ok(id)
    }

    /// Register a builtin; duplicate registration is a compiler bug.
    pub(crate) fn define_builtin(
        &mut self,
        name: &str,
        ty: TypeRef,
        flags: EnumSet<FnFlag>,
        compile: BuiltinCompile,
    ) -> FunId {
        self.define_function(
            name,
            ty,
            flags | FnFlag::BuiltinFunction,
            FunctionBody::Compiled(compile),
            SrcLocation::default(),
        )
        .expect("duplicate builtin registration")
    }

    pub fn define_global(
        &mut self,
        name: impl Into<String>,
        ty: TypeRef,
    ) -> GlobId {
        let id = GlobId(self.globals.len() as u32);
        self.globals.push(GlobalVar {
            name: name.into(),
            ty,
            is_really_used: false,
        });
        id
    }

    /// Does this function get a PROC in the output?
    fn does_need_codegen(&self, f: &Function) -> bool {
        match &f.body {
            FunctionBody::Code(_) => {
                if !self.config.pragmas.remove_unused_functions.enabled() {
                    return true;
                }
                f.is_really_used || f.is_get_method() || f.method_id.is_some()
            }
            _ => false,
        }
    }

    /// DFS over call edges from the entry points, setting
    /// `is_really_used` on everything reachable.
    fn mark_really_used(&mut self) {
        let mut stack: Vec<FunId> = Vec::new();
        for (i, f) in self.functions.iter().enumerate() {
            let is_root = f.is_get_method()
                || f.method_id.is_some()
                || matches!(f.name.as_str(), "main" | "onInternalMessage" | "onExternalMessage");
            if is_root {
                stack.push(FunId(i as u32));
            }
        }
        while let Some(id) = stack.pop() {
            if self.functions[id.0 as usize].is_really_used {
                continue;
            }
            self.functions[id.0 as usize].is_really_used = true;
            let mut callees = Vec::new();
            if let FunctionBody::Code(blob) = &self.functions[id.0 as usize].body {
                collect_callees(&blob.ops, &mut callees);
            }
            stack.extend(callees);
        }
    }

    /// Run the pipeline over every function and write the assembly
    /// listing for the whole program.
    pub fn compile_to(&mut self, out: &mut dyn Write) -> Result<(), CompileError> {
        if self.config.pragmas.remove_unused_functions.enabled() {
            self.mark_really_used();
        }

        writeln!(out, "\"Asm.fif\" include")?;
        if !self.config.generated_from.is_empty() {
            writeln!(out, "// automatically generated from {}", self.config.generated_from)?;
        }
        writeln!(out, "PROGRAM{{")?;

        // fully inlined functions leave no PROC of their own
        let order: Vec<usize> = (0..self.functions.len())
            .filter(|&i| {
                let f = &self.functions[i];
                self.does_need_codegen(f) && !f.is_inline()
            })
            .collect();

        for &i in &order {
            let f = &self.functions[i];
            match f.method_id {
                Some(id) => writeln!(out, "  {} DECLMETHOD {}", id, f.name)?,
                None => writeln!(out, "  DECLPROC {}", f.name)?,
            }
        }

        // inline and inline_ref bodies are compiled up front so call
        // sites can splice or reference them
        let mut inline_bodies: HashMap<FunId, Vec<AsmOp>> = HashMap::new();
        let inline_ids: Vec<FunId> = (0..self.functions.len())
            .map(|i| FunId(i as u32))
            .filter(|&id| {
                let f = self.fun(id);
                matches!(f.body, FunctionBody::Code(_)) && (f.is_inline() || f.is_inline_ref())
            })
            .collect();
        for id in inline_ids {
            let ops = self.compile_one(id, &inline_bodies, true)?;
            inline_bodies.insert(id, ops.list);
        }

        for &i in &order {
            let id = FunId(i as u32);
            let f = self.fun(id);
            tracing::info!(name = %f.name, "generating code");
            let keyword = if f.is_inline_ref() { "PROCREF" } else { "PROC" };
            writeln!(out, "  {} {}:<{{", self.fun(id).name, keyword)?;
            let ops = match inline_bodies.get(&id) {
                Some(cached) => AsmOpList::with_ops(cached.clone()),
                None => self.compile_one(id, &inline_bodies, false)?,
            };
            ops.out(out, 2)?;
            writeln!(out, "  }}>")?;
        }
        writeln!(out, "}}END>c")?;
        Ok(())
    }

    /// Pipeline for a single code function: analyses, stack codegen,
    /// peephole. Returns the optimized instruction list.
    fn compile_one(
        &mut self,
        id: FunId,
        inline_bodies: &HashMap<FunId, Vec<AsmOp>>,
        as_inline: bool,
    ) -> Result<AsmOpList, CompileError> {
        let placeholder = CodeBlob::new("", SrcLocation::default(), self.fun(id).ty);
        let FunctionBody::Code(blob_ref) = &mut self.fun_mut(id).body else {
            return Err(CompileError::internal("compile_one on a non-code function"));
        };
        let mut blob = std::mem::replace(blob_ref, placeholder);

        crate::analysis::analyze(&mut blob, self)?;
        if self.config.verbosity >= 2 {
            tracing::debug!("{}", blob.show());
        }
        let result = compile_blob(&blob, self, inline_bodies, as_inline);

        // put the body back whatever happened
        if let FunctionBody::Code(slot) = &mut self.fun_mut(id).body {
            *slot = blob;
        }
        result
    }
}

fn collect_callees(ops: &[Op], out: &mut Vec<FunId>) {
    for op in ops {
        if let OpKind::Call(id) = op.kind {
            out.push(id);
        }
        for block in op.blocks() {
            collect_callees(block, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_xmodem_vector() {
        // standard check value for "123456789"
        assert_eq!(crc16(b"123456789"), 0x31c3);
    }

    #[test]
    fn test_method_id_is_32_bit_with_marker() {
        let id = method_id_for("seqno");
        assert!(id > 0x10000 && id <= 0x1ffff);
        assert_eq!(id, method_id_for("seqno"));
    }

    #[test]
    fn test_duplicate_function_rejected() {
        let mut ctx = CompilerContext::new(CompilerConfig::default());
        let int = ctx.types.new_atomic(crate::types::Atomic::Int);
        let ty = ctx.types.new_map(int, int);
        let blob = CodeBlob::new("f", SrcLocation::default(), int);
        ctx.define_function(
            "f",
            ty,
            EnumSet::empty(),
            FunctionBody::Code(blob),
            SrcLocation::default(),
        )
        .unwrap();
        let blob2 = CodeBlob::new("f", SrcLocation::default(), int);
        let err = ctx
            .define_function(
                "f",
                ty,
                EnumSet::empty(),
                FunctionBody::Code(blob2),
                SrcLocation::default(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("redefinition"));
    }

    #[test]
    fn test_builtins_are_registered() {
        let ctx = CompilerContext::new(CompilerConfig::default());
        assert!(ctx.lookup_function("_+_").is_some());
        assert!(ctx.lookup_function("throw").is_some());
    }
}
