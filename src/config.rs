//! Compiler configuration
//!
//! All knobs the host (CLI or embedder) can turn are collected here and
//! handed to [`crate::CompilerContext`]; the pipeline itself never
//! reads process state. File access goes through an injectable read
//! callback so embedders can virtualize includes.

use std::fs;
use std::path::Path;

/// How hard the peephole optimizer works.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimizationLevel {
    /// No peephole rewriting at all.
    O0,
    /// Stack-op canonicalization only (no constant-aware rewrites).
    O1,
    /// Everything.
    #[default]
    O2,
}

/// A named boolean pragma, optionally deprecated since some version.
#[derive(Debug, Clone)]
pub struct GlobalPragma {
    name: &'static str,
    enabled: bool,
    deprecated_from: Option<&'static str>,
}

impl GlobalPragma {
    const fn new(name: &'static str, deprecated_from: Option<&'static str>) -> Self {
        GlobalPragma {
            name,
            enabled: false,
            deprecated_from,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Enable for the current compilation unit.
    pub fn enable(&mut self) {
        if let Some(since) = self.deprecated_from {
            tracing::warn!(
                "pragma `{}` is deprecated since v{} and always on",
                self.name,
                since
            );
        }
        self.enabled = true;
    }
}

/// The three recognized pragmas, scoped to one compilation unit.
#[derive(Debug, Clone)]
pub struct Pragmas {
    pub allow_post_modification: GlobalPragma,
    pub compute_asm_ltr: GlobalPragma,
    pub remove_unused_functions: GlobalPragma,
}

impl Default for Pragmas {
    fn default() -> Self {
        Pragmas {
            allow_post_modification: GlobalPragma::new("allow-post-modification", Some("0.5.0")),
            compute_asm_ltr: GlobalPragma::new("compute-asm-ltr", Some("0.5.0")),
            remove_unused_functions: GlobalPragma::new("remove-unused-functions", None),
        }
    }
}

/// What the host is being asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCallbackKind {
    /// Resolve a path to its canonical form.
    Realpath,
    /// Return the contents of a source file.
    ReadFile,
}

/// File reading or generic query callback injected by the host.
pub type ReadCallback = fn(ReadCallbackKind, &str) -> Result<String, String>;

/// Default callback backed by the local filesystem.
pub fn fs_read_callback(kind: ReadCallbackKind, query: &str) -> Result<String, String> {
    match kind {
        ReadCallbackKind::Realpath => Path::new(query)
            .canonicalize()
            .map(|p| p.to_string_lossy().into_owned())
            .map_err(|e| format!("cannot resolve `{}`: {}", query, e)),
        ReadCallbackKind::ReadFile => {
            fs::read_to_string(query).map_err(|e| format!("cannot read `{}`: {}", query, e))
        }
    }
}

/// Configuration for one compiler run.
#[derive(Clone)]
pub struct CompilerConfig {
    /// 0 = quiet, 1 = per-function progress, 2 = IR dumps.
    pub verbosity: i32,
    pub opt_level: OptimizationLevel,
    /// Interleave `// stack: ...` comments with the output.
    pub stack_layout_comments: bool,
    /// Name of the source the output was generated from, for the banner.
    pub generated_from: String,
    pub pragmas: Pragmas,
    pub read_callback: ReadCallback,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            verbosity: 0,
            opt_level: OptimizationLevel::default(),
            stack_layout_comments: false,
            generated_from: String::new(),
            pragmas: Pragmas::default(),
            read_callback: fs_read_callback,
        }
    }
}

impl CompilerConfig {
    pub fn new() -> Self {
        CompilerConfig::default()
    }

    pub fn with_verbosity(mut self, v: i32) -> Self {
        self.verbosity = v;
        self
    }

    pub fn with_opt_level(mut self, level: OptimizationLevel) -> Self {
        self.opt_level = level;
        self
    }

    pub fn with_stack_comments(mut self, on: bool) -> Self {
        self.stack_layout_comments = on;
        self
    }

    pub fn with_generated_from(mut self, src: impl Into<String>) -> Self {
        self.generated_from = src.into();
        self
    }

    pub fn with_read_callback(mut self, cb: ReadCallback) -> Self {
        self.read_callback = cb;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pragma_enable() {
        let mut p = Pragmas::default();
        assert!(!p.remove_unused_functions.enabled());
        p.remove_unused_functions.enable();
        assert!(p.remove_unused_functions.enabled());
    }

    #[test]
    fn test_config_builder() {
        let cfg = CompilerConfig::new()
            .with_opt_level(OptimizationLevel::O1)
            .with_stack_comments(true)
            .with_generated_from("demo.tolk");
        assert_eq!(cfg.opt_level, OptimizationLevel::O1);
        assert!(cfg.stack_layout_comments);
        assert_eq!(cfg.generated_from, "demo.tolk");
    }

    #[test]
    fn test_fs_read_callback_missing_file() {
        let err = fs_read_callback(ReadCallbackKind::ReadFile, "/no/such/file.tolk").unwrap_err();
        assert!(err.contains("cannot read"));
    }
}
