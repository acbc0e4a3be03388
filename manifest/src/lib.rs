// Manifest library crate
// Source text -> tokens -> AST -> IR -> runtime engine.
pub mod ast;
pub mod config;
pub mod diagnostics;
pub mod ir;
pub mod lexer;
pub mod parser;
pub mod runtime;

// Re-export the pipeline entry points so callers rarely need the submodules.
pub use config::{ConfigError, ManifestConfig};
pub use diagnostics::{Diagnostic, Severity};
pub use ir::{compile_to_ir, CompileOptions, CompileOutput, Ir, IrCompiler};
pub use lexer::{tokenize, tokenize_with, Token, TokenKind, UnknownCharPolicy};
pub use parser::{parse, parse_expression, parse_with, parse_with_depth, ParseOutput};
pub use runtime::{
    CommandOptions, CommandResult, ComputedCycleMode, Instance, RuntimeContext, RuntimeEngine,
    RuntimeError, RuntimeOptions, RuntimeResult, WriteOutcome,
};
