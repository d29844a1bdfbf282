//! Top-level interpretation failure (§7).
//!
//! Mirrors clox's `InterpretResult` enum, but as a proper `Result` error
//! type in the idiom of `rlox-compiler::CompileError`: the variant alone
//! tells the CLI which exit code to use (§6). The diagnostic text has
//! already gone to stderr by the time either variant is returned, but
//! `RuntimeError` also carries the message and per-frame trace lines so a
//! caller other than a terminal can inspect the failure directly.

use rlox_compiler::CompileError;

/// A runtime failure: the top-level message (`"Operands must be numbers."`,
/// `"Undefined variable 'x'."`, ...) plus the `"[line N] in f()"` stack
/// trace built by `Vm::runtime_error`, innermost frame first.
#[derive(Debug)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<String>,
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.message)?;
        for line in &self.trace {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

#[derive(Debug)]
pub enum InterpretError {
    Compile(CompileError),
    Runtime(RuntimeError),
}

impl std::fmt::Display for InterpretError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterpretError::Compile(e) => write!(f, "{e}"),
            InterpretError::Runtime(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for InterpretError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InterpretError::Compile(e) => Some(e),
            InterpretError::Runtime(e) => Some(e),
        }
    }
}

impl From<CompileError> for InterpretError {
    fn from(e: CompileError) -> Self {
        InterpretError::Compile(e)
    }
}
