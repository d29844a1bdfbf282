//! Compile-time error signal (§7 "Compile-time").
//!
//! Individual diagnostics are reported to stderr as they are discovered —
//! panic-mode recovery means the compiler keeps parsing after the first one
//! to surface as many as it can in a single pass. `CompileError` is the
//! after-the-fact signal that at least one was reported; it also carries the
//! `(line, message)` pairs themselves so a caller other than a terminal (a
//! test, an embedding host) can inspect what went wrong without scraping
//! stderr.

#[derive(Debug)]
pub struct CompileError {
    pub diagnostics: Vec<(u32, String)>,
}

impl CompileError {
    pub fn error_count(&self) -> usize {
        self.diagnostics.len()
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "compilation failed with {} error(s)", self.diagnostics.len())
    }
}

impl std::error::Error for CompileError {}
