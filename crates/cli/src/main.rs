//! rlox - a bytecode-compiled interpreter for a small dynamically-typed,
//! class-based scripting language.
//!
//! Usage:
//!   rlox                 # start an interactive REPL
//!   rlox script.lox      # run a script file
//!
//! Exit codes (§6):
//!   0  success
//!   64 usage error (wrong number of CLI arguments)
//!   65 compile-time error (scan/parse failure)
//!   70 runtime error
//!   74 I/O error (script file could not be read)

use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use rlox_vm::{Config, InterpretError, Vm};
use std::path::PathBuf;
use std::process::ExitCode;

const EXIT_USAGE: u8 = 64;
const EXIT_COMPILE_ERROR: u8 = 65;
const EXIT_RUNTIME_ERROR: u8 = 70;
const EXIT_IO_ERROR: u8 = 74;

#[derive(Parser)]
#[command(name = "rlox")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "A bytecode interpreter for the lox language", long_about = None)]
struct Args {
    /// Script to run; omit to start the REPL. At most one may be given.
    scripts: Vec<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.scripts.as_slice() {
        [] => run_repl(),
        [script] => run_file(script),
        _ => {
            eprintln!("Usage: rlox [path]");
            ExitCode::from(EXIT_USAGE)
        }
    }
}

fn run_file(path: &std::path::Path) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Could not read file \"{}\": {e}", path.display());
            return ExitCode::from(EXIT_IO_ERROR);
        }
    };

    let mut vm = Vm::new(Config::default());
    match vm.interpret(&source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(InterpretError::Compile(_)) => ExitCode::from(EXIT_COMPILE_ERROR),
        Err(InterpretError::Runtime(_)) => ExitCode::from(EXIT_RUNTIME_ERROR),
    }
}

/// REPL state persists the VM across lines (globals, classes, the heap)
/// but a compile error on one line never poisons the next (§6 "REPL").
fn run_repl() -> ExitCode {
    let mut vm = Vm::new(Config::default());
    let mut editor = match DefaultEditor::new() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("Failed to start line editor: {e}");
            return ExitCode::from(EXIT_IO_ERROR);
        }
    };

    let history_path = history_file_path();
    if let Some(path) = &history_path {
        let _ = editor.load_history(path);
    }

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line.as_str());
                // Errors are reported to stderr by `Vm::interpret` itself;
                // the REPL just keeps going either way.
                let _ = vm.interpret(&line);
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Readline error: {e}");
                break;
            }
        }
    }

    if let Some(path) = &history_path {
        let _ = editor.save_history(path);
    }

    ExitCode::SUCCESS
}

fn history_file_path() -> Option<PathBuf> {
    home::home_dir().map(|mut p| {
        p.push(".rlox_history");
        p
    })
}
