//! CLI interface end-to-end tests (§6): running a script file, exit codes
//! for compile/runtime/usage/IO failures, help and version output.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn rlox() -> Command {
    Command::cargo_bin("rlox").expect("the rlox binary builds")
}

fn script(dir: &TempDir, name: &str, source: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, source).expect("failed to write fixture script");
    path
}

#[test]
fn help_output_mentions_the_binary_name() {
    rlox()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("rlox"));
}

#[test]
fn version_output_matches_the_crate_version() {
    rlox()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn running_a_script_prints_its_output() {
    let dir = TempDir::new().unwrap();
    let path = script(&dir, "hello.lox", "print \"hello\" + \", \" + \"world\";");

    rlox()
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("hello, world"));
}

#[test]
fn compile_error_exits_65_and_leaves_stdout_empty() {
    let dir = TempDir::new().unwrap();
    let path = script(&dir, "bad.lox", "var = ;");

    rlox()
        .arg(&path)
        .assert()
        .code(65)
        .stdout(predicate::str::is_empty());
}

#[test]
fn runtime_error_exits_70() {
    let dir = TempDir::new().unwrap();
    let path = script(&dir, "boom.lox", "1 + \"x\";");

    rlox().arg(&path).assert().code(70);
}

#[test]
fn missing_script_file_exits_74() {
    rlox().arg("/nonexistent/does-not-exist.lox").assert().code(74);
}

#[test]
fn more_than_one_script_argument_exits_64() {
    let dir = TempDir::new().unwrap();
    let a = script(&dir, "a.lox", "print 1;");
    let b = script(&dir, "b.lox", "print 2;");

    rlox().arg(&a).arg(&b).assert().code(64);
}
