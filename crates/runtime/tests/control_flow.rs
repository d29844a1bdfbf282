//! Arithmetic, string handling, and control flow end to end (§8).

use rlox_vm::{Config, InterpretError, Vm};

fn run(source: &str) -> Result<(), InterpretError> {
    Vm::new(Config::default()).interpret(source)
}

#[test]
fn arithmetic_precedence_and_grouping() {
    let source = r#"
        if (1 + 2 * 3 != 7) { "fail: precedence"(); }
        if ((1 + 2) * 3 != 9) { "fail: grouping"(); }
        if (-2 * -3 != 6) { "fail: unary"(); }
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn string_concatenation_interns_the_result() {
    let source = r#"
        var a = "foo" + "bar";
        var b = "foobar";
        if (a != b) { "fail: not equal"(); }
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn for_loop_accumulates_like_a_while_loop() {
    let source = r#"
        var total = 0;
        for (var i = 1; i <= 5; i = i + 1) {
            total = total + i;
        }
        if (total != 15) { "fail"(); }
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn and_or_short_circuit() {
    let source = r#"
        var calls = 0;
        fun bump() { calls = calls + 1; return true; }
        false and bump();
        true or bump();
        if (calls != 0) { "fail: short circuit failed"(); }
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn division_by_zero_is_ieee_infinity_not_a_runtime_error() {
    let source = r#"
        var x = 1 / 0;
        if (x != x + 1) { "fail: not infinite"(); }
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn adding_a_number_to_a_string_is_a_runtime_error() {
    assert!(matches!(run("\"x\" + 1;"), Err(InterpretError::Runtime(_))));
}

#[test]
fn top_level_return_is_a_compile_error() {
    assert!(matches!(run("return 1;"), Err(InterpretError::Compile(_))));
}

#[test]
fn undefined_global_read_is_a_runtime_error() {
    assert!(matches!(run("print missing;"), Err(InterpretError::Runtime(_))));
}

/// §8 invariant: after `interpret()` returns, the stack is empty and the
/// frame stack holds no call frames, whether it returned because the script
/// ran to completion or because a runtime error unwound it. A `Vm` that
/// failed to clear `frames`/`stack`/`open_upvalues` on the error path would
/// leave garbage behind that corrupts the next script run on the same `Vm`
/// (the REPL keeps one `Vm` alive across every line typed, so this matters
/// beyond the test itself).
#[test]
fn vm_state_is_fully_reset_after_a_runtime_error_and_reusable() {
    let mut vm = Vm::new(Config::default());

    let failed = vm.interpret("var x = 1; x();");
    assert!(matches!(failed, Err(InterpretError::Runtime(_))));

    let ok = vm.interpret("if (1 + 1 != 2) { \"fail\"(); }");
    assert!(ok.is_ok());
}
