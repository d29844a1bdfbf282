//! Closure and upvalue behavior end to end (§8 scenario: "closures capture
//! variables by reference, not by value").

use rlox_vm::{Config, InterpretError, Vm};

fn run(source: &str) -> Result<(), InterpretError> {
    Vm::new(Config::default()).interpret(source)
}

#[test]
fn shared_upvalue_sees_mutations_from_either_closure() {
    let source = r#"
        fun pair() {
            var shared = 0;
            fun set(v) { shared = v; }
            fun get() { return shared; }
            set(41);
            if (get() != 41) { "fail: initial read"(); }
            set(get() + 1);
            if (get() != 42) { "fail: second read"(); }
        }
        pair();
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn each_call_gets_a_fresh_closure_environment() {
    let source = r#"
        fun makeCounter() {
            var i = 0;
            fun count() {
                i = i + 1;
                return i;
            }
            return count;
        }
        var a = makeCounter();
        var b = makeCounter();
        a();
        a();
        if (a() != 3) { "fail: a diverged"(); }
        if (b() != 1) { "fail: b shares a's state"(); }
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn upvalue_survives_after_enclosing_function_returns() {
    let source = r#"
        var saved;
        fun capture() {
            var local = "kept alive";
            fun inner() { return local; }
            saved = inner;
        }
        capture();
        if (saved() != "kept alive") { "fail"(); }
    "#;
    assert!(run(source).is_ok());
}

#[test]
fn deeply_nested_functions_resolve_outer_upvalues() {
    let source = r#"
        fun outer() {
            var x = "outer";
            fun middle() {
                fun inner() {
                    return x;
                }
                return inner();
            }
            return middle();
        }
        if (outer() != "outer") { "fail"(); }
    "#;
    assert!(run(source).is_ok());
}
