//! Comparison and boolean-logic opcodes driven end-to-end through the
//! compiler and VM.

use semi::value::Value;
use semi::{Vm, VmConfig};

fn eval(source: &str) -> Value {
    let mut vm = Vm::new(VmConfig::default());
    let module = vm.compile_module(source.as_bytes(), "main").expect("compiles");
    let id = vm.register_module(module);
    vm.run_module(id).expect("runs");
    vm.returned_value
}

#[test]
fn ordering_comparisons_on_numbers() {
    assert_eq!(eval("2 > 1"), Value::Bool(true));
    assert_eq!(eval("1 > 2"), Value::Bool(false));
    assert_eq!(eval("2 >= 2"), Value::Bool(true));
    assert_eq!(eval("1 < 2"), Value::Bool(true));
    assert_eq!(eval("2 <= 1"), Value::Bool(false));
}

#[test]
fn equality_on_numbers_crosses_int_and_float() {
    assert_eq!(eval("2 == 2"), Value::Bool(true));
    assert_eq!(eval("2 == 2.0"), Value::Bool(true));
    assert_eq!(eval("2 != 3"), Value::Bool(true));
}

#[test]
fn string_comparisons_use_lexicographic_ordering() {
    assert_eq!(eval(r#""abc" < "abd""#), Value::Bool(true));
    assert_eq!(eval(r#""abc" == "abc""#), Value::Bool(true));
}

#[test]
fn and_or_short_circuit() {
    assert_eq!(eval("true and false"), Value::Bool(false));
    assert_eq!(eval("false or true"), Value::Bool(true));
    // the right-hand side of a short-circuited `or` must not run:
    // dividing by zero would otherwise surface as a runtime error.
    assert_eq!(eval("true or (1 / 0 > 0)"), Value::Bool(true));
}

#[test]
fn not_negates_truthiness() {
    assert_eq!(eval("!true"), Value::Bool(false));
    assert_eq!(eval("!false"), Value::Bool(true));
}

#[test]
fn in_tests_membership() {
    assert_eq!(eval(r#""b" in "abc""#), Value::Bool(true));
    assert_eq!(eval(r#""z" in "abc""#), Value::Bool(false));
}
