//! Arithmetic opcodes driven end-to-end through the compiler and VM,
//! using the module's last expression as the observable result.

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
fn integer_add_and_subtract_stay_integers() {
    assert_eq!(eval("5 + 3"), Value::Int(8));
    assert_eq!(eval("5 - 3"), Value::Int(2));
    assert_eq!(eval("-5 + -3"), Value::Int(-8));
}

#[test]
fn mixed_int_float_promotes_to_float() {
    assert_eq!(eval("5 + 3.5"), Value::Float(8.5));
}

#[test]
fn division_always_produces_a_float() {
    assert_eq!(eval("6 / 3"), Value::Float(2.0));
    assert_eq!(eval("7 / 2"), Value::Float(3.5));
}

#[test]
fn floor_division_and_modulo_use_euclidean_semantics() {
    assert_eq!(eval("7 // 2"), Value::Int(3));
    assert_eq!(eval("-7 // 2"), Value::Int(-4));
    assert_eq!(eval("-7 % 2"), Value::Int(1));
}

#[test]
fn power_stays_integer_for_non_negative_exponents() {
    assert_eq!(eval("2 ** 10"), Value::Int(1024));
    assert_eq!(eval("2 ** -1"), Value::Float(0.5));
}

#[test]
fn bitwise_operators_require_integers() {
    assert_eq!(eval("6 & 3"), Value::Int(2));
    assert_eq!(eval("6 | 1"), Value::Int(7));
    assert_eq!(eval("5 ^ 1"), Value::Int(4));
    assert_eq!(eval("1 << 4"), Value::Int(16));
    assert_eq!(eval("256 >> 4"), Value::Int(16));
}

#[test]
fn division_by_zero_is_a_runtime_error() {
    let mut vm = Vm::new(VmConfig::default());
    let module = vm.compile_module(b"1 / 0", "main").expect("compiles");
    let id = vm.register_module(module);
    let err = vm.run_module(id).unwrap_err();
    assert_eq!(err.kind, semi::ErrorKind::DivideByZero);
}

#[test]
fn constant_folding_collapses_arithmetic_at_compile_time() {
    let mut vm = Vm::new(VmConfig::default());
    let module = vm.compile_module(b"1 + 2 * 3", "main").expect("compiles");
    let chunk = unsafe { &(*module.init).chunk };
    // folded to a single inline-integer load feeding `RETURN`
    assert_eq!(chunk.code.len(), 2);
}
