//! Control flow, calls, closures, defer, and indexing, driven
//! end-to-end through the compiler and VM.

use semi::value::object::{ListObj, ObjHeader, ObjKind};
use semi::value::Value;
use semi::{Vm, VmConfig};
use std::cell::RefCell;

fn eval(source: &str) -> Value {
    let mut vm = Vm::new(VmConfig::default());
    let module = vm.compile_module(source.as_bytes(), "main").expect("compiles");
    let id = vm.register_module(module);
    vm.run_module(id).expect("runs");
    vm.returned_value
}

#[test]
fn ternary_picks_the_matching_branch() {
    assert_eq!(eval("true ? 1 : 2"), Value::Int(1));
    assert_eq!(eval("false ? 1 : 2"), Value::Int(2));
}

#[test]
fn if_elif_else_chain() {
    assert_eq!(eval("n := 2; if n == 1 { 10 } elif n == 2 { 20 } else { 30 }"), Value::Int(20));
    assert_eq!(eval("n := 9; if n == 1 { 10 } elif n == 2 { 20 } else { 30 }"), Value::Int(30));
}

#[test]
fn infinite_loop_with_break() {
    assert_eq!(eval("n := 0; for { n = n + 1; if n == 5 { break } }; n"), Value::Int(5));
}

#[test]
fn iterable_for_loop_sums_a_range() {
    assert_eq!(eval("n := 0; for i in 1..4 { n = n + i }; n"), Value::Int(6));
}

#[test]
fn iterable_for_loop_with_index() {
    assert_eq!(eval("last := 0; for idx, v in 10..13 { last = idx }; last"), Value::Int(2));
}

#[test]
fn range_with_step() {
    assert_eq!(eval("n := 0; for i in 0..10 step 2 { n = n + 1 }; n"), Value::Int(5));
}

#[test]
fn continue_skips_the_rest_of_the_body() {
    assert_eq!(eval("n := 0; for i in 0..5 { if i == 2 { continue }; n = n + 1 }; n"), Value::Int(4));
}

#[test]
fn function_calls_and_recursion() {
    assert_eq!(eval("fn add(a, b) { return a + b }; add(4, 5)"), Value::Int(9));
    assert_eq!(
        eval("fn fact(n) { if n <= 1 { return 1 }; return n * fact(n - 1) }; fact(5)"),
        Value::Int(120)
    );
}

#[test]
fn closures_capture_and_mutate_outer_locals() {
    let result = eval("fn mk() { x := 10; fn inc() { x = x + 1; return x }; return inc }; f := mk(); f(); f()");
    assert_eq!(result, Value::Int(12));
}

#[test]
fn defer_runs_after_the_body_and_in_lifo_order() {
    // Two defers write distinct slots of a host-provided list; the
    // final value in slot 0 reveals which one ran last. `defer` bodies
    // run after the enclosing function's own body, and later-registered
    // defers run before earlier ones.
    let mut vm = Vm::new(VmConfig::default());
    let list = vm.gc.alloc(ListObj {
        header: ObjHeader::new(ObjKind::List),
        items: RefCell::new(vec![Value::Int(-1), Value::Int(-1)]),
    });
    vm.add_global_variable("log", Value::List(list)).unwrap();
    let module = vm
        .compile_module(
            b"fn run() { defer { log[0] = 1 }; defer { log[0] = 2 }; log[1] = 0 }; run()",
            "main",
        )
        .expect("compiles");
    let id = vm.register_module(module);
    vm.run_module(id).expect("runs");
    let items = unsafe { (*list).items.borrow() };
    assert_eq!(items[1], Value::Int(0));
    assert_eq!(items[0], Value::Int(1));
}

#[test]
fn indexing_a_host_provided_list() {
    let mut vm = Vm::new(VmConfig::default());
    let list = vm.gc.alloc(ListObj {
        header: ObjHeader::new(ObjKind::List),
        items: RefCell::new(vec![Value::Int(10), Value::Int(20), Value::Int(30)]),
    });
    vm.add_global_variable("items", Value::List(list)).unwrap();
    let module = vm.compile_module(b"items[1]", "main").expect("compiles");
    let id = vm.register_module(module);
    vm.run_module(id).expect("runs");
    assert_eq!(vm.returned_value, Value::Int(20));
}

#[test]
fn negative_index_wraps_from_the_end() {
    let mut vm = Vm::new(VmConfig::default());
    let list = vm.gc.alloc(ListObj {
        header: ObjHeader::new(ObjKind::List),
        items: RefCell::new(vec![Value::Int(10), Value::Int(20), Value::Int(30)]),
    });
    vm.add_global_variable("items", Value::List(list)).unwrap();
    let module = vm.compile_module(b"items[-1]", "main").expect("compiles");
    let id = vm.register_module(module);
    vm.run_module(id).expect("runs");
    assert_eq!(vm.returned_value, Value::Int(30));
}

#[test]
fn out_of_range_index_is_a_runtime_error() {
    let mut vm = Vm::new(VmConfig::default());
    let list = vm.gc.alloc(ListObj {
        header: ObjHeader::new(ObjKind::List),
        items: RefCell::new(vec![Value::Int(10)]),
    });
    vm.add_global_variable("items", Value::List(list)).unwrap();
    let module = vm.compile_module(b"items[5]", "main").expect("compiles");
    let id = vm.register_module(module);
    let err = vm.run_module(id).unwrap_err();
    assert_eq!(err.kind, semi::ErrorKind::IndexOutOfRange);
}
