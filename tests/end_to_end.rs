//! The six end-to-end scenarios: source compiled and run through the
//! real VM, observed through a host-registered `capture` function that
//! appends every argument it receives to a thread-local log.

use semi::bytecode::OpCode;
use semi::error::SemiResult;
use semi::value::object::{NativeFnObj, ObjHeader, ObjKind};
use semi::value::Value;
use semi::{Vm, VmConfig};
use std::cell::RefCell;

thread_local! {
    static CAPTURED: RefCell<Vec<Value>> = RefCell::new(Vec::new());
}

fn capture_native(_vm: &mut Vm, args: &[Value]) -> SemiResult<Value> {
    CAPTURED.with(|c| c.borrow_mut().push(args[0]));
    Ok(Value::unit())
}

fn vm_with_capture() -> Vm {
    CAPTURED.with(|c| c.borrow_mut().clear());
    let mut vm = Vm::new(VmConfig::default());
    let name = vm.symbols.intern("capture");
    let native = vm.gc.alloc(NativeFnObj {
        header: ObjHeader::new(ObjKind::NativeFn),
        name,
        arity: Some(1),
        func: capture_native,
    });
    vm.add_global_variable("capture", Value::NativeFn(native)).unwrap();
    vm
}

fn run(source: &str) -> Vec<Value> {
    let mut vm = vm_with_capture();
    let module = vm.compile_module(source.as_bytes(), "main").expect("compiles");
    let id = vm.register_module(module);
    vm.run_module(id).expect("runs");
    CAPTURED.with(|c| c.borrow().clone())
}

#[test]
fn scenario_1_constant_folding_then_capture() {
    let mut vm = vm_with_capture();
    let module = vm.compile_module(b"a := 1 + 2 * 3; capture(a)", "main").expect("compiles");
    let chunk = unsafe { &(*module.init).chunk };
    assert_eq!(chunk.code[0].opcode(), OpCode::LoadInlineInteger);
    let id = vm.register_module(module);
    vm.run_module(id).expect("runs");
    let captured = CAPTURED.with(|c| c.borrow().clone());
    assert_eq!(captured, vec![Value::Int(7)]);
}

#[test]
fn scenario_2_function_call_result() {
    let captured = run("fn add(a, b) { return a + b }; capture(add(4, 5))");
    assert_eq!(captured, vec![Value::Int(9)]);
}

#[test]
fn scenario_3_iterable_for_loop_accumulation() {
    let captured = run("n := 0; for i in 1..4 { n = n + i }; capture(n)");
    assert_eq!(captured, vec![Value::Int(6)]);
}

#[test]
fn scenario_4_upvalue_capture_and_close_on_outer_return() {
    let captured = run(
        "fn mk() { x := 10; fn inc() { x = x + 1; return x }; return inc }; \
         f := mk(); capture(f()); capture(f())",
    );
    assert_eq!(captured, vec![Value::Int(11), Value::Int(12)]);
}

#[test]
fn scenario_5_defer_runs_after_body() {
    let captured = run(r#"fn log() { defer { capture("b") }; capture("a") }; log()"#);
    assert_eq!(captured.len(), 2);
    assert_eq!(captured[0].as_str_lossy(), "a");
    assert_eq!(captured[1].as_str_lossy(), "b");
}

#[test]
fn scenario_6_constant_condition_elides_dead_branch() {
    let mut vm = vm_with_capture();
    let module = vm
        .compile_module(b"if true { capture(1) } else { capture(2) }", "main")
        .expect("compiles");
    let chunk = unsafe { &(*module.init).chunk };
    // the `else` body (`capture(2)`) is parsed but its emitted code is
    // rewound, so no instruction in the chunk ever loads the constant 2
    let loads_two = chunk.code.iter().any(|instr| {
        instr.opcode() == OpCode::LoadInlineInteger && instr.k_operand() == 2 && !instr.s_flag()
    });
    assert!(!loads_two, "dead `else` branch must not be emitted");
    let id = vm.register_module(module);
    vm.run_module(id).expect("runs");
    let captured = CAPTURED.with(|c| c.borrow().clone());
    assert_eq!(captured, vec![Value::Int(1)]);
}
