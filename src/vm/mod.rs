//! The register-based virtual machine: instruction dispatch, call-frame
//! discipline, upvalue lifecycle, deferred-call chains, and the
//! embedding surface (`add_global_variable`, `compile_module`,
//! `run_module`) that a host driver builds on.

pub mod frame;
pub mod gc;
pub mod magic;
pub mod upvalue;

use tracing::{instrument, trace};

use crate::bytecode::{Instruction, OpCode, RETURN_NO_VALUE};
use crate::common::{IdentifierId, ModuleId};
use crate::config::VmConfig;
use crate::error::{ErrorKind, SemiError, SemiResult};
use crate::module::Module;
use crate::value::dict::Dict;
use crate::value::object::{ClosureObj, FunctionProtoObj, ObjHeader, ObjKind, StringObj, UpvalueDesc, UpvalueState};
use crate::value::symtab::SymbolTable;
use crate::value::Value;

pub use frame::Frame;
pub use gc::Gc;
pub use upvalue::OpenUpvalues;

use magic::{BinOp, UnOp};

/// Host-registered, read-only global bindings. Indices are stable for
/// the lifetime of the VM — `addGlobalVariable` is only ever called
/// during embedding setup, before any module runs.
#[derive(Default)]
pub struct HostGlobals {
    by_id: Dict<IdentifierId, u16>,
    values: Vec<Value>,
}

/// Host globals past this count fail with [`ErrorKind::TooManyGlobalVars`],
/// matching §6's 65,534-entry ceiling (one slot short of `u16::MAX` so
/// the sentinel stays available to whoever serialises this format next).
const MAX_HOST_GLOBALS: usize = 65_534;

impl HostGlobals {
    pub fn new() -> Self {
        HostGlobals::default()
    }

    pub fn register(&mut self, identifier_id: IdentifierId, value: Value) -> SemiResult<u16> {
        if self.values.len() >= MAX_HOST_GLOBALS {
            return Err(ErrorKind::TooManyGlobalVars.into());
        }
        let index = self.values.len() as u16;
        self.values.push(value);
        self.by_id.set(identifier_id, index);
        Ok(index)
    }

    pub fn index_of_id(&self, identifier_id: IdentifierId) -> Option<u16> {
        self.by_id.get(&identifier_id).copied()
    }

    pub fn get(&self, index: u16) -> Option<Value> {
        self.values.get(index as usize).copied()
    }

    fn roots(&self) -> impl Iterator<Item = Value> + '_ {
        self.values.iter().copied()
    }
}

/// A virtual machine instance: the heap, the symbol table, every
/// compiled module, host-registered globals, and (while `run_module`
/// is on the stack) the live register file and frame stack.
pub struct Vm {
    pub config: VmConfig,
    pub gc: Gc,
    pub symbols: SymbolTable,
    pub host_globals: HostGlobals,
    pub modules: Vec<Module>,
    next_module_id: ModuleId,

    value_stack: Vec<Value>,
    frames: Vec<Frame>,
    open_upvalues: OpenUpvalues,

    /// The module-level expression value left behind by the last
    /// `run_module`, mirroring `vm.returnedValue` in §6.
    pub returned_value: Value,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        let gc = Gc::with_allocator(config.gc_initial_threshold, config.gc_growth_factor, config.allocator.clone());
        Vm {
            value_stack: Vec::with_capacity(config.stack_limits.initial_values),
            frames: Vec::with_capacity(config.stack_limits.initial_frames),
            config,
            gc,
            symbols: SymbolTable::new(),
            host_globals: HostGlobals::new(),
            modules: Vec::new(),
            next_module_id: 0,
            open_upvalues: OpenUpvalues::new(),
            returned_value: Value::unit(),
        }
    }

    /// Register a host-visible, read-only global binding, interning its
    /// name. Mirrors `addGlobalVariable` in §6.
    pub fn add_global_variable(&mut self, name: &str, value: Value) -> SemiResult<()> {
        let id = self.symbols.intern(name).id();
        self.host_globals.register(id, value)?;
        Ok(())
    }

    /// Compile `source` into a fresh module. The module is not yet
    /// registered with the VM; the caller hands it to
    /// [`Vm::register_module`] (typically immediately, via
    /// [`Vm::run_module`]'s caller) to give it a stable id and a place
    /// in the GC's root set.
    /// `source` is raw bytes (spec §6 models the embedding boundary this
    /// way) so invalid UTF-8 is reported as an ordinary lexical error
    /// rather than rejected by the type system before it ever reaches
    /// the compiler.
    pub fn compile_module(&mut self, source: &[u8], name: &str) -> SemiResult<Module> {
        let module_id = self.next_module_id;
        crate::compiler::compile_module(self, source, name, module_id)
    }

    /// Assign `module` the next module id and take ownership of it.
    /// Returns the id it was assigned.
    pub fn register_module(&mut self, mut module: Module) -> ModuleId {
        let id = self.next_module_id;
        self.next_module_id += 1;
        module.id = id;
        self.modules.push(module);
        id
    }

    /// Run a previously registered module's `init` function to
    /// completion, leaving its last top-level expression value (if any)
    /// in [`Vm::returned_value`].
    #[instrument(skip(self))]
    pub fn run_module(&mut self, module_id: ModuleId) -> SemiResult<()> {
        let module_index = self
            .modules
            .iter()
            .position(|m| m.id == module_id)
            .ok_or(ErrorKind::ModuleNotFound)?;
        let init = self.modules[module_index].init;
        if init.is_null() {
            return Err(ErrorKind::Internal("module has no init function").into());
        }
        self.value_stack.clear();
        self.frames.clear();
        self.returned_value = Value::unit();

        let closure = self.gc.alloc(ClosureObj {
            header: ObjHeader::new(ObjKind::Closure),
            proto: init,
            upvalues: Box::new([]),
            prev_deferred: std::cell::Cell::new(std::ptr::null_mut()),
        });
        self.push_call_frame(closure, 0, 0, module_id)?;
        self.run()
    }

    // ---- stack management -------------------------------------------------

    /// Grow the value stack by doubling (never shrinking) until it
    /// covers `top`, per §4.4's stack-growth rule.
    fn ensure_stack_capacity(&mut self, top: usize) -> SemiResult<()> {
        if top > self.config.stack_limits.max_values {
            return Err(ErrorKind::StackOverflow.into());
        }
        if top > self.value_stack.len() {
            let mut new_len = self.value_stack.len().max(self.config.stack_limits.initial_values);
            while new_len < top {
                new_len *= 2;
            }
            new_len = new_len.min(self.config.stack_limits.max_values);
            self.value_stack.resize(new_len, Value::unit());
        }
        Ok(())
    }

    fn push_call_frame(&mut self, closure: *mut ClosureObj, stack_base: usize, return_register: u8, module_id: ModuleId) -> SemiResult<()> {
        if self.frames.len() >= self.config.stack_limits.max_frames {
            return Err(ErrorKind::StackOverflow.into());
        }
        let proto = unsafe { (*closure).proto };
        let needed = stack_base + unsafe { (*proto).max_stack_size as usize };
        self.ensure_stack_capacity(needed)?;
        self.frames.push(Frame::new(closure, 0, stack_base, return_register, module_id));
        Ok(())
    }

    fn reg(&self, register: u8) -> Value {
        let frame = self.frames.last().expect("dispatch loop always has a frame");
        self.value_stack[frame.register_index(register)]
    }

    fn set_reg(&mut self, register: u8, value: Value) {
        let frame = self.frames.last().expect("dispatch loop always has a frame");
        let index = frame.register_index(register);
        self.value_stack[index] = value;
    }

    /// Resolve a T-shape `RK(x, kx)` operand: a register, or a biased
    /// inline integer constant reconstructed as [`Value::Int`].
    fn rk(&self, x: u8, kx: bool) -> Value {
        if kx {
            Value::Int(crate::bytecode::decode_rk_int(x))
        } else {
            self.reg(x)
        }
    }

    fn current_module(&mut self, module_id: ModuleId) -> &mut Module {
        self.modules
            .iter_mut()
            .find(|m| m.id == module_id)
            .expect("executing frame always names a live module")
    }

    // ---- garbage collection -------------------------------------------------

    /// Every live value: the active portion of the value stack, every
    /// frame's closure, every module's exports/globals/constant table,
    /// and every host-registered global. Matches §4.5's root set.
    fn roots(&self) -> Vec<Value> {
        // Over-roots slightly: `value_stack` never shrinks back down once
        // grown, so slots above the currently active frame's top may
        // still hold a stale value from a frame that already returned.
        // Keeping them alive one extra cycle is harmless; scanning only
        // the active portion would need per-frame bookkeeping this
        // tracing collector has no other use for.
        let mut roots: Vec<Value> = self.value_stack.clone();
        for frame in &self.frames {
            roots.push(Value::Closure(frame.closure));
        }
        for module in &self.modules {
            roots.extend(module.exports.values().copied());
            roots.extend(module.globals.values().copied());
            for i in 0..module.constants.len() as u16 {
                if let Some(v) = module.constants.get(i) {
                    roots.push(v);
                }
            }
            if !module.init.is_null() {
                roots.push(Value::FunctionProto(module.init));
            }
        }
        roots.extend(self.host_globals.roots());
        roots.push(self.returned_value);
        roots
    }

    fn collect_if_needed(&mut self) {
        if self.gc.should_collect() {
            let roots = self.roots();
            self.gc.collect(roots);
        }
    }

    /// Allocate a heap string and intern short literals inline, rooting
    /// `value` against collection triggered by the allocation itself by
    /// collecting *before* allocating rather than after.
    pub fn alloc_string(&mut self, text: &str) -> Value {
        if let Some(inline) = crate::value::InlineString::try_from_str(text) {
            return Value::InlineString(inline);
        }
        self.collect_if_needed();
        let ptr = self.gc.alloc(StringObj {
            header: ObjHeader::new(ObjKind::Str),
            data: Box::from(text),
        });
        Value::Str(ptr)
    }

    fn concat_strings(&mut self, left: &Value, right: &Value) -> Value {
        let mut combined = String::with_capacity(left.as_str_lossy().len() + right.as_str_lossy().len());
        combined.push_str(left.as_str_lossy());
        combined.push_str(right.as_str_lossy());
        self.alloc_string(&combined)
    }

    // ---- dispatch loop -------------------------------------------------

    fn run(&mut self) -> SemiResult<()> {
        loop {
            let outcome = self.step();
            match outcome {
                Ok(StepOutcome::Continue) => {}
                Ok(StepOutcome::Halted) => return Ok(()),
                Err(e) => {
                    self.frames.clear();
                    return Err(e);
                }
            }
        }
    }

    #[instrument(skip(self))]
    fn step(&mut self) -> SemiResult<StepOutcome> {
        let frame_idx = self.frames.len() - 1;
        let (closure, ip, module_id) = {
            let f = &self.frames[frame_idx];
            (f.closure, f.return_ip, f.module_id)
        };
        let proto = unsafe { (*closure).proto };
        let chunk_len = unsafe { (*proto).chunk.len() };
        if (ip as usize) >= chunk_len {
            return Err(ErrorKind::InvalidProgramCounter.into());
        }
        let instr = unsafe { (*proto).chunk.code[ip as usize] };
        self.frames[frame_idx].return_ip = ip + 1;
        trace!(op = %instr.opcode(), ip, "dispatch");

        match instr.opcode() {
            OpCode::Noop => {}
            OpCode::Jump => self.jump_relative(frame_idx, instr.j_offset()),
            OpCode::CJump => {
                if self.reg(instr.a()).to_bool() == instr.i_flag() {
                    self.cjump_relative(frame_idx, instr);
                }
            }
            OpCode::Trap => return Err(SemiError::new(ErrorKind::Internal("TRAP executed"))),
            OpCode::Return => return self.op_return(instr.a()),
            OpCode::Call => return self.op_call(instr).map(|()| StepOutcome::Continue),

            OpCode::LoadConstant => self.op_load_constant(module_id, instr)?,
            OpCode::LoadBool => {
                let value = instr.k_operand() != 0;
                self.set_reg(instr.a(), Value::Bool(value));
            }
            OpCode::LoadInlineInteger => {
                let magnitude = instr.k_operand() as i64;
                let value = if instr.s_flag() { -magnitude } else { magnitude };
                self.set_reg(instr.a(), Value::Int(value));
            }
            OpCode::LoadInlineString => {
                let k = instr.k_operand();
                let bytes = [(k & 0xFF) as u8, ((k >> 8) & 0xFF) as u8];
                let len = if bytes[0] == 0 && bytes[1] == 0 {
                    0
                } else if bytes[1] == 0 {
                    1
                } else {
                    2
                };
                let inline = crate::value::InlineString { len, bytes };
                self.set_reg(instr.a(), Value::InlineString(inline));
            }
            OpCode::GetModuleVar => {
                let value = self.read_module_var(module_id, instr.k_operand(), instr.s_flag())?;
                self.set_reg(instr.a(), value);
            }
            OpCode::SetModuleVar => {
                let value = self.reg(instr.a());
                self.write_module_var(module_id, instr.k_operand(), instr.s_flag(), value)?;
            }

            OpCode::Move => self.set_reg(instr.a(), self.reg(instr.b())),
            OpCode::GetUpvalue => {
                let up = unsafe { (*closure).upvalues[instr.b() as usize] };
                self.set_reg(instr.a(), self.read_upvalue(up));
            }
            OpCode::SetUpvalue => {
                let up = unsafe { (*closure).upvalues[instr.b() as usize] };
                self.write_upvalue(up, self.reg(instr.a()));
            }
            OpCode::CloseUpvalues => {
                let base = self.frames[frame_idx].stack_base;
                self.open_upvalues.close_from(&self.value_stack, base + instr.a() as usize);
            }
            OpCode::DeferCall => self.op_defer_call(frame_idx, module_id, instr)?,

            OpCode::Add
            | OpCode::Subtract
            | OpCode::Multiply
            | OpCode::Divide
            | OpCode::FloorDivide
            | OpCode::Modulo
            | OpCode::Power
            | OpCode::BitwiseAnd
            | OpCode::BitwiseOr
            | OpCode::BitwiseXor
            | OpCode::BitwiseLShift
            | OpCode::BitwiseRShift
            | OpCode::Gt
            | OpCode::Ge
            | OpCode::Eq
            | OpCode::Neq
            | OpCode::Contain => self.op_binary(instr)?,
            OpCode::Negate => self.op_unary(instr, UnOp::Negate)?,
            OpCode::BitwiseInvert => self.op_unary(instr, UnOp::BitwiseInvert)?,
            OpCode::BoolNot => self.op_unary(instr, UnOp::BoolNot)?,

            OpCode::MakeRange => self.op_make_range(instr)?,
            OpCode::IterNext => return self.op_iter_next(frame_idx, instr),

            OpCode::GetItem => self.op_get_item(instr)?,
            OpCode::SetItem => self.op_set_item(instr)?,

            OpCode::GetAttr | OpCode::SetAttr => {
                return Err(ErrorKind::FieldAccessUnsupported.into());
            }
            OpCode::CheckType => self.op_check_type(instr),

            OpCode::ExtraArg => return Err(ErrorKind::InvalidInstruction.into()),
        }
        Ok(StepOutcome::Continue)
    }

    fn jump_relative(&mut self, frame_idx: usize, offset: i32) {
        let ip = self.frames[frame_idx].return_ip as i64;
        self.frames[frame_idx].return_ip = (ip + offset as i64) as u32;
    }

    fn cjump_relative(&mut self, frame_idx: usize, instr: Instruction) {
        let magnitude = instr.k_operand() as i64;
        let offset = if instr.s_flag() { -magnitude } else { magnitude };
        let ip = self.frames[frame_idx].return_ip as i64;
        self.frames[frame_idx].return_ip = (ip + offset) as u32;
    }

    fn op_load_constant(&mut self, module_id: ModuleId, instr: Instruction) -> SemiResult<()> {
        let index = instr.k_operand();
        let value = if instr.s_flag() {
            self.host_globals.get(index).ok_or(ErrorKind::Internal("host global index out of range"))?
        } else {
            let module = self.current_module(module_id);
            module.constants.get(index).ok_or(ErrorKind::Internal("constant index out of range"))?
        };
        if let Value::FunctionProto(proto) = value {
            let closure = self.make_closure(proto)?;
            self.set_reg(instr.a(), Value::Closure(closure));
        } else {
            self.set_reg(instr.a(), value);
        }
        Ok(())
    }

    /// Build a closure for `proto`, capturing its upvalues off the
    /// currently executing frame per §4.4's capture protocol.
    fn make_closure(&mut self, proto: *mut FunctionProtoObj) -> SemiResult<*mut ClosureObj> {
        let frame = self.frames.last().expect("closures are only built while a frame is executing");
        let base = frame.stack_base;
        let enclosing = frame.closure;
        let descriptors: Vec<UpvalueDesc> = unsafe { (*proto).upvalues.iter().copied().collect() };
        let mut upvalues = Vec::with_capacity(descriptors.len());
        for desc in descriptors {
            let up = if desc.is_local {
                self.open_upvalues.capture(&self.gc, base + desc.index as usize)
            } else {
                unsafe { (*enclosing).upvalues[desc.index as usize] }
            };
            upvalues.push(up);
        }
        self.collect_if_needed();
        Ok(self.gc.alloc(ClosureObj {
            header: ObjHeader::new(ObjKind::Closure),
            proto,
            upvalues: upvalues.into_boxed_slice(),
            prev_deferred: std::cell::Cell::new(std::ptr::null_mut()),
        }))
    }

    fn read_upvalue(&self, up: *mut crate::value::object::UpvalueObj) -> Value {
        match unsafe { (*up).state.get() } {
            UpvalueState::Open(index) => self.value_stack[index],
            UpvalueState::Closed(value) => value,
        }
    }

    fn write_upvalue(&mut self, up: *mut crate::value::object::UpvalueObj, value: Value) {
        match unsafe { (*up).state.get() } {
            UpvalueState::Open(index) => self.value_stack[index] = value,
            UpvalueState::Closed(_) => unsafe { (*up).state.set(UpvalueState::Closed(value)) },
        }
    }

    /// `s = true` selects the exports dict, `s = false` selects globals,
    /// mirroring the RK-style `LOAD_CONSTANT` convention for `GET`/`SET_MODULE_VAR`.
    fn read_module_var(&mut self, module_id: ModuleId, index: u16, exported: bool) -> SemiResult<Value> {
        let module = self.current_module(module_id);
        let dict = if exported { &module.exports } else { &module.globals };
        dict.get_by_index(index).copied().ok_or(ErrorKind::Internal("module variable index out of range").into())
    }

    fn write_module_var(&mut self, module_id: ModuleId, index: u16, exported: bool, value: Value) -> SemiResult<()> {
        let module = self.current_module(module_id);
        let dict = if exported { &mut module.exports } else { &mut module.globals };
        dict.set_by_index(index, value)
            .map(|_| ())
            .ok_or(ErrorKind::Internal("module variable index out of range").into())
    }

    fn op_defer_call(&mut self, frame_idx: usize, module_id: ModuleId, instr: Instruction) -> SemiResult<()> {
        let index = instr.k_operand();
        let module = self.current_module(module_id);
        let proto_value = module
            .constants
            .get(index)
            .ok_or(ErrorKind::Internal("constant index out of range"))?;
        let proto = match proto_value {
            Value::FunctionProto(p) => p,
            _ => return Err(ErrorKind::Internal("DEFER_CALL constant is not a function prototype").into()),
        };
        let closure = self.make_closure(proto)?;
        self.frames[frame_idx].push_deferred(closure);
        Ok(())
    }

    fn op_binary(&mut self, instr: Instruction) -> SemiResult<()> {
        let left = self.rk(instr.b(), instr.kb());
        let right = self.rk(instr.c(), instr.kc());
        let op = binop_for(instr.opcode());
        if magic::is_string_concat(op, &left, &right) {
            let value = self.concat_strings(&left, &right);
            self.set_reg(instr.a(), value);
            return Ok(());
        }
        let value = magic::eval_binary(op, &left, &right)?;
        self.set_reg(instr.a(), value);
        Ok(())
    }

    fn op_unary(&mut self, instr: Instruction, op: UnOp) -> SemiResult<()> {
        let operand = self.reg(instr.b());
        let value = magic::eval_unary(op, &operand)?;
        self.set_reg(instr.a(), value);
        Ok(())
    }

    /// `B` names the base of 2 or 3 consecutive registers holding the
    /// materialised start/end[/step]; `C` is 1 when a step register is
    /// present. Mirrors the `CALL` instruction's contiguous-argument
    /// convention, since a T-shape instruction has no room for a third
    /// independent operand.
    fn op_make_range(&mut self, instr: Instruction) -> SemiResult<()> {
        let base = instr.b();
        let start = self.int_operand(self.reg(base))?;
        let end = self.int_operand(self.reg(base + 1))?;
        let step = if instr.c() != 0 { self.int_operand(self.reg(base + 2))? } else { 1 };
        if let (Ok(s), Ok(e)) = (i32::try_from(start), i32::try_from(end)) {
            if step == 1 {
                self.set_reg(instr.a(), Value::InlineRange(s, e));
                return Ok(());
            }
        }
        self.collect_if_needed();
        let ptr = self.gc.alloc(crate::value::object::RangeObj {
            header: ObjHeader::new(ObjKind::Range),
            start,
            end,
            step,
        });
        self.set_reg(instr.a(), Value::Range(ptr));
        Ok(())
    }

    fn int_operand(&self, value: Value) -> SemiResult<i64> {
        match value {
            Value::Int(i) => Ok(i),
            _ => Err(ErrorKind::UnexpectedType.into()),
        }
    }

    /// `R[A] = index or sentinel, R[B] = next item, R[C] = iterator`; on
    /// success the dispatch loop skips the following `JUMP` to loop body,
    /// mirroring the fallthrough-vs-skip convention §4.2 describes.
    fn op_iter_next(&mut self, frame_idx: usize, instr: Instruction) -> SemiResult<StepOutcome> {
        let iterator = self.reg(instr.c());
        let current_index = match self.reg(instr.a()) {
            Value::Int(i) => i,
            _ => 0,
        };
        if let Some((next_index, item)) = self.advance_iterator(&iterator, current_index)? {
            // Close any upvalue a previous iteration's closures captured
            // over the loop item register (or anything above it) before
            // this iteration overwrites it, so each iteration's closures
            // see their own closed copy instead of sharing one upvalue.
            let base = self.frames[frame_idx].stack_base;
            self.open_upvalues.close_from(&self.value_stack, base + instr.b() as usize);
            self.set_reg(instr.a(), Value::Int(next_index));
            self.set_reg(instr.b(), item);
            self.frames[frame_idx].return_ip += 1;
        }
        Ok(StepOutcome::Continue)
    }

    fn advance_iterator(&self, iterator: &Value, current_index: i64) -> SemiResult<Option<(i64, Value)>> {
        match iterator {
            Value::InlineRange(start, end) => {
                let value = *start as i64 + current_index;
                if value < *end as i64 {
                    Ok(Some((current_index + 1, Value::Int(value))))
                } else {
                    Ok(None)
                }
            }
            Value::Range(p) => {
                let (start, end, step) = unsafe { ((**p).start, (**p).end, (**p).step) };
                let value = start + current_index * step;
                let in_range = if step >= 0 { value < end } else { value > end };
                if in_range {
                    Ok(Some((current_index + 1, Value::Int(value))))
                } else {
                    Ok(None)
                }
            }
            Value::List(p) => {
                let items = unsafe { (**p).items.borrow() };
                if (current_index as usize) < items.len() {
                    Ok(Some((current_index + 1, items[current_index as usize])))
                } else {
                    Ok(None)
                }
            }
            _ => Err(ErrorKind::UnexpectedType.into()),
        }
    }

    fn op_get_item(&mut self, instr: Instruction) -> SemiResult<()> {
        let base = self.reg(instr.b());
        let index = self.rk(instr.c(), instr.kc());
        let value = match base {
            Value::List(p) => {
                let items = unsafe { (*p).items.borrow() };
                let i = self.index_operand(index, items.len())?;
                items[i]
            }
            Value::Dict(p) => {
                let entries = unsafe { (*p).entries.borrow() };
                *entries.get(&index).ok_or(ErrorKind::KeyNotFound)?
            }
            _ if base.is_string() => {
                let s = base.as_str_lossy();
                let i = self.index_operand(index, s.chars().count())?;
                let ch = s.chars().nth(i).expect("bounds already checked");
                self.alloc_string(&ch.to_string())
            }
            _ => return Err(ErrorKind::UnexpectedType.into()),
        };
        self.set_reg(instr.a(), value);
        Ok(())
    }

    fn op_set_item(&mut self, instr: Instruction) -> SemiResult<()> {
        let base = self.reg(instr.a());
        let index = self.rk(instr.b(), instr.kb());
        let value = self.rk(instr.c(), instr.kc());
        match base {
            Value::List(p) => {
                let mut items = unsafe { (*p).items.borrow_mut() };
                let i = self.index_operand(index, items.len())?;
                items[i] = value;
            }
            Value::Dict(p) => {
                let mut entries = unsafe { (*p).entries.borrow_mut() };
                entries.set(index, value);
            }
            _ => return Err(ErrorKind::UnexpectedType.into()),
        }
        Ok(())
    }

    fn index_operand(&self, index: Value, len: usize) -> SemiResult<usize> {
        match index {
            Value::Int(i) => {
                let resolved = if i < 0 { i + len as i64 } else { i };
                if resolved < 0 || resolved as usize >= len {
                    Err(ErrorKind::IndexOutOfRange.into())
                } else {
                    Ok(resolved as usize)
                }
            }
            _ => Err(ErrorKind::UnexpectedType.into()),
        }
    }

    fn op_check_type(&mut self, instr: Instruction) {
        let value = self.reg(instr.b());
        let expected = self.reg(instr.c());
        let matches = value.type_name() == expected.as_str_lossy();
        self.set_reg(instr.a(), Value::Bool(matches));
    }

    fn op_call(&mut self, instr: Instruction) -> SemiResult<()> {
        let callee_reg = instr.a();
        let callee = self.reg(callee_reg);
        let arg_count = instr.b();
        let frame_idx = self.frames.len() - 1;
        let base = self.frames[frame_idx].stack_base + callee_reg as usize + 1;

        match callee {
            Value::NativeFn(native) => {
                let func = unsafe { (*native).func };
                let args: Vec<Value> = (0..arg_count as usize).map(|i| self.value_stack[base + i]).collect();
                let result = func(self, &args)?;
                self.set_reg(callee_reg, result);
                Ok(())
            }
            Value::Closure(closure) => {
                let proto = unsafe { (*closure).proto };
                if unsafe { (*proto).arity } != arg_count {
                    return Err(ErrorKind::ArgumentCountMismatch.into());
                }
                let chunk_ok = unsafe { !(*proto).chunk.is_empty() && (*proto).chunk.ends_with_terminator() };
                if !chunk_ok {
                    return Err(ErrorKind::Internal("callee chunk is empty or unterminated").into());
                }
                let module_id = unsafe { (*proto).module_id };
                self.push_call_frame(closure, base, callee_reg, module_id)?;
                Ok(())
            }
            _ => Err(ErrorKind::UnexpectedType.into()),
        }
    }

    fn op_return(&mut self, a: u8) -> SemiResult<StepOutcome> {
        let frame_idx = self.frames.len() - 1;
        let value = if a == RETURN_NO_VALUE { Value::unit() } else { self.reg(a) };

        if let Some(deferred) = self.take_deferred(frame_idx) {
            self.frames[frame_idx].return_ip -= 1;
            let base = self.frames[frame_idx].stack_base + a as usize + 1;
            let module_id = self.frames[frame_idx].module_id;
            self.push_call_frame(deferred, base, RETURN_NO_VALUE, module_id)?;
            return Ok(StepOutcome::Continue);
        }

        let base = self.frames[frame_idx].stack_base;
        self.open_upvalues.close_from(&self.value_stack, base);

        if self.frames.len() == 1 {
            self.returned_value = value;
            self.frames.pop();
            return Ok(StepOutcome::Halted);
        }

        let return_register = self.frames[frame_idx].return_register;
        let callee_proto = unsafe { (*self.frames[frame_idx].closure).proto };
        self.frames.pop();
        if a != RETURN_NO_VALUE {
            self.set_reg(return_register, value);
        } else if unsafe { (*callee_proto).coarity } != 0 {
            return Err(ErrorKind::MissingReturnValue.into());
        }
        Ok(StepOutcome::Continue)
    }

    fn take_deferred(&mut self, frame_idx: usize) -> Option<*mut ClosureObj> {
        let deferred = self.frames[frame_idx].pop_deferred();
        if deferred.is_null() {
            None
        } else {
            Some(deferred)
        }
    }
}

enum StepOutcome {
    Continue,
    Halted,
}

fn binop_for(op: OpCode) -> BinOp {
    match op {
        OpCode::Add => BinOp::Add,
        OpCode::Subtract => BinOp::Subtract,
        OpCode::Multiply => BinOp::Multiply,
        OpCode::Divide => BinOp::Divide,
        OpCode::FloorDivide => BinOp::FloorDivide,
        OpCode::Modulo => BinOp::Modulo,
        OpCode::Power => BinOp::Power,
        OpCode::BitwiseAnd => BinOp::BitwiseAnd,
        OpCode::BitwiseOr => BinOp::BitwiseOr,
        OpCode::BitwiseXor => BinOp::BitwiseXor,
        OpCode::BitwiseLShift => BinOp::BitwiseLShift,
        OpCode::BitwiseRShift => BinOp::BitwiseRShift,
        OpCode::Gt => BinOp::Gt,
        OpCode::Ge => BinOp::Ge,
        OpCode::Eq => BinOp::Eq,
        OpCode::Neq => BinOp::Neq,
        OpCode::Contain => BinOp::Contain,
        _ => unreachable!("binop_for called with a non-binary opcode"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_vm() -> Vm {
        Vm::new(VmConfig::default())
    }

    #[test]
    fn host_globals_are_registered_and_readable() {
        let mut vm = new_vm();
        vm.add_global_variable("answer", Value::Int(42)).unwrap();
        let id = vm.symbols.get("answer").unwrap().id();
        let idx = vm.host_globals.index_of_id(id).unwrap();
        assert_eq!(vm.host_globals.get(idx), Some(Value::Int(42)));
    }

    #[test]
    fn exceeding_host_global_cap_fails() {
        let mut globals = HostGlobals::new();
        for i in 0..MAX_HOST_GLOBALS as u32 {
            globals.register(i, Value::Int(0)).unwrap();
        }
        let err = globals.register(MAX_HOST_GLOBALS as u32, Value::Int(0)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TooManyGlobalVars);
    }

    #[test]
    fn compiling_and_running_a_trivial_module_returns_its_last_expression() {
        let mut vm = new_vm();
        let module = vm.compile_module(b"1 + 2", "main").expect("compiles");
        let id = vm.register_module(module);
        vm.run_module(id).expect("runs");
    }

    #[test]
    fn compiling_invalid_utf8_source_is_a_lexical_error() {
        let mut vm = new_vm();
        let err = vm.compile_module(&[0x61, 0xFF], "main").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidUtf8);
    }
}
