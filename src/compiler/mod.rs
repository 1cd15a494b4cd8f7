//! The single-pass compiler: lexer-driven Pratt expression parser plus
//! statement parser, emitting directly into a function scope's chunk.
//!
//! There is no separate AST stage. Every parse routine either returns an
//! [`ExprResult`] (for expressions) describing where its value already
//! lives, or emits instructions as a side effect (for statements) and
//! propagates failure with `?`, which unwinds straight back to
//! [`compile_module`] — the single exit point §4.3 of the design
//! describes. Dropping `Compiler` at any point along that unwind releases
//! every scope it still owns, since `functions`/`blocks` are just `Vec`s.

mod expr;
mod parser;
mod scope;

pub use expr::ExprResult;

use crate::bytecode::{Instruction, OpCode};
use crate::common::{IdentifierId, ModuleId, RegisterId, SourcePos};
use crate::error::{ErrorKind, SemiError, SemiResult};
use crate::front::{Lexer, Token, TokenKind};
use crate::module::Module;
use crate::value::object::{FunctionProtoObj, ObjHeader, ObjKind, UpvalueDesc};
use crate::value::Value;
use crate::vm::Vm;

use scope::{BlockTag, FunctionScope};

/// Maximum instructions a single function body may emit.
const MAX_INSTRUCTIONS_PER_FUNCTION: usize = 1 << 20;

/// Compile `source` into a fresh module bound to `vm`. On success the
/// module's `init` function prototype is rooted in `vm`'s heap (reachable
/// through the returned `Module`, which the caller is responsible for
/// keeping alive — normally by handing it to [`Vm::register_module`]).
pub fn compile_module(vm: &mut Vm, source: &[u8], name: &str, module_id: ModuleId) -> SemiResult<Module> {
    let lexer = Lexer::new(source)?;
    let mut compiler = Compiler {
        vm,
        lexer,
        functions: vec![FunctionScope::new(module_id, 0, true)],
        module: Module::new(module_id, name.to_string()),
    };
    let result = compiler.compile_top_level();
    match result {
        Ok(()) => {
            let mut module = compiler.module;
            let root = compiler.functions.pop().expect("root function scope");
            let proto = finish_function(compiler.vm, root, 0, None, module_id, None);
            module.init = proto;
            Ok(module)
        }
        Err(e) => Err(e),
    }
}

/// Allocate the immutable [`FunctionProtoObj`] for a finished
/// [`FunctionScope`], transferring its chunk and upvalue list.
fn finish_function(
    vm: &mut Vm,
    scope: FunctionScope,
    coarity_if_unset: u8,
    name: Option<crate::value::symtab::Symbol>,
    module_id: ModuleId,
    _unused: Option<()>,
) -> *mut FunctionProtoObj {
    let coarity = scope.n_returns.unwrap_or(coarity_if_unset);
    vm.gc.alloc(FunctionProtoObj {
        header: ObjHeader::new(ObjKind::FunctionProto),
        name,
        arity: scope.arity,
        coarity,
        max_stack_size: scope.max_used_register,
        chunk: scope.chunk,
        upvalues: scope.upvalues.into_boxed_slice(),
        module_id,
    })
}

/// What an identifier resolves to, in the order the left-hand-side
/// parser consults them.
pub(crate) enum Binding {
    Local(RegisterId),
    Upvalue(u8),
    /// `s = true` selects the exports dict, `s = false` selects globals.
    ModuleVar { index: u16, exported: bool },
    HostGlobal(u16),
    Unbound,
}

pub(crate) struct Compiler<'vm, 'src> {
    pub(crate) vm: &'vm mut Vm,
    pub(crate) lexer: Lexer<'src>,
    pub(crate) functions: Vec<FunctionScope>,
    pub(crate) module: Module,
}

impl<'vm, 'src> Compiler<'vm, 'src> {
    /// A bare expression statement at the very end of the module becomes
    /// its returned value — everywhere else it's just evaluated and its
    /// registers reclaimed, same as inside any other block.
    fn compile_top_level(&mut self) -> SemiResult<()> {
        self.skip_separators()?;
        while !self.check_eof()? {
            let mark = self.func().next_register;
            let end = self.statement()?;
            self.expect_separator_or_eof()?;
            match end {
                BlockEnd::TailValue(result) if self.check_eof()? => {
                    let reg = self.materialize(result)?;
                    self.emit_t(OpCode::Return, reg, 0, 0, false, false)?;
                    return Ok(());
                }
                BlockEnd::TailValue(_) => self.func_mut().release_to(mark),
                BlockEnd::Normal => {}
            }
        }
        self.emit_implicit_return()?;
        Ok(())
    }

    // ---- token helpers --------------------------------------------------

    pub(crate) fn peek(&self) -> &Token {
        self.lexer.peek()
    }

    pub(crate) fn pos(&self) -> SourcePos {
        self.lexer.peek().pos
    }

    pub(crate) fn advance(&mut self) -> SemiResult<Token> {
        Ok(self.lexer.next_token()?)
    }

    pub(crate) fn check_eof(&self) -> SemiResult<bool> {
        Ok(matches!(self.peek().kind, TokenKind::Eof))
    }

    pub(crate) fn check(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    pub(crate) fn err(&self, kind: ErrorKind) -> SemiError {
        SemiError::at(kind, self.pos())
    }

    pub(crate) fn expect(&mut self, kind: TokenKind) -> SemiResult<Token> {
        if self.peek().kind == kind {
            self.advance()
        } else {
            Err(self.err(ErrorKind::MissingToken))
        }
    }

    pub(crate) fn skip_separators(&mut self) -> SemiResult<()> {
        while matches!(self.peek().kind, TokenKind::Separator) {
            self.advance()?;
        }
        Ok(())
    }

    /// Statements are separated by one or more newline/`;` tokens, or end
    /// of input / a closing `}` (checked by the caller).
    pub(crate) fn expect_separator_or_eof(&mut self) -> SemiResult<()> {
        if self.check_eof()? || self.check(&TokenKind::RBrace) {
            return Ok(());
        }
        if !matches!(self.peek().kind, TokenKind::Separator | TokenKind::Semicolon) {
            return Err(self.err(ErrorKind::UnexpectedToken));
        }
        while matches!(self.peek().kind, TokenKind::Separator | TokenKind::Semicolon) {
            self.advance()?;
        }
        Ok(())
    }

    // ---- function scope access -------------------------------------------

    pub(crate) fn func(&self) -> &FunctionScope {
        self.functions.last().expect("at least one function scope")
    }

    pub(crate) fn func_mut(&mut self) -> &mut FunctionScope {
        self.functions.last_mut().expect("at least one function scope")
    }

    pub(crate) fn emit(&mut self, instr: Instruction) -> SemiResult<usize> {
        if self.func().chunk.len() >= MAX_INSTRUCTIONS_PER_FUNCTION {
            return Err(self.err(ErrorKind::TooManyInstructions));
        }
        Ok(self.func_mut().chunk.push(instr))
    }

    pub(crate) fn emit_t(&mut self, op: OpCode, a: u8, b: u8, c: u8, kb: bool, kc: bool) -> SemiResult<usize> {
        self.emit(Instruction::t(op, a, b, c, kb, kc))
    }

    pub(crate) fn emit_k(&mut self, op: OpCode, a: u8, k: u16, i: bool, s: bool) -> SemiResult<usize> {
        self.emit(Instruction::k(op, a, k, i, s))
    }

    pub(crate) fn emit_placeholder_jump(&mut self, op: OpCode) -> SemiResult<usize> {
        self.emit(Instruction::j_placeholder_with_opcode(op))
    }

    /// Emit a `C_JUMP` placeholder: jumps when `R[test_reg].to_bool() ==
    /// jump_if`. Patched later with [`Compiler::patch_jump_to`].
    pub(crate) fn emit_cjump_placeholder(&mut self, test_reg: RegisterId, jump_if: bool) -> SemiResult<usize> {
        self.emit(Instruction::k_jump_placeholder(OpCode::CJump, test_reg, jump_if))
    }

    /// Patch a previously emitted `JUMP`/`C_JUMP` placeholder so it lands
    /// on the instruction about to be emitted next.
    pub(crate) fn patch_jump_to_here(&mut self, at: usize) -> SemiResult<()> {
        let here = self.func().chunk.len();
        self.patch_jump_to(at, here)
    }

    pub(crate) fn patch_jump_to(&mut self, at: usize, target: usize) -> SemiResult<()> {
        let offset = target as i64 - (at as i64 + 1);
        let instr = &mut self.func_mut().chunk.code[at];
        match instr.opcode() {
            OpCode::CJump => {
                if offset.unsigned_abs() > u16::MAX as u64 {
                    return Err(self.err(ErrorKind::Internal("conditional jump target out of encodable range")));
                }
                instr.patch_k_jump_offset(offset as i32);
            }
            _ => {
                if offset.unsigned_abs() >= (1 << 24) {
                    return Err(self.err(ErrorKind::Internal("jump target out of encodable range")));
                }
                instr.patch_j_offset(offset as i32);
            }
        }
        Ok(())
    }

    /// Fresh register holding `value`, spilling to the constant table
    /// when it doesn't fit inline.
    pub(crate) fn emit_load_constant(&mut self, dest: RegisterId, value: Value) -> SemiResult<()> {
        let index = self
            .module
            .constants
            .intern(value)
            .ok_or_else(|| self.err(ErrorKind::TooManyConstants))?;
        self.emit_k(OpCode::LoadConstant, dest, index, false, false)?;
        Ok(())
    }

    pub(crate) fn emit_move(&mut self, dest: RegisterId, src: RegisterId) -> SemiResult<()> {
        if dest != src {
            self.emit_t(OpCode::Move, dest, src, 0, false, false)?;
        }
        Ok(())
    }

    /// Intern an identifier's text, returning its stable symbol id.
    pub(crate) fn intern(&mut self, text: &str) -> IdentifierId {
        self.vm.symbols.intern(text).id()
    }

    /// Allocate or fetch a heap string value for a literal too long to
    /// store inline, using the symbol-owning `Vm`'s heap.
    pub(crate) fn string_value(&mut self, text: &str) -> Value {
        if let Some(inline) = crate::value::InlineString::try_from_str(text) {
            return Value::InlineString(inline);
        }
        let ptr = self.vm.gc.alloc(crate::value::object::StringObj {
            header: ObjHeader::new(ObjKind::Str),
            data: Box::from(text),
        });
        Value::Str(ptr)
    }

    // ---- identifier resolution --------------------------------------------

    /// Resolve `identifier_id` as seen from the current (innermost)
    /// function scope: local, then captured upvalue (recursing through
    /// enclosing functions), then this module's variable dicts, then a
    /// host-registered global.
    pub(crate) fn resolve(&mut self, identifier_id: IdentifierId) -> Binding {
        if let Some(reg) = self.func().resolve_local(identifier_id) {
            return Binding::Local(reg);
        }
        if let Some(idx) = self.resolve_upvalue(self.functions.len() - 1, identifier_id) {
            return Binding::Upvalue(idx);
        }
        if let Some(index) = self.module.exports.index_of(&identifier_id) {
            return Binding::ModuleVar { index, exported: true };
        }
        if let Some(index) = self.module.globals.index_of(&identifier_id) {
            return Binding::ModuleVar { index, exported: false };
        }
        if let Some(idx) = self.vm.host_globals.index_of_id(identifier_id) {
            return Binding::HostGlobal(idx);
        }
        Binding::Unbound
    }

    /// Walk outward from `func_idx` looking for `identifier_id` as a
    /// local of some enclosing function, threading an upvalue descriptor
    /// through every function scope in between.
    fn resolve_upvalue(&mut self, func_idx: usize, identifier_id: IdentifierId) -> Option<u8> {
        if func_idx == 0 {
            return None;
        }
        let parent_idx = func_idx - 1;
        if let Some(reg) = self.functions[parent_idx].resolve_local(identifier_id) {
            return self.functions[func_idx].add_upvalue(
                identifier_id,
                UpvalueDesc {
                    index: reg,
                    is_local: true,
                },
            );
        }
        let parent_upvalue = self.resolve_upvalue(parent_idx, identifier_id)?;
        self.functions[func_idx].add_upvalue(
            identifier_id,
            UpvalueDesc {
                index: parent_upvalue,
                is_local: false,
            },
        )
    }

    fn emit_implicit_return(&mut self) -> SemiResult<()> {
        if !self.func().chunk.ends_with_terminator() {
            self.emit_t(OpCode::Return, crate::bytecode::RETURN_NO_VALUE, 0, 0, false, false)?;
        }
        Ok(())
    }
}

pub(crate) use parser::BlockEnd;
pub(crate) use scope::Variable;
pub(crate) type LoopTag = BlockTag;
