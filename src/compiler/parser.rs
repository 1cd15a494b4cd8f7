//! The statement parser.
//!
//! Unlike expressions, statements are compiled by side effect: each
//! `*_statement` method consumes its own keyword and emits directly into
//! the current function's chunk, returning `()` except for the single
//! "bare expression" case ([`BlockEnd::TailValue`]) that the top-level
//! driver needs in order to implement the REPL-style convention of
//! returning a module's last expression.

use crate::bytecode::{OpCode, RETURN_NO_VALUE};
use crate::common::{IdentifierId, RegisterId};
use crate::error::{ErrorKind, SemiError, SemiResult};
use crate::front::{Keyword, TokenKind};
use crate::value::Value;

use super::scope::{BlockScope, BlockTag, FunctionScope};
use super::{finish_function, Binding, Compiler, ExprResult};

/// How a parsed statement concluded. Only a bare expression statement
/// carries a value forward — every other statement fully consumes
/// itself, emitting whatever code it needs as a side effect.
pub(crate) enum BlockEnd {
    Normal,
    TailValue(ExprResult),
}

/// Where an assignment target lives, resolved the same way a read would
/// resolve it (see [`Compiler::resolve`]) but kept distinct from
/// [`ExprResult`] since only some of these are legal `=`/`:=` targets.
#[derive(Clone, Copy)]
enum Lhs {
    NewBinding(IdentifierId),
    Discard,
    Local(RegisterId),
    Upvalue(u8),
    ModuleVar { index: u16, exported: bool },
    HostGlobal(u16),
    Index { base_reg: RegisterId, key: ExprResult },
}

/// A name bound by `fn` parameters or a `for` loop's variables, which
/// may be a placeholder standing for "don't care".
#[derive(Clone, Copy)]
enum Binder {
    Named(IdentifierId),
    Discard,
}

impl<'vm, 'src> Compiler<'vm, 'src> {
    pub(crate) fn statement(&mut self) -> SemiResult<BlockEnd> {
        match self.peek().kind.clone() {
            TokenKind::Keyword(Keyword::If) => {
                self.if_statement()?;
                Ok(BlockEnd::Normal)
            }
            TokenKind::Keyword(Keyword::For) => {
                self.for_statement()?;
                Ok(BlockEnd::Normal)
            }
            TokenKind::Keyword(Keyword::Fn) => {
                self.fn_statement(false)?;
                Ok(BlockEnd::Normal)
            }
            TokenKind::Keyword(Keyword::Import) => Err(self.err(ErrorKind::ImportUnsupported)),
            TokenKind::Keyword(Keyword::Export) => {
                self.export_statement()?;
                Ok(BlockEnd::Normal)
            }
            TokenKind::Keyword(Keyword::Return) => {
                self.return_statement()?;
                Ok(BlockEnd::Normal)
            }
            TokenKind::Keyword(Keyword::Raise) => Err(self.err(ErrorKind::RaiseUnsupported)),
            TokenKind::Keyword(Keyword::Continue) => {
                self.continue_statement()?;
                Ok(BlockEnd::Normal)
            }
            TokenKind::Keyword(Keyword::Break) => {
                self.break_statement()?;
                Ok(BlockEnd::Normal)
            }
            TokenKind::Keyword(Keyword::Defer) => {
                self.defer_statement()?;
                Ok(BlockEnd::Normal)
            }
            TokenKind::LBrace => {
                self.block_body(BlockTag::Normal)?;
                Ok(BlockEnd::Normal)
            }
            TokenKind::Keyword(Keyword::Struct) => Err(self.err(ErrorKind::StructUnsupported)),
            _ => self.assignment_or_expression_statement(),
        }
    }

    // ---- blocks -----------------------------------------------------------

    fn parse_brace_statements(&mut self) -> SemiResult<()> {
        self.expect(TokenKind::LBrace)?;
        self.skip_separators()?;
        while !self.check(&TokenKind::RBrace) {
            let mark = self.func().next_register;
            let end = self.statement()?;
            self.expect_separator_or_eof()?;
            if matches!(end, BlockEnd::TailValue(_)) {
                self.func_mut().release_to(mark);
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(())
    }

    fn block_body(&mut self, tag: BlockTag) -> SemiResult<BlockScope> {
        self.func_mut().enter_block(tag);
        self.parse_brace_statements()?;
        Ok(self.func_mut().exit_block())
    }

    // ---- assignment / bare expression ----------------------------------

    fn assignment_or_expression_statement(&mut self) -> SemiResult<BlockEnd> {
        match self.peek().kind {
            TokenKind::Identifier(_) | TokenKind::Placeholder(_) => self.identifier_led_statement(),
            _ => {
                let result = self.expr()?;
                Ok(BlockEnd::TailValue(result))
            }
        }
    }

    fn identifier_led_statement(&mut self) -> SemiResult<BlockEnd> {
        let pos = self.pos();
        let token = self.advance()?;
        let (raw_id, mut lhs) = match token.kind {
            TokenKind::Identifier(name) => {
                let id = self.intern(&name);
                let lhs = match self.resolve(id) {
                    Binding::Local(reg) => Lhs::Local(reg),
                    Binding::Upvalue(idx) => Lhs::Upvalue(idx),
                    Binding::ModuleVar { index, exported } => Lhs::ModuleVar { index, exported },
                    Binding::HostGlobal(idx) => Lhs::HostGlobal(idx),
                    Binding::Unbound => Lhs::NewBinding(id),
                };
                (Some(id), lhs)
            }
            TokenKind::Placeholder(_) => (None, Lhs::Discard),
            _ => return Err(SemiError::at(ErrorKind::ExpectedLvalue, pos)),
        };
        lhs = self.parse_lhs_access_chain(lhs)?;

        match self.peek().kind {
            TokenKind::ColonAssign => {
                self.advance()?;
                if matches!(lhs, Lhs::Index { .. }) {
                    return Err(self.err(ErrorKind::ExpectedLvalue));
                }
                self.compile_declare(raw_id)?;
                Ok(BlockEnd::Normal)
            }
            TokenKind::Assign => {
                self.advance()?;
                self.compile_assign(lhs)?;
                Ok(BlockEnd::Normal)
            }
            _ => {
                let result = self.lhs_to_expr_result(lhs)?;
                let result = self.continue_expr(result)?;
                Ok(BlockEnd::TailValue(result))
            }
        }
    }

    fn parse_lhs_access_chain(&mut self, mut lhs: Lhs) -> SemiResult<Lhs> {
        loop {
            match self.peek().kind {
                TokenKind::LBracket => {
                    self.advance()?;
                    let base_reg = self.dereference_lhs(&lhs)?;
                    let key = self.expr()?;
                    self.expect(TokenKind::RBracket)?;
                    lhs = Lhs::Index { base_reg, key };
                }
                TokenKind::Dot => {
                    let pos = self.pos();
                    self.advance()?;
                    self.advance()?; // field name
                    return Err(SemiError::at(ErrorKind::FieldAccessUnsupported, pos));
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    fn dereference_lhs(&mut self, lhs: &Lhs) -> SemiResult<RegisterId> {
        match *lhs {
            Lhs::Local(reg) => Ok(reg),
            Lhs::Upvalue(idx) => {
                let dest = self.alloc_temp()?;
                self.emit_t(OpCode::GetUpvalue, dest, idx, 0, false, false)?;
                Ok(dest)
            }
            Lhs::ModuleVar { index, exported } => {
                let dest = self.alloc_temp()?;
                self.emit_k(OpCode::GetModuleVar, dest, index, false, exported)?;
                Ok(dest)
            }
            Lhs::HostGlobal(index) => {
                let dest = self.alloc_temp()?;
                self.emit_k(OpCode::LoadConstant, dest, index, false, true)?;
                Ok(dest)
            }
            Lhs::Index { base_reg, key } => {
                let (c, kc) = self.to_rk(key)?;
                let dest = self.alloc_temp()?;
                self.emit_t(OpCode::GetItem, dest, base_reg, c, false, kc)?;
                Ok(dest)
            }
            Lhs::NewBinding(_) | Lhs::Discard => Err(self.err(ErrorKind::UninitialisedVariable)),
        }
    }

    fn lhs_to_expr_result(&mut self, lhs: Lhs) -> SemiResult<ExprResult> {
        if let Lhs::Local(reg) = lhs {
            return Ok(ExprResult::Var(reg));
        }
        Ok(ExprResult::Reg(self.dereference_lhs(&lhs)?))
    }

    fn compile_declare(&mut self, raw_id: Option<IdentifierId>) -> SemiResult<()> {
        match raw_id {
            Some(id) => {
                if self.func().is_module_level {
                    if self.module.globals.index_of(&id).is_some() || self.module.exports.index_of(&id).is_some() {
                        return Err(self.err(ErrorKind::VariableAlreadyDefined));
                    }
                    self.module.globals.set(id, Value::unit());
                    let index = self.module.globals.index_of(&id).expect("just inserted");
                    let mark = self.func().next_register;
                    let temp = self.alloc_temp()?;
                    self.expr_into(temp)?;
                    self.emit_k(OpCode::SetModuleVar, temp, index, false, false)?;
                    self.func_mut().release_to(mark);
                } else {
                    let reg = self.func_mut().declare_local(id).ok_or_else(|| self.err(ErrorKind::VariableAlreadyDefined))?;
                    self.expr_into(reg)?;
                }
            }
            None => {
                let mark = self.func().next_register;
                let temp = self.alloc_temp()?;
                self.expr_into(temp)?;
                self.func_mut().release_to(mark);
            }
        }
        Ok(())
    }

    fn compile_assign(&mut self, lhs: Lhs) -> SemiResult<()> {
        match lhs {
            Lhs::NewBinding(_) | Lhs::Discard => Err(self.err(ErrorKind::UninitialisedVariable)),
            Lhs::Local(reg) => {
                self.expr_into(reg)?;
                Ok(())
            }
            Lhs::Upvalue(idx) => {
                let mark = self.func().next_register;
                let value_reg = self.alloc_temp()?;
                self.expr_into(value_reg)?;
                self.emit_t(OpCode::SetUpvalue, value_reg, idx, 0, false, false)?;
                self.func_mut().release_to(mark);
                Ok(())
            }
            Lhs::ModuleVar { index, exported } => {
                let mark = self.func().next_register;
                let value_reg = self.alloc_temp()?;
                self.expr_into(value_reg)?;
                self.emit_k(OpCode::SetModuleVar, value_reg, index, false, exported)?;
                self.func_mut().release_to(mark);
                Ok(())
            }
            Lhs::HostGlobal(_) => Err(self.err(ErrorKind::AssignToHostGlobal)),
            Lhs::Index { base_reg, key } => {
                let mark = self.func().next_register;
                let value_result = self.expr()?;
                let (b, kb) = self.to_rk(key)?;
                let (c, kc) = self.to_rk(value_result)?;
                self.emit_t(OpCode::SetItem, base_reg, b, c, kb, kc)?;
                self.func_mut().release_to(mark);
                Ok(())
            }
        }
    }

    // ---- if/elif/else ----------------------------------------------------

    fn if_statement(&mut self) -> SemiResult<()> {
        self.advance()?; // `if`
        self.compile_if_chain()
    }

    fn compile_if_chain(&mut self) -> SemiResult<()> {
        let cond = self.expr()?;
        if let ExprResult::Constant(c) = cond {
            return self.compile_if_chain_constant(c.to_bool());
        }

        let mark = self.func().next_register;
        let cond_reg = self.materialize(cond)?;
        let jump_to_next = self.emit_cjump_placeholder(cond_reg, false)?;
        self.func_mut().release_to(mark);

        self.block_body(BlockTag::If)?;
        let jump_to_end = self.emit_placeholder_jump(OpCode::Jump)?;
        self.patch_jump_to_here(jump_to_next)?;

        match &self.peek().kind {
            TokenKind::Keyword(Keyword::Elif) => {
                self.advance()?;
                self.compile_if_chain()?;
            }
            TokenKind::Keyword(Keyword::Else) => {
                self.advance()?;
                self.block_body(BlockTag::If)?;
            }
            _ => {}
        }
        self.patch_jump_to_here(jump_to_end)?;
        Ok(())
    }

    /// A compile-time-constant condition needs no `C_JUMP` at all: the
    /// untaken branch (and any untaken elif/else tail) is parsed, for
    /// its tokens, then its emitted code is rewound so the chunk carries
    /// nothing for it — the same dead-branch elision `led_ternary` does.
    fn compile_if_chain_constant(&mut self, taken: bool) -> SemiResult<()> {
        let before_body = self.func().chunk.len();
        self.block_body(BlockTag::If)?;
        if !taken {
            self.func_mut().chunk.code.truncate(before_body);
        }

        let before_rest = self.func().chunk.len();
        match &self.peek().kind {
            TokenKind::Keyword(Keyword::Elif) => {
                self.advance()?;
                self.compile_if_chain()?;
            }
            TokenKind::Keyword(Keyword::Else) => {
                self.advance()?;
                self.block_body(BlockTag::If)?;
            }
            _ => {}
        }
        if taken {
            self.func_mut().chunk.code.truncate(before_rest);
        }
        Ok(())
    }

    // ---- for ---------------------------------------------------------------

    fn for_statement(&mut self) -> SemiResult<()> {
        self.advance()?; // `for`
        if self.check(&TokenKind::LBrace) {
            return self.compile_infinite_for();
        }
        self.compile_iterable_for()
    }

    fn compile_infinite_for(&mut self) -> SemiResult<()> {
        self.func_mut().enter_block(BlockTag::Loop);
        self.func_mut().current_block_mut().loop_base_register = Some(self.func().next_register);
        let loop_top = self.func().chunk.len();
        self.func_mut().current_block_mut().loop_top = Some(loop_top);

        self.parse_brace_statements()?;

        let back = self.emit_placeholder_jump(OpCode::Jump)?;
        self.patch_jump_to(back, loop_top)?;

        let block = self.func_mut().exit_block();
        for patch in &block.break_patches {
            self.patch_jump_to_here(*patch)?;
        }
        Ok(())
    }

    fn compile_iterable_for(&mut self) -> SemiResult<()> {
        let first = self.expect_binder()?;
        let second = if self.check(&TokenKind::Comma) {
            self.advance()?;
            Some(self.expect_binder()?)
        } else {
            None
        };
        self.expect(TokenKind::Keyword(Keyword::In))?;
        let iterable = self.expr()?;

        self.func_mut().enter_block(BlockTag::Loop);
        let mark = self.func().next_register;
        let iter_reg = self.materialize(iterable)?;
        let index_reg = self.alloc_temp()?;
        self.emit_k(OpCode::LoadInlineInteger, index_reg, 0, false, false)?;

        let (index_name, item_name) = match second {
            Some(item) => (Some(first), item),
            None => (None, first),
        };
        let item_reg = self.bind_binder(item_name)?;
        self.func_mut().current_block_mut().loop_base_register = Some(item_reg);

        let loop_top = self.func().chunk.len();
        self.func_mut().current_block_mut().loop_top = Some(loop_top);
        self.emit_t(OpCode::IterNext, index_reg, item_reg, iter_reg, false, false)?;
        // on exhaustion ITER_NEXT falls through into this placeholder JUMP;
        // on success it skips past it straight into the loop body.
        let exit_jump = self.emit_placeholder_jump(OpCode::Jump)?;

        if let Some(name) = index_name {
            let idx_local = self.bind_binder(name)?;
            self.emit_move(idx_local, index_reg)?;
        }

        self.parse_brace_statements()?;

        let back = self.emit_placeholder_jump(OpCode::Jump)?;
        self.patch_jump_to(back, loop_top)?;
        self.patch_jump_to_here(exit_jump)?;

        let block = self.func_mut().exit_block();
        for patch in &block.break_patches {
            self.patch_jump_to_here(*patch)?;
        }
        self.func_mut().release_to(mark);
        Ok(())
    }

    fn expect_binder(&mut self) -> SemiResult<Binder> {
        let pos = self.pos();
        let token = self.advance()?;
        match token.kind {
            TokenKind::Identifier(name) => Ok(Binder::Named(self.intern(&name))),
            TokenKind::Placeholder(_) => Ok(Binder::Discard),
            _ => Err(SemiError::at(ErrorKind::ExpectedLvalue, pos)),
        }
    }

    fn bind_binder(&mut self, binder: Binder) -> SemiResult<RegisterId> {
        match binder {
            Binder::Named(id) => self.func_mut().declare_local(id).ok_or_else(|| self.err(ErrorKind::VariableAlreadyDefined)),
            Binder::Discard => self.alloc_temp(),
        }
    }

    // ---- break / continue --------------------------------------------------

    fn break_statement(&mut self) -> SemiResult<()> {
        self.advance()?; // `break`
        let loop_idx = self.func().innermost_loop().ok_or_else(|| self.err(ErrorKind::UnexpectedToken))?;
        self.emit_loop_close(loop_idx)?;
        let patch = self.emit_placeholder_jump(OpCode::Jump)?;
        self.func_mut().blocks[loop_idx].break_patches.push(patch);
        Ok(())
    }

    fn continue_statement(&mut self) -> SemiResult<()> {
        self.advance()?; // `continue`
        let loop_idx = self.func().innermost_loop().ok_or_else(|| self.err(ErrorKind::UnexpectedToken))?;
        let target = self.func().blocks[loop_idx]
            .loop_top
            .expect("a Loop-tagged block always records its loop_top before compiling its body");
        self.emit_loop_close(loop_idx)?;
        let patch = self.emit_placeholder_jump(OpCode::Jump)?;
        self.patch_jump_to(patch, target)?;
        Ok(())
    }

    /// Any closure created this iteration over a local at or above the
    /// loop's base register must be closed before `break`/`continue`
    /// leaves or restarts the loop, or the next iteration's write to
    /// that register would bleed into the closed-over value.
    fn emit_loop_close(&mut self, loop_idx: usize) -> SemiResult<()> {
        if let Some(base) = self.func().blocks[loop_idx].loop_base_register {
            self.emit_t(OpCode::CloseUpvalues, base, 0, 0, false, false)?;
        }
        Ok(())
    }

    // ---- return --------------------------------------------------------

    fn return_statement(&mut self) -> SemiResult<()> {
        self.advance()?; // `return`
        let has_value = !matches!(
            self.peek().kind,
            TokenKind::Separator | TokenKind::Semicolon | TokenKind::RBrace | TokenKind::Eof
        );
        if has_value && self.func().in_defer {
            return Err(self.err(ErrorKind::ReturnValueInDefer));
        }
        let coarity = if has_value { 1u8 } else { 0u8 };
        match self.func().n_returns {
            Some(n) if n != coarity => return Err(self.err(ErrorKind::InconsistentReturnArity)),
            _ => self.func_mut().n_returns = Some(coarity),
        }
        if has_value {
            let result = self.expr()?;
            let reg = self.materialize(result)?;
            self.emit_t(OpCode::Return, reg, 0, 0, false, false)?;
        } else {
            self.emit_t(OpCode::Return, RETURN_NO_VALUE, 0, 0, false, false)?;
        }
        Ok(())
    }

    // ---- defer --------------------------------------------------------

    fn defer_statement(&mut self) -> SemiResult<()> {
        self.advance()?; // `defer`
        if self.func().in_defer {
            return Err(self.err(ErrorKind::NestedDefer));
        }
        let module_id = self.func().module_id;
        self.functions.push(FunctionScope::new(module_id, 0, false));
        self.func_mut().in_defer = true;

        self.block_body(BlockTag::Fn)?;
        self.emit_implicit_return()?;

        let finished = self.functions.pop().expect("just pushed");
        let proto = finish_function(self.vm, finished, 0, None, module_id, None);
        let index = self
            .module
            .constants
            .intern(Value::FunctionProto(proto))
            .ok_or_else(|| self.err(ErrorKind::TooManyConstants))?;
        self.emit_k(OpCode::DeferCall, 0, index, false, false)?;
        Ok(())
    }

    // ---- export --------------------------------------------------------

    fn export_statement(&mut self) -> SemiResult<()> {
        self.advance()?; // `export`
        if !self.func().is_module_level {
            return Err(self.err(ErrorKind::ExportOutsideTopLevel));
        }
        if self.check(&TokenKind::Keyword(Keyword::Fn)) {
            return self.fn_statement(true);
        }
        let pos = self.pos();
        let token = self.advance()?;
        let id = match token.kind {
            TokenKind::Identifier(name) => self.intern(&name),
            _ => return Err(SemiError::at(ErrorKind::ExpectedLvalue, pos)),
        };
        self.expect(TokenKind::ColonAssign)?;
        if self.module.exports.index_of(&id).is_some() || self.module.globals.index_of(&id).is_some() {
            return Err(self.err(ErrorKind::VariableAlreadyDefined));
        }
        self.module.exports.set(id, Value::unit());
        let index = self.module.exports.index_of(&id).expect("just inserted");

        let mark = self.func().next_register;
        let temp = self.alloc_temp()?;
        self.expr_into(temp)?;
        self.emit_k(OpCode::SetModuleVar, temp, index, false, true)?;
        self.func_mut().release_to(mark);
        Ok(())
    }

    // ---- fn --------------------------------------------------------------

    fn fn_statement(&mut self, exported: bool) -> SemiResult<()> {
        self.advance()?; // `fn`
        let pos = self.pos();
        let token = self.advance()?;
        let name = match token.kind {
            TokenKind::Identifier(name) => name,
            _ => return Err(SemiError::at(ErrorKind::ExpectedLvalue, pos)),
        };
        let name_id = self.intern(&name);

        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                params.push(self.expect_binder()?);
                if self.check(&TokenKind::Comma) {
                    self.advance()?;
                } else {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;
        if params.len() > u8::MAX as usize {
            return Err(self.err(ErrorKind::TooManyArguments));
        }
        let arity = params.len() as u8;
        let module_id = self.func().module_id;
        let is_module_level = self.func().is_module_level;

        // Reserve the binding slot before compiling the body, so a
        // recursive call inside the function resolves to itself.
        let (dest_local, module_index) = if is_module_level {
            let dict = if exported { &mut self.module.exports } else { &mut self.module.globals };
            if dict.index_of(&name_id).is_some() {
                return Err(self.err(ErrorKind::VariableAlreadyDefined));
            }
            dict.set(name_id, Value::unit());
            let index = dict.index_of(&name_id).expect("just inserted");
            (None, Some(index))
        } else {
            let reg = self.func_mut().declare_local(name_id).ok_or_else(|| self.err(ErrorKind::VariableAlreadyDefined))?;
            (Some(reg), None)
        };

        self.functions.push(FunctionScope::new(module_id, arity, false));
        for p in params {
            self.bind_binder(p)?;
        }
        self.block_body(BlockTag::Fn)?;
        self.emit_implicit_return()?;
        let finished = self.functions.pop().expect("just pushed");

        let symbol = self.vm.symbols.intern(&name);
        let proto = finish_function(self.vm, finished, 0, Some(symbol), module_id, None);
        let const_index = self
            .module
            .constants
            .intern(Value::FunctionProto(proto))
            .ok_or_else(|| self.err(ErrorKind::TooManyConstants))?;

        match (dest_local, module_index) {
            (Some(reg), None) => {
                self.emit_k(OpCode::LoadConstant, reg, const_index, false, false)?;
            }
            (None, Some(index)) => {
                let mark = self.func().next_register;
                let temp = self.alloc_temp()?;
                self.emit_k(OpCode::LoadConstant, temp, const_index, false, false)?;
                self.emit_k(OpCode::SetModuleVar, temp, index, false, exported)?;
                self.func_mut().release_to(mark);
            }
            _ => unreachable!("exactly one destination is chosen above"),
        }
        Ok(())
    }
}
