//! The Pratt expression parser.
//!
//! `parse_expr` is the whole algorithm: dispatch the current token to a
//! null denotation (`nud`) to get a left-hand side, then keep absorbing
//! operators whose left binding power is at least the caller's
//! threshold via their left denotation (`led`). Every routine returns an
//! [`ExprResult`] instead of emitting unconditionally, which is what
//! lets constant folding, RK operand inlining, and redundant-`MOVE`
//! avoidance all fall out of the same tagging scheme.

use crate::bytecode::{encode_rk_int, OpCode};
use crate::common::RegisterId;
use crate::error::{ErrorKind, SemiError, SemiResult};
use crate::front::{Keyword, TokenKind};
use crate::value::object::{ObjHeader, ObjKind, RangeObj};
use crate::value::Value;
use crate::vm::magic::{self, BinOp, UnOp};

use super::{Binding, Compiler};

/// Where an already-parsed (sub)expression's value currently lives.
/// `Type` from the design's four-way tagging is omitted: a type
/// identifier always fails to parse (see [`Compiler::nud`]) before an
/// `ExprResult` could ever be built around one.
#[derive(Clone, Copy)]
pub(crate) enum ExprResult {
    /// Compile-time known value; nothing has been emitted for it yet.
    Constant(Value),
    /// Already sitting in a declared local's register — never `MOVE`d
    /// out of it speculatively.
    Var(RegisterId),
    /// Sitting in a temporary register owned by the expression in
    /// progress.
    Reg(RegisterId),
}

// Binding powers, low to high, spaced out so a left-associative
// operator's right-hand recursive call (`level + 1`) never reaches the
// next level up.
const NONE_BP: u8 = 0;
const TERNARY_BP: u8 = 10;
const OR_BP: u8 = 20;
const AND_BP: u8 = 30;
const IN_BP: u8 = 40;
const IS_BP: u8 = 50;
const EQUALITY_BP: u8 = 60;
const COMPARISON_BP: u8 = 65;
const RANGE_BP: u8 = 70;
const BITWISE_BP: u8 = 80;
const TERM_BP: u8 = 90;
const FACTOR_BP: u8 = 100;
const EXPONENT_BP: u8 = 110;
const UNARY_BP: u8 = 120;
const ACCESS_BP: u8 = 130;

impl<'vm, 'src> Compiler<'vm, 'src> {
    /// Parse a full expression (everything down through `?:`).
    pub(crate) fn expr(&mut self) -> SemiResult<ExprResult> {
        self.parse_expr(NONE_BP)
    }

    /// Parse a full expression and land its value in `dest`, emitting a
    /// `MOVE`/load only if it doesn't already live there.
    pub(crate) fn expr_into(&mut self, dest: RegisterId) -> SemiResult<ExprResult> {
        let result = self.expr()?;
        self.materialize_into(result, dest)?;
        Ok(ExprResult::Reg(dest))
    }

    pub(crate) fn parse_expr(&mut self, min_bp: u8) -> SemiResult<ExprResult> {
        let lhs = self.nud()?;
        self.parse_expr_from(lhs, min_bp)
    }

    fn parse_expr_from(&mut self, mut lhs: ExprResult, min_bp: u8) -> SemiResult<ExprResult> {
        loop {
            if self.current_lbp() < min_bp {
                break;
            }
            lhs = self.led(lhs)?;
        }
        Ok(lhs)
    }

    /// Resume Pratt parsing from a value already produced outside the
    /// usual `nud` path — used by statement parsing once it discovers an
    /// assignment-looking prefix was actually just the start of a larger
    /// expression statement (e.g. `foo()` or `a[0] + 1`).
    pub(crate) fn continue_expr(&mut self, lhs: ExprResult) -> SemiResult<ExprResult> {
        self.parse_expr_from(lhs, NONE_BP)
    }

    fn current_lbp(&self) -> u8 {
        match &self.peek().kind {
            TokenKind::Question => TERNARY_BP,
            TokenKind::Keyword(Keyword::Or) => OR_BP,
            TokenKind::Keyword(Keyword::And) => AND_BP,
            TokenKind::Keyword(Keyword::In) => IN_BP,
            TokenKind::Keyword(Keyword::Is) => IS_BP,
            TokenKind::EqEq | TokenKind::NotEq => EQUALITY_BP,
            TokenKind::Lt | TokenKind::Le | TokenKind::Gt | TokenKind::Ge => COMPARISON_BP,
            TokenKind::DotDot => RANGE_BP,
            TokenKind::Amp | TokenKind::Pipe | TokenKind::Caret | TokenKind::ShiftLeft | TokenKind::ShiftRight => BITWISE_BP,
            TokenKind::Plus | TokenKind::Minus => TERM_BP,
            TokenKind::Star | TokenKind::Slash | TokenKind::DoubleSlash | TokenKind::Percent => FACTOR_BP,
            TokenKind::DoubleStar => EXPONENT_BP,
            TokenKind::LParen | TokenKind::LBracket | TokenKind::Dot => ACCESS_BP,
            _ => NONE_BP,
        }
    }

    // ---- null denotations ----------------------------------------------

    fn nud(&mut self) -> SemiResult<ExprResult> {
        let pos = self.pos();
        let token = self.advance()?;
        match token.kind {
            TokenKind::Int(i) => Ok(ExprResult::Constant(Value::Int(i))),
            TokenKind::Float(f) => Ok(ExprResult::Constant(Value::Float(f))),
            TokenKind::Str(s) => Ok(ExprResult::Constant(self.string_value(&s))),
            TokenKind::Keyword(Keyword::True) => Ok(ExprResult::Constant(Value::Bool(true))),
            TokenKind::Keyword(Keyword::False) => Ok(ExprResult::Constant(Value::Bool(false))),
            TokenKind::Identifier(name) => self.read_identifier(&name),
            // Placeholders (`_0`, `_1`, ...) are throwaway: they are
            // never bound, so reading one is the same error as reading
            // any other uninitialised name.
            TokenKind::Placeholder(_) => Err(SemiError::at(ErrorKind::UninitialisedVariable, pos)),
            TokenKind::TypeIdentifier(_) => Err(SemiError::at(ErrorKind::TypeIdentifierUnsupported, pos)),
            TokenKind::Minus => self.nud_unary(UnOp::Negate, OpCode::Negate),
            TokenKind::Bang => self.nud_unary(UnOp::BoolNot, OpCode::BoolNot),
            TokenKind::Tilde => self.nud_unary(UnOp::BitwiseInvert, OpCode::BitwiseInvert),
            TokenKind::LParen => {
                let inner = self.parse_expr(NONE_BP)?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            _ => Err(SemiError::at(ErrorKind::UnexpectedToken, pos)),
        }
    }

    fn nud_unary(&mut self, un_op: UnOp, op_code: OpCode) -> SemiResult<ExprResult> {
        let operand = self.parse_expr(UNARY_BP)?;
        if let ExprResult::Constant(v) = operand {
            return magic::eval_unary(un_op, &v).map(ExprResult::Constant).map_err(|e| self.err(e));
        }
        let src = self.materialize(operand)?;
        let dest = self.alloc_temp()?;
        self.emit_t(op_code, dest, src, 0, false, false)?;
        Ok(ExprResult::Reg(dest))
    }

    /// Resolve an identifier read: local, upvalue, module variable, or
    /// host global, in that order; an unbound name is a read error.
    fn read_identifier(&mut self, text: &str) -> SemiResult<ExprResult> {
        let id = self.intern(text);
        match self.resolve(id) {
            Binding::Local(reg) => Ok(ExprResult::Var(reg)),
            Binding::Upvalue(idx) => {
                let dest = self.alloc_temp()?;
                self.emit_t(OpCode::GetUpvalue, dest, idx, 0, false, false)?;
                Ok(ExprResult::Reg(dest))
            }
            Binding::ModuleVar { index, exported } => {
                let dest = self.alloc_temp()?;
                self.emit_k(OpCode::GetModuleVar, dest, index, false, exported)?;
                Ok(ExprResult::Reg(dest))
            }
            Binding::HostGlobal(index) => {
                let dest = self.alloc_temp()?;
                self.emit_k(OpCode::LoadConstant, dest, index, false, true)?;
                Ok(ExprResult::Reg(dest))
            }
            Binding::Unbound => Err(self.err(ErrorKind::UninitialisedVariable)),
        }
    }

    // ---- left denotations -----------------------------------------------

    fn led(&mut self, lhs: ExprResult) -> SemiResult<ExprResult> {
        match self.peek().kind.clone() {
            TokenKind::Question => self.led_ternary(lhs),
            TokenKind::Keyword(Keyword::Or) => self.led_logical(lhs, OR_BP, true),
            TokenKind::Keyword(Keyword::And) => self.led_logical(lhs, AND_BP, false),
            TokenKind::Keyword(Keyword::In) => self.led_in(lhs),
            TokenKind::Keyword(Keyword::Is) => self.led_is(),
            TokenKind::EqEq => self.led_binary_op(lhs, BinOp::Eq, OpCode::Eq, EQUALITY_BP, false),
            TokenKind::NotEq => self.led_binary_op(lhs, BinOp::Neq, OpCode::Neq, EQUALITY_BP, false),
            TokenKind::Lt => self.led_binary_op(lhs, BinOp::Gt, OpCode::Gt, COMPARISON_BP, true),
            TokenKind::Le => self.led_binary_op(lhs, BinOp::Ge, OpCode::Ge, COMPARISON_BP, true),
            TokenKind::Gt => self.led_binary_op(lhs, BinOp::Gt, OpCode::Gt, COMPARISON_BP, false),
            TokenKind::Ge => self.led_binary_op(lhs, BinOp::Ge, OpCode::Ge, COMPARISON_BP, false),
            TokenKind::Amp => self.led_binary_op(lhs, BinOp::BitwiseAnd, OpCode::BitwiseAnd, BITWISE_BP, false),
            TokenKind::Pipe => self.led_binary_op(lhs, BinOp::BitwiseOr, OpCode::BitwiseOr, BITWISE_BP, false),
            TokenKind::Caret => self.led_binary_op(lhs, BinOp::BitwiseXor, OpCode::BitwiseXor, BITWISE_BP, false),
            TokenKind::ShiftLeft => self.led_binary_op(lhs, BinOp::BitwiseLShift, OpCode::BitwiseLShift, BITWISE_BP, false),
            TokenKind::ShiftRight => self.led_binary_op(lhs, BinOp::BitwiseRShift, OpCode::BitwiseRShift, BITWISE_BP, false),
            TokenKind::Plus => self.led_binary_op(lhs, BinOp::Add, OpCode::Add, TERM_BP, false),
            TokenKind::Minus => self.led_binary_op(lhs, BinOp::Subtract, OpCode::Subtract, TERM_BP, false),
            TokenKind::Star => self.led_binary_op(lhs, BinOp::Multiply, OpCode::Multiply, FACTOR_BP, false),
            TokenKind::Slash => self.led_binary_op(lhs, BinOp::Divide, OpCode::Divide, FACTOR_BP, false),
            TokenKind::DoubleSlash => self.led_binary_op(lhs, BinOp::FloorDivide, OpCode::FloorDivide, FACTOR_BP, false),
            TokenKind::Percent => self.led_binary_op(lhs, BinOp::Modulo, OpCode::Modulo, FACTOR_BP, false),
            TokenKind::DoubleStar => self.led_power(lhs),
            TokenKind::DotDot => self.led_range(lhs),
            TokenKind::LParen => self.led_call(lhs),
            TokenKind::LBracket => self.led_index(lhs),
            TokenKind::Dot => self.led_field(),
            _ => Ok(lhs),
        }
    }

    fn led_binary_op(&mut self, lhs: ExprResult, bin_op: BinOp, op_code: OpCode, bp: u8, swapped: bool) -> SemiResult<ExprResult> {
        self.advance()?;
        let rhs = self.parse_expr(bp + 1)?;
        let (left, right) = if swapped { (rhs, lhs) } else { (lhs, rhs) };
        self.compile_binary(op_code, bin_op, left, right)
    }

    fn led_power(&mut self, lhs: ExprResult) -> SemiResult<ExprResult> {
        self.advance()?;
        let rhs = self.parse_expr(EXPONENT_BP)?; // right-associative: same level recurses
        self.compile_binary(OpCode::Power, BinOp::Power, lhs, rhs)
    }

    fn led_in(&mut self, lhs: ExprResult) -> SemiResult<ExprResult> {
        self.advance()?;
        let rhs = self.parse_expr(IN_BP + 1)?;
        self.compile_binary(OpCode::Contain, BinOp::Contain, lhs, rhs)
    }

    /// `is` only ever takes a type identifier on its right, and type
    /// identifiers are a reserved, unimplemented feature; surface that
    /// error here rather than threading a dead `ExprResult::Type`
    /// variant through the rest of the compiler.
    fn led_is(&mut self) -> SemiResult<ExprResult> {
        self.advance()?; // `is`
        let pos = self.pos();
        match self.peek().kind {
            TokenKind::TypeIdentifier(_) => {
                self.advance()?;
                Err(SemiError::at(ErrorKind::TypeIdentifierUnsupported, pos))
            }
            _ => Err(SemiError::at(ErrorKind::UnexpectedToken, pos)),
        }
    }

    fn led_logical(&mut self, lhs: ExprResult, bp: u8, short_circuit_on_true: bool) -> SemiResult<ExprResult> {
        self.advance()?;
        if let ExprResult::Constant(c) = lhs {
            let before = self.func().chunk.len();
            let rhs = self.parse_expr(bp + 1)?;
            if c.to_bool() == short_circuit_on_true {
                self.func_mut().chunk.code.truncate(before);
                return Ok(ExprResult::Constant(c));
            }
            return Ok(rhs);
        }
        let dest = self.alloc_temp()?;
        self.materialize_into(lhs, dest)?;
        let jump = self.emit_cjump_placeholder(dest, short_circuit_on_true)?;
        let rhs = self.parse_expr(bp + 1)?;
        self.materialize_into(rhs, dest)?;
        self.patch_jump_to_here(jump)?;
        Ok(ExprResult::Reg(dest))
    }

    fn led_ternary(&mut self, cond: ExprResult) -> SemiResult<ExprResult> {
        self.advance()?; // `?`
        if let ExprResult::Constant(c) = cond {
            let before_then = self.func().chunk.len();
            let then_result = self.parse_expr(TERNARY_BP)?;
            self.expect(TokenKind::Colon)?;
            let before_else = self.func().chunk.len();
            let else_result = self.parse_expr(TERNARY_BP)?;
            return if c.to_bool() {
                self.func_mut().chunk.code.truncate(before_else);
                Ok(then_result)
            } else {
                self.func_mut().chunk.code.drain(before_then..before_else);
                Ok(else_result)
            };
        }
        let mark = self.func().next_register;
        let test_reg = self.materialize(cond)?;
        let jump_if_false = self.emit_cjump_placeholder(test_reg, false)?;
        self.func_mut().release_to(mark);
        let dest = self.alloc_temp()?;
        self.expr_into(dest)?;
        let _ = self.ternary_branch_at(TERNARY_BP, dest)?;
        let jump_to_end = self.emit_placeholder_jump(OpCode::Jump)?;
        self.patch_jump_to_here(jump_if_false)?;
        self.expect(TokenKind::Colon)?;
        self.ternary_branch_at(TERNARY_BP, dest)?;
        self.patch_jump_to_here(jump_to_end)?;
        Ok(ExprResult::Reg(dest))
    }

    fn ternary_branch_at(&mut self, min_bp: u8, dest: RegisterId) -> SemiResult<()> {
        let result = self.parse_expr(min_bp)?;
        self.materialize_into(result, dest)
    }

    fn led_range(&mut self, start: ExprResult) -> SemiResult<ExprResult> {
        self.advance()?; // `..`
        let end = self.parse_expr(RANGE_BP + 1)?;
        let step = if self.check(&TokenKind::Keyword(Keyword::Step)) {
            self.advance()?;
            Some(self.parse_expr(RANGE_BP + 1)?)
        } else {
            None
        };
        self.compile_range(start, end, step)
    }

    fn led_call(&mut self, callee: ExprResult) -> SemiResult<ExprResult> {
        self.advance()?; // `(`
        let callee_reg = self.alloc_temp()?;
        self.materialize_into(callee, callee_reg)?;
        let mut arg_count: u8 = 0;
        if !self.check(&TokenKind::RParen) {
            loop {
                if arg_count == u8::MAX {
                    return Err(self.err(ErrorKind::TooManyArguments));
                }
                let arg_reg = self.alloc_temp()?;
                self.expr_into(arg_reg)?;
                self.func_mut().release_to(arg_reg + 1);
                arg_count += 1;
                if self.check(&TokenKind::Comma) {
                    self.advance()?;
                    if self.check(&TokenKind::RParen) {
                        break;
                    }
                } else {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;
        self.emit_t(OpCode::Call, callee_reg, arg_count, 0, false, false)?;
        Ok(ExprResult::Reg(callee_reg))
    }

    fn led_index(&mut self, base: ExprResult) -> SemiResult<ExprResult> {
        self.advance()?; // `[`
        let base_reg = self.materialize(base)?;
        let index = self.parse_expr(NONE_BP)?;
        self.expect(TokenKind::RBracket)?;
        let (c, kc) = self.to_rk(index)?;
        let dest = self.alloc_temp()?;
        self.emit_t(OpCode::GetItem, dest, base_reg, c, false, kc)?;
        Ok(ExprResult::Reg(dest))
    }

    /// Field access is parsed (so the dot and field name are consumed
    /// like any other token) but always fails: `GET_ATTR`/`SET_ATTR`
    /// are reserved for a struct feature this language doesn't have.
    fn led_field(&mut self) -> SemiResult<ExprResult> {
        let pos = self.pos();
        self.advance()?; // `.`
        self.advance()?; // field name
        Err(SemiError::at(ErrorKind::FieldAccessUnsupported, pos))
    }

    // ---- shared binary-op machinery --------------------------------------

    fn compile_binary(&mut self, op: OpCode, bin_op: BinOp, left: ExprResult, right: ExprResult) -> SemiResult<ExprResult> {
        if let (ExprResult::Constant(l), ExprResult::Constant(r)) = (left, right) {
            return self.fold_binary(bin_op, l, r);
        }
        let (b, kb) = self.to_rk(left)?;
        let (c, kc) = self.to_rk(right)?;
        let dest = self.alloc_temp()?;
        self.emit_t(op, dest, b, c, kb, kc)?;
        Ok(ExprResult::Reg(dest))
    }

    fn fold_binary(&mut self, bin_op: BinOp, left: Value, right: Value) -> SemiResult<ExprResult> {
        if magic::is_string_concat(bin_op, &left, &right) {
            let combined = format!("{}{}", left.as_str_lossy(), right.as_str_lossy());
            return Ok(ExprResult::Constant(self.string_value(&combined)));
        }
        magic::eval_binary(bin_op, &left, &right).map(ExprResult::Constant).map_err(|e| self.err(e))
    }

    /// A range literal folds to a compile-time range constant when
    /// every bound is a constant integer; otherwise it reserves 2 or 3
    /// consecutive registers and emits `MAKE_RANGE`.
    fn compile_range(&mut self, start: ExprResult, end: ExprResult, step: Option<ExprResult>) -> SemiResult<ExprResult> {
        let constants = match (start, end, step) {
            (ExprResult::Constant(Value::Int(s)), ExprResult::Constant(Value::Int(e)), None) => Some((s, e, 1i64)),
            (ExprResult::Constant(Value::Int(s)), ExprResult::Constant(Value::Int(e)), Some(ExprResult::Constant(Value::Int(st)))) => {
                Some((s, e, st))
            }
            _ => None,
        };
        if let Some((s, e, st)) = constants {
            let value = match (st, i32::try_from(s), i32::try_from(e)) {
                (1, Ok(si), Ok(ei)) => Value::InlineRange(si, ei),
                _ => self.alloc_range_object(s, e, st),
            };
            return Ok(ExprResult::Constant(value));
        }
        let width = if step.is_some() { 3 } else { 2 };
        let base = self.func_mut().alloc_registers(width).ok_or_else(|| self.err(ErrorKind::TooManyLocals))?;
        self.materialize_into(start, base)?;
        self.materialize_into(end, base + 1)?;
        if let Some(step_result) = step {
            self.materialize_into(step_result, base + 2)?;
        }
        let dest = self.alloc_temp()?;
        self.emit_t(OpCode::MakeRange, dest, base, if step.is_some() { 1 } else { 0 }, false, false)?;
        Ok(ExprResult::Reg(dest))
    }

    fn alloc_range_object(&mut self, start: i64, end: i64, step: i64) -> Value {
        let ptr = self.vm.gc.alloc(RangeObj {
            header: ObjHeader::new(ObjKind::Range),
            start,
            end,
            step,
        });
        Value::Range(ptr)
    }

    // ---- register / value materialisation --------------------------------

    pub(crate) fn alloc_temp(&mut self) -> SemiResult<RegisterId> {
        self.func_mut().alloc_register().ok_or_else(|| self.err(ErrorKind::TooManyLocals))
    }

    /// The register an [`ExprResult`] already lives in, allocating and
    /// emitting a load only for a still-unmaterialised `Constant`.
    pub(crate) fn materialize(&mut self, result: ExprResult) -> SemiResult<RegisterId> {
        match result {
            ExprResult::Var(r) | ExprResult::Reg(r) => Ok(r),
            ExprResult::Constant(v) => {
                let dest = self.alloc_temp()?;
                self.emit_value(dest, v)?;
                Ok(dest)
            }
        }
    }

    /// Ensure `dest` holds `result`'s value, skipping the `MOVE` when it
    /// already does.
    pub(crate) fn materialize_into(&mut self, result: ExprResult, dest: RegisterId) -> SemiResult<()> {
        match result {
            ExprResult::Constant(v) => self.emit_value(dest, v),
            ExprResult::Var(r) | ExprResult::Reg(r) => self.emit_move(dest, r),
        }
    }

    /// An `RK(x, kx)` operand: a biased inline integer when it fits in
    /// `[-128, 127]` (including bools folded earlier into an int-typed
    /// comparison), otherwise a materialised register.
    pub(crate) fn to_rk(&mut self, result: ExprResult) -> SemiResult<(u8, bool)> {
        if let ExprResult::Constant(Value::Int(i)) = result {
            if let Some(bits) = encode_rk_int(i) {
                return Ok((bits, true));
            }
        }
        Ok((self.materialize(result)?, false))
    }

    /// Emit whatever load instruction makes `dest` hold `value`,
    /// spilling to the constant table when no inline encoding fits.
    /// Bools are never RK-inlined: the VM's `RK` decoder only ever
    /// reconstructs `Value::Int`, so an inlined `true`/`false` would
    /// silently become an integer at sites that compare by type (`EQ`
    /// against another bool). `LOAD_BOOL` always carries the real tag.
    pub(crate) fn emit_value(&mut self, dest: RegisterId, value: Value) -> SemiResult<()> {
        match value {
            Value::Bool(b) => {
                self.emit_k(OpCode::LoadBool, dest, b as u16, false, false)?;
            }
            Value::Int(i) => self.emit_int(dest, i)?,
            // `LOAD_INLINE_STRING`'s K operand packs both bytes of a
            // 0-2 byte `InlineString` (`c[0]` in the low byte, `c[1]` in
            // the high byte); the VM recovers `len` from which bytes are
            // nonzero, so this only round-trips for strings that don't
            // themselves contain a NUL byte.
            Value::InlineString(s) if s.len <= 2 => {
                let k = s.bytes[0] as u16 | ((s.bytes[1] as u16) << 8);
                self.emit_k(OpCode::LoadInlineString, dest, k, false, false)?;
            }
            other => self.emit_load_constant(dest, other)?,
        }
        Ok(())
    }

    /// Inline integers cover `[-2^16+1, 2^16-1]` via `LOAD_INLINE_INTEGER`'s
    /// 16-bit magnitude plus sign flag; anything wider spills to the
    /// constant table.
    fn emit_int(&mut self, dest: RegisterId, value: i64) -> SemiResult<()> {
        const INLINE_MAX: i64 = (1 << 16) - 1;
        const INLINE_MIN: i64 = -((1 << 16) - 1);
        if (INLINE_MIN..=INLINE_MAX).contains(&value) {
            let (magnitude, negative) = if value < 0 { ((-value) as u16, true) } else { (value as u16, false) };
            self.emit_k(OpCode::LoadInlineInteger, dest, magnitude, false, negative)?;
        } else {
            self.emit_load_constant(dest, Value::Int(value))?;
        }
        Ok(())
    }
}
