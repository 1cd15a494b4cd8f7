//! Bytecode instruction encoding.
//!
//! Every instruction is a 32-bit word in one of three shapes. All three
//! pack their opcode into the low 6 bits of the first byte so the two
//! shape-specific flag bits share that byte with it:
//!
//! ```text
//! T-shape: [kc:1][kb:1][opcode:6] [C:8] [B:8] [A:8]
//! K-shape: [s:1][i:1][opcode:6]   [K:16]       [A:8]
//! J-shape: [_:1][s:1][opcode:6]   [J:24]
//! ```
//!
//! `RK(X, kX)`: if `kX` is set, the operand is the signed value `X -
//! 128` (i.e. `X` encodes `[-128, 127]` with a +128 bias); otherwise `X`
//! names register `X`.

use derive_more::Display;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[repr(u8)]
pub enum OpCode {
    #[display("noop")]
    Noop = 0,
    #[display("jump")]
    Jump,
    #[display("c_jump")]
    CJump,
    #[display("trap")]
    Trap,
    #[display("return")]
    Return,
    #[display("call")]
    Call,

    #[display("load_constant")]
    LoadConstant,
    #[display("load_bool")]
    LoadBool,
    #[display("load_inline_integer")]
    LoadInlineInteger,
    #[display("load_inline_string")]
    LoadInlineString,
    #[display("get_module_var")]
    GetModuleVar,
    #[display("set_module_var")]
    SetModuleVar,

    #[display("move")]
    Move,
    #[display("get_upvalue")]
    GetUpvalue,
    #[display("set_upvalue")]
    SetUpvalue,
    #[display("close_upvalues")]
    CloseUpvalues,
    #[display("defer_call")]
    DeferCall,

    #[display("add")]
    Add,
    #[display("subtract")]
    Subtract,
    #[display("multiply")]
    Multiply,
    #[display("divide")]
    Divide,
    #[display("floor_divide")]
    FloorDivide,
    #[display("modulo")]
    Modulo,
    #[display("power")]
    Power,
    #[display("negate")]
    Negate,
    #[display("bitwise_and")]
    BitwiseAnd,
    #[display("bitwise_or")]
    BitwiseOr,
    #[display("bitwise_xor")]
    BitwiseXor,
    #[display("bitwise_l_shift")]
    BitwiseLShift,
    #[display("bitwise_r_shift")]
    BitwiseRShift,
    #[display("bitwise_invert")]
    BitwiseInvert,
    #[display("bool_not")]
    BoolNot,

    #[display("gt")]
    Gt,
    #[display("ge")]
    Ge,
    #[display("eq")]
    Eq,
    #[display("neq")]
    Neq,

    #[display("make_range")]
    MakeRange,
    #[display("iter_next")]
    IterNext,

    #[display("get_item")]
    GetItem,
    #[display("set_item")]
    SetItem,
    #[display("contain")]
    Contain,

    #[display("get_attr")]
    GetAttr,
    #[display("set_attr")]
    SetAttr,
    #[display("check_type")]
    CheckType,

    /// Reserved, unimplemented.
    #[display("extra_arg")]
    ExtraArg,
}

impl OpCode {
    const TABLE: &'static [OpCode] = &[
        OpCode::Noop,
        OpCode::Jump,
        OpCode::CJump,
        OpCode::Trap,
        OpCode::Return,
        OpCode::Call,
        OpCode::LoadConstant,
        OpCode::LoadBool,
        OpCode::LoadInlineInteger,
        OpCode::LoadInlineString,
        OpCode::GetModuleVar,
        OpCode::SetModuleVar,
        OpCode::Move,
        OpCode::GetUpvalue,
        OpCode::SetUpvalue,
        OpCode::CloseUpvalues,
        OpCode::DeferCall,
        OpCode::Add,
        OpCode::Subtract,
        OpCode::Multiply,
        OpCode::Divide,
        OpCode::FloorDivide,
        OpCode::Modulo,
        OpCode::Power,
        OpCode::Negate,
        OpCode::BitwiseAnd,
        OpCode::BitwiseOr,
        OpCode::BitwiseXor,
        OpCode::BitwiseLShift,
        OpCode::BitwiseRShift,
        OpCode::BitwiseInvert,
        OpCode::BoolNot,
        OpCode::Gt,
        OpCode::Ge,
        OpCode::Eq,
        OpCode::Neq,
        OpCode::MakeRange,
        OpCode::IterNext,
        OpCode::GetItem,
        OpCode::SetItem,
        OpCode::Contain,
        OpCode::GetAttr,
        OpCode::SetAttr,
        OpCode::CheckType,
        OpCode::ExtraArg,
    ];

    pub fn from_u8(raw: u8) -> Option<OpCode> {
        Self::TABLE.get(raw as usize).copied()
    }
}

/// Sentinel value for `RETURN`'s `A` operand meaning "no return value".
pub const RETURN_NO_VALUE: u8 = 255;

/// A single 32-bit encoded instruction.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Instruction(pub u32);

const OPCODE_MASK: u32 = 0b0011_1111;
const FLAG_BIT0: u32 = 1 << 6;
const FLAG_BIT1: u32 = 1 << 7;

impl Instruction {
    pub fn opcode(self) -> OpCode {
        OpCode::from_u8((self.0 & OPCODE_MASK) as u8).unwrap_or(OpCode::Noop)
    }

    fn raw_opcode(self) -> u8 {
        (self.0 & OPCODE_MASK) as u8
    }

    // ---- T shape --------------------------------------------------------

    pub fn t(op: OpCode, a: u8, b: u8, c: u8, kb: bool, kc: bool) -> Instruction {
        let mut word = op as u32;
        if kb {
            word |= FLAG_BIT0;
        }
        if kc {
            word |= FLAG_BIT1;
        }
        word |= (a as u32) << 8;
        word |= (b as u32) << 16;
        word |= (c as u32) << 24;
        Instruction(word)
    }

    pub fn a(self) -> u8 {
        (self.0 >> 8) as u8
    }
    pub fn b(self) -> u8 {
        (self.0 >> 16) as u8
    }
    pub fn c(self) -> u8 {
        (self.0 >> 24) as u8
    }
    pub fn kb(self) -> bool {
        self.0 & FLAG_BIT0 != 0
    }
    pub fn kc(self) -> bool {
        self.0 & FLAG_BIT1 != 0
    }

    // ---- K shape --------------------------------------------------------

    pub fn k(op: OpCode, a: u8, k: u16, i: bool, s: bool) -> Instruction {
        let mut word = op as u32;
        if i {
            word |= FLAG_BIT0;
        }
        if s {
            word |= FLAG_BIT1;
        }
        word |= (a as u32) << 8;
        word |= (k as u32) << 16;
        Instruction(word)
    }

    /// A `K`-shape placeholder for `C_JUMP`, carrying `a` (the register
    /// to test) and `i` (the bool value that triggers the jump); `K`/`s`
    /// (the jump distance) are patched once the target is known.
    pub fn k_jump_placeholder(op: OpCode, a: u8, i: bool) -> Instruction {
        let mut word = op as u32;
        if i {
            word |= FLAG_BIT0;
        }
        word |= (a as u32) << 8;
        Instruction(word)
    }

    /// Patch a `C_JUMP` placeholder's signed 16-bit jump distance,
    /// preserving its opcode, `A`, and `i` fields.
    pub fn patch_k_jump_offset(&mut self, offset: i32) {
        let (magnitude, s) = if offset < 0 { ((-offset) as u32, true) } else { (offset as u32, false) };
        debug_assert!(magnitude <= u16::MAX as u32);
        let mut word = self.0 & (OPCODE_MASK | FLAG_BIT0 | 0xFF00);
        if s {
            word |= FLAG_BIT1;
        }
        word |= magnitude << 16;
        self.0 = word;
    }

    pub fn k_operand(self) -> u16 {
        (self.0 >> 16) as u16
    }
    pub fn i_flag(self) -> bool {
        self.0 & FLAG_BIT0 != 0
    }
    pub fn s_flag(self) -> bool {
        self.0 & FLAG_BIT1 != 0
    }

    // ---- J shape --------------------------------------------------------

    pub fn j(op: OpCode, offset: i32) -> Instruction {
        let (magnitude, s) = if offset < 0 {
            ((-offset) as u32, true)
        } else {
            (offset as u32, false)
        };
        debug_assert!(magnitude < (1 << 24));
        let mut word = op as u32;
        if s {
            word |= FLAG_BIT0;
        }
        word |= magnitude << 8;
        Instruction(word)
    }

    /// Signed jump offset, relative to the instruction's own position.
    pub fn j_offset(self) -> i32 {
        let magnitude = (self.0 >> 8) as i32;
        if self.0 & FLAG_BIT0 != 0 {
            -magnitude
        } else {
            magnitude
        }
    }

    pub fn j_placeholder() -> Instruction {
        Instruction(0)
    }

    /// A zero-offset `J`-shape placeholder carrying `op`, ready to be
    /// patched once its target is known.
    pub fn j_placeholder_with_opcode(op: OpCode) -> Instruction {
        Instruction(op as u32)
    }

    /// Patch a `J`-shape instruction's offset in place, preserving its
    /// opcode.
    pub fn patch_j_offset(&mut self, offset: i32) {
        let op_bits = self.0 & OPCODE_MASK;
        let mut patched = Instruction::j(OpCode::from_u8(op_bits as u8).unwrap_or(OpCode::Jump), offset);
        patched.0 = (patched.0 & !OPCODE_MASK) | op_bits;
        *self = patched;
    }
}

impl std::fmt::Debug for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (a={} b={} c={} kb={} kc={})",
            self.opcode(),
            self.a(),
            self.b(),
            self.c(),
            self.kb(),
            self.kc()
        )
    }
}

/// Convert a constant value fitting in `[-128, 127]` to its biased
/// 8-bit `RK` encoding, or `None` if it must be spilled to the constant
/// table instead.
pub fn encode_rk_int(value: i64) -> Option<u8> {
    if (-128..=127).contains(&value) {
        Some((value - i64::from(i8::MIN)) as u8)
    } else {
        None
    }
}

pub fn decode_rk_int(bits: u8) -> i64 {
    i64::from(i8::MIN) + i64::from(bits)
}

/// A dense sequence of encoded instructions owned by a function
/// prototype.
#[derive(Default)]
pub struct Chunk {
    pub code: Vec<Instruction>,
}

impl Chunk {
    pub fn new() -> Self {
        Chunk { code: Vec::new() }
    }

    pub fn push(&mut self, instr: Instruction) -> usize {
        self.code.push(instr);
        self.code.len() - 1
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Every chunk must end with `RETURN` or `TRAP`.
    pub fn ends_with_terminator(&self) -> bool {
        matches!(
            self.code.last().map(|i| i.opcode()),
            Some(OpCode::Return) | Some(OpCode::Trap)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_shape_roundtrips_fields() {
        let i = Instruction::t(OpCode::Add, 1, 2, 3, true, false);
        assert_eq!(i.opcode(), OpCode::Add);
        assert_eq!(i.a(), 1);
        assert_eq!(i.b(), 2);
        assert_eq!(i.c(), 3);
        assert!(i.kb());
        assert!(!i.kc());
    }

    #[test]
    fn k_shape_roundtrips_fields() {
        let i = Instruction::k(OpCode::LoadConstant, 7, 1000, false, true);
        assert_eq!(i.opcode(), OpCode::LoadConstant);
        assert_eq!(i.a(), 7);
        assert_eq!(i.k_operand(), 1000);
        assert!(!i.i_flag());
        assert!(i.s_flag());
    }

    #[test]
    fn j_shape_roundtrips_forward_and_backward() {
        let fwd = Instruction::j(OpCode::Jump, 42);
        assert_eq!(fwd.j_offset(), 42);
        let back = Instruction::j(OpCode::Jump, -42);
        assert_eq!(back.j_offset(), -42);
    }

    #[test]
    fn rk_int_roundtrips_within_range() {
        for v in -128i64..=127 {
            let bits = encode_rk_int(v).unwrap();
            assert_eq!(decode_rk_int(bits), v);
        }
        assert!(encode_rk_int(128).is_none());
        assert!(encode_rk_int(-129).is_none());
    }
}
