//! The tagged value model.

pub mod dict;
pub mod object;
pub mod symtab;

use dict::DictKey;
use object::{
    ClosureObj, DictObj, FunctionProtoObj, ListObj, NativeFnObj, ObjKind, RangeObj, StringObj,
    UpvalueObj,
};

/// Strings of 0-2 bytes are stored inline in the value itself and never
/// allocate.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct InlineString {
    pub len: u8,
    pub bytes: [u8; 2],
}

impl InlineString {
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }

    /// Returns `Some` if `s` is short enough to be stored inline.
    pub fn try_from_str(s: &str) -> Option<Self> {
        let b = s.as_bytes();
        if b.len() > 2 {
            return None;
        }
        let mut bytes = [0u8; 2];
        bytes[..b.len()].copy_from_slice(b);
        Some(InlineString {
            len: b.len() as u8,
            bytes,
        })
    }
}

/// A tagged union of every runtime value shape. The tag (the enum
/// discriminant) determines which payload field is live; scalars and the
/// two inline variants never allocate, every other variant is a raw
/// pointer into GC-owned heap memory.
#[derive(Clone, Copy)]
pub enum Value {
    /// Sentinel for "uninitialised" / "absent".
    Invalid,
    Bool(bool),
    Int(i64),
    Float(f64),
    InlineString(InlineString),
    /// Two 32-bit bounds, implicit step = 1.
    InlineRange(i32, i32),
    Str(*mut StringObj),
    Range(*mut RangeObj),
    List(*mut ListObj),
    Dict(*mut DictObj),
    Upvalue(*mut UpvalueObj),
    Closure(*mut ClosureObj),
    FunctionProto(*mut FunctionProtoObj),
    NativeFn(*mut NativeFnObj),
}

impl Value {
    pub const fn unit() -> Value {
        Value::Invalid
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, Value::Invalid)
    }

    /// Truthiness used by `C_JUMP`, `BOOL_NOT`, and short-circuit `and`/`or`:
    /// only `false`, `0`, `0.0`, and the empty string are falsy.
    pub fn to_bool(&self) -> bool {
        match self {
            Value::Invalid => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::InlineString(s) => s.len != 0,
            Value::InlineRange(a, b) => a != b,
            Value::Str(p) => unsafe { !(**p).data.is_empty() },
            _ => true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Invalid => "invalid",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::InlineString(_) | Value::Str(_) => "string",
            Value::InlineRange(..) | Value::Range(_) => "range",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Upvalue(_) => "upvalue",
            Value::Closure(_) => "function",
            Value::FunctionProto(_) => "function",
            Value::NativeFn(_) => "function",
        }
    }

    /// A stable tag used by the GC's dispatch and by `CHECK_TYPE`.
    pub fn object_kind(&self) -> Option<ObjKind> {
        match self {
            Value::Str(_) => Some(ObjKind::Str),
            Value::Range(_) => Some(ObjKind::Range),
            Value::List(_) => Some(ObjKind::List),
            Value::Dict(_) => Some(ObjKind::Dict),
            Value::Upvalue(_) => Some(ObjKind::Upvalue),
            Value::Closure(_) => Some(ObjKind::Closure),
            Value::FunctionProto(_) => Some(ObjKind::FunctionProto),
            Value::NativeFn(_) => Some(ObjKind::NativeFn),
            _ => None,
        }
    }

    /// Content-level comparison used by `EQ`/`NEQ` and by dict-key lookup.
    /// Strings compare by content; numbers compare across int/float;
    /// everything else (lists, dicts, closures, ranges) compares by heap
    /// identity, which is the usual contract for mutable reference types.
    pub fn values_equal(&self, other: &Value) -> bool {
        use Value::*;
        match (self, other) {
            (Invalid, Invalid) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Int(a), Float(b)) | (Float(b), Int(a)) => *a as f64 == *b,
            (InlineRange(a0, a1), InlineRange(b0, b1)) => a0 == b0 && a1 == b1,
            (Range(a), Range(b)) if a == b => true,
            (Range(a), Range(b)) => unsafe {
                (**a).start == (**b).start && (**a).end == (**b).end && (**a).step == (**b).step
            },
            _ if self.is_string() && other.is_string() => self.as_str_lossy() == other.as_str_lossy(),
            (List(a), List(b)) => a == b,
            (Dict(a), Dict(b)) => a == b,
            (Closure(a), Closure(b)) => a == b,
            (FunctionProto(a), FunctionProto(b)) => a == b,
            (NativeFn(a), NativeFn(b)) => a == b,
            (Upvalue(a), Upvalue(b)) => a == b,
            _ => false,
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Value::InlineString(_) | Value::Str(_))
    }

    /// Borrow the string contents. Safe as long as any `Value::Str`
    /// pointer is still alive, which the GC guarantees for every
    /// reachable value.
    pub fn as_str_lossy(&self) -> &str {
        match self {
            Value::InlineString(s) => s.as_str(),
            Value::Str(p) => unsafe { &(**p).data },
            _ => "",
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Invalid => write!(f, "<invalid>"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::InlineString(s) => write!(f, "{:?}", s.as_str()),
            Value::Str(_) => write!(f, "{:?}", self.as_str_lossy()),
            Value::InlineRange(a, b) => write!(f, "{a}..{b}"),
            Value::Range(p) => unsafe { write!(f, "{}..{} step {}", (**p).start, (**p).end, (**p).step) },
            Value::List(_) => write!(f, "<list>"),
            Value::Dict(_) => write!(f, "<dict>"),
            Value::Upvalue(_) => write!(f, "<upvalue>"),
            Value::Closure(_) => write!(f, "<function>"),
            Value::FunctionProto(_) => write!(f, "<function prototype>"),
            Value::NativeFn(_) => write!(f, "<native function>"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.values_equal(other)
    }
}
impl Eq for Value {}

impl DictKey for Value {
    fn dict_hash(&self) -> u64 {
        match self {
            Value::Invalid => 0,
            Value::Bool(b) => *b as u64,
            Value::Int(i) => (*i as u64).wrapping_mul(0x9E3779B97F4A7C15),
            Value::Float(x) => x.to_bits(),
            Value::InlineRange(a, b) => ((*a as u64) << 32 | (*b as u32 as u64)).wrapping_mul(0x9E3779B97F4A7C15),
            _ if self.is_string() => fnv1a(self.as_str_lossy().as_bytes()),
            Value::Range(p) => *p as u64,
            Value::List(p) => *p as u64,
            Value::Dict(p) => *p as u64,
            Value::Upvalue(p) => *p as u64,
            Value::Closure(p) => *p as u64,
            Value::FunctionProto(p) => *p as u64,
            Value::NativeFn(p) => *p as u64,
        }
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
