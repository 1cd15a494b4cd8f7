//! Primitive dispatch: the numeric/comparison/iteration/collection
//! operations every opcode ultimately bottoms out in.
//!
//! The source language dispatches these through a per-type table of
//! function pointers (`MagicMethodsTable`) indexed by the left
//! operand's value kind, so user-defined types could someday plug into
//! the same opcodes. Without a user-extensible type system here, the
//! table collapses to a match over [`Value`]'s own variants with the
//! identical observable contract; the VM's dispatch loop and the
//! compiler's constant folder both call these same functions so the
//! same arithmetic happens whether a computation is folded at compile
//! time or executed at run time.

use crate::error::ErrorKind;
use crate::value::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    FloorDivide,
    Modulo,
    Power,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    BitwiseLShift,
    BitwiseRShift,
    Gt,
    Ge,
    Eq,
    Neq,
    Contain,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
    Negate,
    BitwiseInvert,
    BoolNot,
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn both_int(a: &Value, b: &Value) -> Option<(i64, i64)> {
    match (a, b) {
        (Value::Int(a), Value::Int(b)) => Some((*a, *b)),
        _ => None,
    }
}

fn numeric_binop(
    op: BinOp,
    left: &Value,
    right: &Value,
    int_op: impl Fn(i64, i64) -> Option<i64>,
    float_op: impl Fn(f64, f64) -> f64,
) -> Result<Value, ErrorKind> {
    if let Some((a, b)) = both_int(left, right) {
        return int_op(a, b).map(Value::Int).ok_or_else(|| binop_runtime_error(op));
    }
    match (as_f64(left), as_f64(right)) {
        (Some(a), Some(b)) => Ok(Value::Float(float_op(a, b))),
        _ => Err(ErrorKind::UnexpectedType),
    }
}

fn binop_runtime_error(op: BinOp) -> ErrorKind {
    match op {
        BinOp::Divide | BinOp::FloorDivide | BinOp::Modulo => ErrorKind::DivideByZero,
        _ => ErrorKind::UnexpectedType,
    }
}

/// Evaluate a binary primitive over non-allocating operands. Used both
/// by the VM's dispatch loop and by the compiler's constant folder, so
/// a folded computation and its runtime equivalent can never disagree.
///
/// String concatenation (`Add` on two strings) is handled by the caller
/// instead of here: producing its result may need a heap allocation
/// this module has no allocator to perform. [`is_string_concat`] lets a
/// caller recognise the case up front.
pub fn eval_binary(op: BinOp, left: &Value, right: &Value) -> Result<Value, ErrorKind> {
    use BinOp::*;
    match op {
        Add => {
            if left.is_string() && right.is_string() {
                return Err(ErrorKind::Internal(
                    "string concatenation must be handled by the caller, which owns an allocator",
                ));
            }
            numeric_binop(op, left, right, |a, b| a.checked_add(b), |a, b| a + b)
        }
        Subtract => numeric_binop(op, left, right, |a, b| a.checked_sub(b), |a, b| a - b),
        Multiply => numeric_binop(op, left, right, |a, b| a.checked_mul(b), |a, b| a * b),
        Divide => {
            if let Some((a, b)) = both_int(left, right) {
                if b == 0 {
                    return Err(ErrorKind::DivideByZero);
                }
                return Ok(Value::Float(a as f64 / b as f64));
            }
            match (as_f64(left), as_f64(right)) {
                (Some(_), Some(b)) if b == 0.0 => Err(ErrorKind::DivideByZero),
                (Some(a), Some(b)) => Ok(Value::Float(a / b)),
                _ => Err(ErrorKind::UnexpectedType),
            }
        }
        FloorDivide => numeric_binop(
            op,
            left,
            right,
            |a, b| if b == 0 { None } else { Some(a.div_euclid(b)) },
            |a, b| (a / b).floor(),
        ),
        Modulo => numeric_binop(
            op,
            left,
            right,
            |a, b| if b == 0 { None } else { Some(a.rem_euclid(b)) },
            |a, b| a.rem_euclid(b),
        ),
        Power => {
            if let Some((a, b)) = both_int(left, right) {
                if b >= 0 {
                    return Ok(Value::Int(a.pow(b as u32)));
                }
                return Ok(Value::Float((a as f64).powf(b as f64)));
            }
            match (as_f64(left), as_f64(right)) {
                (Some(a), Some(b)) => Ok(Value::Float(a.powf(b))),
                _ => Err(ErrorKind::UnexpectedType),
            }
        }
        BitwiseAnd => int_only(left, right, |a, b| a & b),
        BitwiseOr => int_only(left, right, |a, b| a | b),
        BitwiseXor => int_only(left, right, |a, b| a ^ b),
        BitwiseLShift => int_only(left, right, |a, b| a.wrapping_shl(b as u32)),
        BitwiseRShift => int_only(left, right, |a, b| a.wrapping_shr(b as u32)),
        Gt | Ge | Eq | Neq => Ok(Value::Bool(compare(op, left, right)?)),
        Contain => contain(left, right),
    }
}

fn int_only(left: &Value, right: &Value, f: impl Fn(i64, i64) -> i64) -> Result<Value, ErrorKind> {
    let (a, b) = both_int(left, right).ok_or(ErrorKind::UnexpectedType)?;
    Ok(Value::Int(f(a, b)))
}

fn compare(op: BinOp, left: &Value, right: &Value) -> Result<bool, ErrorKind> {
    use BinOp::*;
    if matches!(op, Eq | Neq) {
        let eq = left.values_equal(right);
        return Ok(if op == Eq { eq } else { !eq });
    }
    let ordering = match (as_f64(left), as_f64(right)) {
        (Some(a), Some(b)) => a.partial_cmp(&b).ok_or(ErrorKind::UnexpectedType)?,
        _ if left.is_string() && right.is_string() => left.as_str_lossy().cmp(right.as_str_lossy()),
        _ => return Err(ErrorKind::UnexpectedType),
    };
    Ok(match op {
        Gt => ordering.is_gt(),
        Ge => ordering.is_ge(),
        _ => unreachable!(),
    })
}

fn contain(item: &Value, collection: &Value) -> Result<Value, ErrorKind> {
    match collection {
        Value::List(p) => {
            let items = unsafe { (**p).items.borrow() };
            Ok(Value::Bool(items.iter().any(|v| v.values_equal(item))))
        }
        Value::Dict(p) => {
            let entries = unsafe { (**p).entries.borrow() };
            Ok(Value::Bool(entries.contains_key(item)))
        }
        _ if collection.is_string() && item.is_string() => {
            Ok(Value::Bool(collection.as_str_lossy().contains(item.as_str_lossy())))
        }
        _ => Err(ErrorKind::UnexpectedType),
    }
}

pub fn eval_unary(op: UnOp, operand: &Value) -> Result<Value, ErrorKind> {
    match op {
        UnOp::Negate => match operand {
            Value::Int(i) => Ok(Value::Int(-i)),
            Value::Float(f) => Ok(Value::Float(-f)),
            _ => Err(ErrorKind::UnexpectedType),
        },
        UnOp::BitwiseInvert => match operand {
            Value::Int(i) => Ok(Value::Int(!i)),
            _ => Err(ErrorKind::UnexpectedType),
        },
        UnOp::BoolNot => Ok(Value::Bool(!operand.to_bool())),
    }
}

/// `true` when `op` is `Add` applied to two string operands, the one
/// binary primitive callers must special-case themselves rather than
/// route through [`eval_binary`].
pub fn is_string_concat(op: BinOp, left: &Value, right: &Value) -> bool {
    op == BinOp::Add && left.is_string() && right.is_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_add_stays_integer() {
        let r = eval_binary(BinOp::Add, &Value::Int(2), &Value::Int(3)).unwrap();
        assert_eq!(r, Value::Int(5));
    }

    #[test]
    fn mixed_int_float_promotes_to_float() {
        let r = eval_binary(BinOp::Add, &Value::Int(2), &Value::Float(0.5)).unwrap();
        assert_eq!(r, Value::Float(2.5));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let err = eval_binary(BinOp::Divide, &Value::Int(1), &Value::Int(0)).unwrap_err();
        assert_eq!(err, ErrorKind::DivideByZero);
    }

    #[test]
    fn comparison_operators() {
        assert_eq!(eval_binary(BinOp::Gt, &Value::Int(2), &Value::Int(1)).unwrap(), Value::Bool(true));
        assert_eq!(eval_binary(BinOp::Eq, &Value::Int(2), &Value::Int(2)).unwrap(), Value::Bool(true));
    }

    #[test]
    fn negate_and_invert() {
        assert_eq!(eval_unary(UnOp::Negate, &Value::Int(5)).unwrap(), Value::Int(-5));
        assert_eq!(eval_unary(UnOp::BitwiseInvert, &Value::Int(0)).unwrap(), Value::Int(-1));
        assert_eq!(eval_unary(UnOp::BoolNot, &Value::Bool(false)).unwrap(), Value::Bool(true));
    }
}
