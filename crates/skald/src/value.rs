//! Compile-time constant values and the numeric semantics used by constant
//! folding.
//!
//! Const values are deliberately detached from any runtime heap: folding
//! happens on plain owned data so the resolver stays free of reference-count
//! or scheduling concerns. The arithmetic here mirrors what the runtime does
//! (wrap-around integer math, floor-mod for `%`, truncating `%%`, decimal
//! division at the configured minimum scale) so a folded constant is
//! indistinguishable from the evaluated expression.

use std::borrow::Cow;

use indexmap::IndexMap;

use crate::{decimal::Dec, token::TokenKind};

/// A constant value known at compile time.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Byte(u8),
    Int(i32),
    Long(i64),
    Double(f64),
    Decimal(Dec),
    String(String),
    List(Vec<Value>),
    Map(IndexMap<String, Value>),
}

/// Promotion rank for numeric values: byte < int < long < double < decimal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Rank {
    Byte,
    Int,
    Long,
    Double,
    Decimal,
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Byte(_) => "byte",
            Self::Int(_) => "int",
            Self::Long(_) => "long",
            Self::Double(_) => "double",
            Self::Decimal(_) => "Decimal",
            Self::String(_) => "String",
            Self::List(_) => "List",
            Self::Map(_) => "Map",
        }
    }

    /// Truthiness: null/false/zero/empty are false, everything else true.
    pub fn truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Byte(v) => *v != 0,
            Self::Int(v) => *v != 0,
            Self::Long(v) => *v != 0,
            Self::Double(v) => *v != 0.0,
            Self::Decimal(d) => !d.is_zero(),
            Self::String(s) => !s.is_empty(),
            Self::List(l) => !l.is_empty(),
            Self::Map(m) => !m.is_empty(),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Self::Byte(_) | Self::Int(_) | Self::Long(_) | Self::Double(_) | Self::Decimal(_)
        )
    }

    fn rank(&self) -> Option<Rank> {
        match self {
            Self::Byte(_) => Some(Rank::Byte),
            Self::Int(_) => Some(Rank::Int),
            Self::Long(_) => Some(Rank::Long),
            Self::Double(_) => Some(Rank::Double),
            Self::Decimal(_) => Some(Rank::Decimal),
            _ => None,
        }
    }

    fn as_i64(&self) -> i64 {
        match self {
            Self::Byte(v) => i64::from(*v),
            Self::Int(v) => i64::from(*v),
            Self::Long(v) => *v,
            Self::Bool(b) => i64::from(*b),
            _ => 0,
        }
    }

    fn as_f64(&self) -> f64 {
        match self {
            Self::Double(v) => *v,
            Self::Decimal(d) => d.to_f64(),
            other => other.as_i64() as f64,
        }
    }

    fn as_decimal(&self) -> Dec {
        match self {
            Self::Decimal(d) => d.clone(),
            other => Dec::from_i64(other.as_i64()),
        }
    }
}

/// Result of a fold step: a value, or a message for the error at the
/// operator's token.
pub type FoldResult = Result<Value, Cow<'static, str>>;

/// Applies a binary arithmetic operator to two constant operands.
///
/// Integer math wraps (two's-complement, matching the runtime's numeric
/// model); `%` is floor-mod, `%%` is the truncating remainder; integer and
/// decimal division by zero is an error; double division follows IEEE rules.
/// String `+` concatenates (a null left operand is an error) and string `*`
/// repeats with a non-negative count.
pub fn fold_binary(op: TokenKind, left: &Value, right: &Value, min_scale: u32) -> FoldResult {
    // String promotion for + and *
    if let Value::String(s) = left {
        match op {
            TokenKind::Plus => {
                return Ok(Value::String(format!("{s}{}", display(right))));
            }
            TokenKind::Star => return string_repeat(s, right),
            _ => {}
        }
    }
    if matches!(left, Value::Null) && op == TokenKind::Plus {
        return Err("null operand for '+'".into());
    }

    match op {
        TokenKind::Ampersand | TokenKind::Pipe | TokenKind::Caret => fold_bitwise(op, left, right),
        TokenKind::ShiftLeft | TokenKind::ShiftRight | TokenKind::ShiftRightUnsigned => fold_shift(op, left, right),
        _ => fold_arith(op, left, right, min_scale),
    }
}

fn fold_arith(op: TokenKind, left: &Value, right: &Value, min_scale: u32) -> FoldResult {
    let (Some(lr), Some(rr)) = (left.rank(), right.rank()) else {
        return Err(format!(
            "non-numeric operand for '{}' ({} and {})",
            op.symbol(),
            left.kind_name(),
            right.kind_name()
        )
        .into());
    };
    let rank = lr.max(rr);
    match rank {
        Rank::Decimal => {
            let (a, b) = (left.as_decimal(), right.as_decimal());
            let result = match op {
                TokenKind::Plus => a.add(&b),
                TokenKind::Minus => a.sub(&b),
                TokenKind::Star => a.mul(&b),
                TokenKind::Slash => a.div(&b, min_scale).ok_or("divide by zero")?,
                TokenKind::Percent => a.mod_floor(&b, min_scale).ok_or("divide by zero")?,
                TokenKind::PercentPercent => a.remainder(&b).ok_or("divide by zero")?,
                _ => return Err(unsupported(op)),
            };
            Ok(Value::Decimal(result))
        }
        Rank::Double => {
            let (a, b) = (left.as_f64(), right.as_f64());
            let result = match op {
                TokenKind::Plus => a + b,
                TokenKind::Minus => a - b,
                TokenKind::Star => a * b,
                TokenKind::Slash => a / b,
                TokenKind::Percent => ((a % b) + b) % b,
                TokenKind::PercentPercent => a % b,
                _ => return Err(unsupported(op)),
            };
            Ok(Value::Double(result))
        }
        Rank::Long => Ok(Value::Long(int_arith(op, left.as_i64(), right.as_i64())?)),
        Rank::Int => {
            let v = int_arith(op, left.as_i64(), right.as_i64())?;
            Ok(Value::Int(v as i32))
        }
        Rank::Byte => {
            let v = int_arith(op, left.as_i64(), right.as_i64())?;
            Ok(Value::Byte(v as u8))
        }
    }
}

fn int_arith(op: TokenKind, a: i64, b: i64) -> Result<i64, Cow<'static, str>> {
    if b == 0 && matches!(op, TokenKind::Slash | TokenKind::Percent | TokenKind::PercentPercent) {
        return Err("divide by zero".into());
    }
    let result = match op {
        TokenKind::Plus => a.wrapping_add(b),
        TokenKind::Minus => a.wrapping_sub(b),
        TokenKind::Star => a.wrapping_mul(b),
        TokenKind::Slash => a.wrapping_div(b),
        // Floor-mod: result takes the sign of the divisor
        TokenKind::Percent => (a.wrapping_rem(b)).wrapping_add(b).wrapping_rem(b),
        TokenKind::PercentPercent => a.wrapping_rem(b),
        _ => return Err(unsupported(op)),
    };
    Ok(result)
}

fn fold_bitwise(op: TokenKind, left: &Value, right: &Value) -> FoldResult {
    let ok = |v: &Value| matches!(v, Value::Byte(_) | Value::Int(_) | Value::Long(_) | Value::Bool(_));
    if !ok(left) || !ok(right) {
        return Err(format!("bitwise '{}' requires int or long operands", op.symbol()).into());
    }
    let (a, b) = (left.as_i64(), right.as_i64());
    let v = match op {
        TokenKind::Ampersand => a & b,
        TokenKind::Pipe => a | b,
        TokenKind::Caret => a ^ b,
        _ => return Err(unsupported(op)),
    };
    if matches!(left, Value::Long(_)) || matches!(right, Value::Long(_)) {
        Ok(Value::Long(v))
    } else {
        Ok(Value::Int(v as i32))
    }
}

fn fold_shift(op: TokenKind, left: &Value, right: &Value) -> FoldResult {
    let amount = right.as_i64();
    if !right.is_numeric() || matches!(right, Value::Double(_) | Value::Decimal(_)) {
        return Err(format!("shift amount for '{}' must be int", op.symbol()).into());
    }
    match left {
        Value::Long(a) => {
            let amt = (amount & 63) as u32;
            let v = match op {
                TokenKind::ShiftLeft => a.wrapping_shl(amt),
                TokenKind::ShiftRight => a.wrapping_shr(amt),
                TokenKind::ShiftRightUnsigned => ((*a as u64).wrapping_shr(amt)) as i64,
                _ => return Err(unsupported(op)),
            };
            Ok(Value::Long(v))
        }
        Value::Int(_) | Value::Byte(_) | Value::Bool(_) => {
            let a = left.as_i64() as i32;
            let amt = (amount & 31) as u32;
            let v = match op {
                TokenKind::ShiftLeft => a.wrapping_shl(amt),
                TokenKind::ShiftRight => a.wrapping_shr(amt),
                TokenKind::ShiftRightUnsigned => ((a as u32).wrapping_shr(amt)) as i32,
                _ => return Err(unsupported(op)),
            };
            Ok(Value::Int(v))
        }
        other => Err(format!("shift '{}' requires int or long, not {}", op.symbol(), other.kind_name()).into()),
    }
}

fn string_repeat(s: &str, count: &Value) -> FoldResult {
    if matches!(count, Value::Null) {
        return Err("string repeat count must not be null".into());
    }
    if !count.is_numeric() {
        return Err(format!("string repeat count must be numeric, not {}", count.kind_name()).into());
    }
    let n = count.as_i64();
    if n < 0 {
        return Err("string repeat count must not be negative".into());
    }
    Ok(Value::String(s.repeat(usize::try_from(n).unwrap_or(0))))
}

/// Applies a comparison or equality operator to two constant operands.
pub fn fold_compare(op: TokenKind, left: &Value, right: &Value) -> FoldResult {
    use std::cmp::Ordering;

    let ordering = if left.is_numeric() && right.is_numeric() {
        let rank = left.rank().unwrap().max(right.rank().unwrap());
        Some(match rank {
            Rank::Decimal => left.as_decimal().cmp(&right.as_decimal()),
            Rank::Double => left
                .as_f64()
                .partial_cmp(&right.as_f64())
                .unwrap_or(Ordering::Greater),
            _ => left.as_i64().cmp(&right.as_i64()),
        })
    } else if let (Value::String(a), Value::String(b)) = (left, right) {
        Some(a.cmp(b))
    } else {
        None
    };

    let result = match op {
        TokenKind::EqualEqual | TokenKind::TripleEqual => {
            ordering.map_or(left == right, |o| o == std::cmp::Ordering::Equal)
        }
        TokenKind::BangEqual | TokenKind::BangEqualEqual => {
            !ordering.map_or(left == right, |o| o == std::cmp::Ordering::Equal)
        }
        other => {
            let Some(ord) = ordering else {
                return Err(format!(
                    "cannot compare {} and {} with '{}'",
                    left.kind_name(),
                    right.kind_name(),
                    other.symbol()
                )
                .into());
            };
            match other {
                TokenKind::Less => ord == Ordering::Less,
                TokenKind::LessEqual => ord != Ordering::Greater,
                TokenKind::Greater => ord == Ordering::Greater,
                TokenKind::GreaterEqual => ord != Ordering::Less,
                TokenKind::Spaceship => {
                    return Ok(Value::Int(match ord {
                        Ordering::Less => -1,
                        Ordering::Equal => 0,
                        Ordering::Greater => 1,
                    }));
                }
                _ => return Err(unsupported(other)),
            }
        }
    };
    Ok(Value::Bool(result))
}

/// Applies a prefix unary operator to a constant operand.
pub fn fold_unary(op: TokenKind, operand: &Value) -> FoldResult {
    match op {
        TokenKind::Bang | TokenKind::Not => Ok(Value::Bool(!operand.truthy())),
        TokenKind::Minus => match operand {
            Value::Byte(v) => Ok(Value::Byte(v.wrapping_neg())),
            Value::Int(v) => Ok(Value::Int(v.wrapping_neg())),
            Value::Long(v) => Ok(Value::Long(v.wrapping_neg())),
            Value::Double(v) => Ok(Value::Double(-v)),
            Value::Decimal(d) => Ok(Value::Decimal(d.negate())),
            other => Err(format!("cannot negate {}", other.kind_name()).into()),
        },
        TokenKind::Plus => {
            if operand.is_numeric() {
                Ok(operand.clone())
            } else {
                Err(format!("non-numeric operand for unary '+': {}", operand.kind_name()).into())
            }
        }
        TokenKind::Tilde => match operand {
            Value::Byte(v) => Ok(Value::Byte(!v)),
            Value::Int(v) => Ok(Value::Int(!v)),
            Value::Long(v) => Ok(Value::Long(!v)),
            other => Err(format!("bitwise '~' requires int or long, not {}", other.kind_name()).into()),
        },
        other => Err(unsupported(other).into()),
    }
}

fn unsupported(op: TokenKind) -> Cow<'static, str> {
    format!("operator '{}' cannot be constant folded", op.symbol()).into()
}

/// Human rendering of a constant, matching the runtime's string conversion.
pub fn display(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Byte(v) => v.to_string(),
        Value::Int(v) => v.to_string(),
        Value::Long(v) => v.to_string(),
        Value::Double(v) => v.to_string(),
        Value::Decimal(d) => d.to_string(),
        Value::String(s) => s.clone(),
        Value::List(items) => {
            let inner: Vec<String> = items.iter().map(display).collect();
            format!("[{}]", inner.join(", "))
        }
        Value::Map(entries) => {
            let inner: Vec<String> = entries.iter().map(|(k, v)| format!("{k}:{}", display(v))).collect();
            format!("[{}]", inner.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_mod_negative_dividend() {
        let result = fold_binary(TokenKind::Percent, &Value::Int(-7), &Value::Int(3), 10).unwrap();
        assert_eq!(result, Value::Int(2));
    }

    #[test]
    fn remainder_negative_dividend() {
        let result = fold_binary(TokenKind::PercentPercent, &Value::Int(-7), &Value::Int(3), 10).unwrap();
        assert_eq!(result, Value::Int(-1));
    }

    #[test]
    fn int_division_truncates() {
        let result = fold_binary(TokenKind::Slash, &Value::Int(7), &Value::Int(2), 10).unwrap();
        assert_eq!(result, Value::Int(3));
    }

    #[test]
    fn int_divide_by_zero_is_error() {
        assert!(fold_binary(TokenKind::Slash, &Value::Int(1), &Value::Int(0), 10).is_err());
    }

    #[test]
    fn promotion_int_plus_long() {
        let result = fold_binary(TokenKind::Plus, &Value::Int(1), &Value::Long(2), 10).unwrap();
        assert_eq!(result, Value::Long(3));
    }

    #[test]
    fn promotion_to_decimal() {
        let result = fold_binary(TokenKind::Plus, &Value::Int(1), &Value::Decimal("0.5".parse().unwrap()), 10).unwrap();
        assert_eq!(result, Value::Decimal("1.5".parse().unwrap()));
    }

    #[test]
    fn string_concat() {
        let result = fold_binary(
            TokenKind::Plus,
            &Value::String("ab".into()),
            &Value::Int(3),
            10,
        )
        .unwrap();
        assert_eq!(result, Value::String("ab3".into()));
    }

    #[test]
    fn string_repeat_negative_is_error() {
        assert!(fold_binary(TokenKind::Star, &Value::String("x".into()), &Value::Int(-1), 10).is_err());
    }

    #[test]
    fn null_plus_is_error() {
        assert!(fold_binary(TokenKind::Plus, &Value::Null, &Value::Int(1), 10).is_err());
    }

    #[test]
    fn bitwise_rejects_double() {
        assert!(fold_binary(TokenKind::Ampersand, &Value::Double(1.0), &Value::Int(1), 10).is_err());
    }

    #[test]
    fn unsigned_shift_int() {
        let result = fold_binary(TokenKind::ShiftRightUnsigned, &Value::Int(-1), &Value::Int(28), 10).unwrap();
        assert_eq!(result, Value::Int(15));
    }

    #[test]
    fn spaceship_returns_int() {
        let result = fold_compare(TokenKind::Spaceship, &Value::Int(1), &Value::Int(2)).unwrap();
        assert_eq!(result, Value::Int(-1));
    }
}
