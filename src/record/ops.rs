//! Arithmetic and comparison between records.
//!
//! Coercion rules:
//! - uncreated acts as integer 0 (and `uncreated + x` is `x`);
//! - integer with integer stays integer (wrapping), anything with a double
//!   becomes double;
//! - `+` with a string on either side concatenates; other operators parse
//!   strings as numbers, 0 when unparseable;
//! - arrays broadcast scalars and combine element-wise with arrays over the
//!   longer length, missing elements reading as 0;
//! - integer division or modulo by zero is 0.

use std::cmp::Ordering;
use std::ops::{Add, Div, Mul, Neg, Not, Rem, Sub};

use super::{KnowledgeRecord, Value};

/// Binary arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl ArithOp {
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
        }
    }

    fn int(self, a: i64, b: i64) -> i64 {
        match self {
            Self::Add => a.wrapping_add(b),
            Self::Sub => a.wrapping_sub(b),
            Self::Mul => a.wrapping_mul(b),
            Self::Div if b == 0 => 0,
            Self::Div => a.wrapping_div(b),
            Self::Rem if b == 0 => 0,
            Self::Rem => a.wrapping_rem(b),
        }
    }

    fn double(self, a: f64, b: f64) -> f64 {
        match self {
            Self::Add => a + b,
            Self::Sub => a - b,
            Self::Mul => a * b,
            Self::Div => a / b,
            Self::Rem => a % b,
        }
    }
}

/// Numeric view of a value.
enum Numeric {
    Int(i64),
    Double(f64),
    Ints(Vec<i64>),
    Doubles(Vec<f64>),
}

impl Numeric {
    fn of(record: &KnowledgeRecord) -> Self {
        match &record.value {
            Value::Uncreated => Self::Int(0),
            Value::Integer(v) => Self::Int(*v),
            Value::Double(v) => Self::Double(*v),
            Value::IntegerArray(v) => Self::Ints(v.clone()),
            Value::DoubleArray(v) => Self::Doubles(v.clone()),
            Value::String(s) => scalar_from_text(s),
            Value::File { kind, data } if kind.is_textual() => scalar_from_text(&String::from_utf8_lossy(data)),
            Value::File { .. } => Self::Int(0),
        }
    }

    fn is_array(&self) -> bool {
        matches!(self, Self::Ints(_) | Self::Doubles(_))
    }

    fn is_integral(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Ints(_))
    }

    #[allow(clippy::cast_precision_loss)]
    fn doubles(self) -> Vec<f64> {
        match self {
            Self::Int(v) => vec![v as f64],
            Self::Double(v) => vec![v],
            Self::Ints(v) => v.into_iter().map(|i| i as f64).collect(),
            Self::Doubles(v) => v,
        }
    }

    fn ints(self) -> Vec<i64> {
        match self {
            Self::Int(v) => vec![v],
            Self::Ints(v) => v,
            #[allow(clippy::cast_possible_truncation)]
            Self::Double(v) => vec![v as i64],
            #[allow(clippy::cast_possible_truncation)]
            Self::Doubles(v) => v.into_iter().map(|d| d as i64).collect(),
        }
    }
}

fn scalar_from_text(s: &str) -> Numeric {
    let t = s.trim();
    if let Ok(i) = t.parse::<i64>() {
        return Numeric::Int(i);
    }
    t.parse::<f64>().map_or(Numeric::Int(0), Numeric::Double)
}

/// Combines two equal-or-broadcast sequences element-wise.
fn zip_with<T: Copy + Default>(a: &[T], a_scalar: bool, b: &[T], b_scalar: bool, f: impl Fn(T, T) -> T) -> Vec<T> {
    let len = match (a_scalar, b_scalar) {
        (true, false) => b.len(),
        (false, true) => a.len(),
        _ => a.len().max(b.len()),
    };
    (0..len)
        .map(|i| {
            let x = if a_scalar { a.first().copied().unwrap_or_default() } else { a.get(i).copied().unwrap_or_default() };
            let y = if b_scalar { b.first().copied().unwrap_or_default() } else { b.get(i).copied().unwrap_or_default() };
            f(x, y)
        })
        .collect()
}

fn numeric_arith(op: ArithOp, lhs: Numeric, rhs: Numeric) -> Value {
    match (lhs, rhs) {
        (Numeric::Int(a), Numeric::Int(b)) => Value::Integer(op.int(a, b)),
        (a, b) if !a.is_array() && !b.is_array() => {
            let x = a.doubles()[0];
            let y = b.doubles()[0];
            Value::Double(op.double(x, y))
        }
        (a, b) => {
            let a_scalar = !a.is_array();
            let b_scalar = !b.is_array();
            if a.is_integral() && b.is_integral() {
                let (x, y) = (a.ints(), b.ints());
                Value::IntegerArray(zip_with(&x, a_scalar, &y, b_scalar, |p, q| op.int(p, q)))
            } else {
                let (x, y) = (a.doubles(), b.doubles());
                Value::DoubleArray(zip_with(&x, a_scalar, &y, b_scalar, |p, q| op.double(p, q)))
            }
        }
    }
}

fn is_texty(record: &KnowledgeRecord) -> bool {
    match &record.value {
        Value::String(_) => true,
        Value::File { kind, .. } => kind.is_textual(),
        _ => false,
    }
}

/// Applies `op` to two records under the coercion rules. The result carries
/// no metadata.
#[must_use]
pub fn arith(op: ArithOp, lhs: &KnowledgeRecord, rhs: &KnowledgeRecord) -> KnowledgeRecord {
    if op == ArithOp::Add {
        if !lhs.exists() {
            return KnowledgeRecord::new(rhs.value.clone());
        }
        if !rhs.exists() {
            return KnowledgeRecord::new(lhs.value.clone());
        }
        if is_texty(lhs) || is_texty(rhs) {
            return KnowledgeRecord::from(format!("{lhs}{rhs}"));
        }
    }
    KnowledgeRecord::new(numeric_arith(op, Numeric::of(lhs), Numeric::of(rhs)))
}

/// Orders two records; `None` when unordered (NaN involved).
#[must_use]
pub fn compare(lhs: &KnowledgeRecord, rhs: &KnowledgeRecord) -> Option<Ordering> {
    if let (Value::File { data: a, .. }, Value::File { data: b, .. }) = (&lhs.value, &rhs.value) {
        return Some(a.cmp(b));
    }
    if is_texty(lhs) || is_texty(rhs) {
        return Some(lhs.to_string().cmp(&rhs.to_string()));
    }
    let a = Numeric::of(lhs);
    let b = Numeric::of(rhs);
    match (a, b) {
        (Numeric::Int(x), Numeric::Int(y)) => Some(x.cmp(&y)),
        (a, b) if !a.is_array() && !b.is_array() => a.doubles()[0].partial_cmp(&b.doubles()[0]),
        (a, b) if a.is_integral() && b.is_integral() => Some(a.ints().cmp(&b.ints())),
        (a, b) => a.doubles().partial_cmp(&b.doubles()),
    }
}

impl KnowledgeRecord {
    /// Ordering under the coercion rules.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        compare(self, other)
    }

    /// KaRL `==`.
    #[must_use]
    pub fn equals(&self, other: &Self) -> bool {
        self.compare(other) == Some(Ordering::Equal)
    }

    /// Numeric `+ 1`; never concatenates, even on strings.
    #[must_use]
    pub fn increment(&self) -> Self {
        Self::new(numeric_arith(ArithOp::Add, Numeric::of(self), Numeric::Int(1)))
    }

    /// Numeric `- 1`.
    #[must_use]
    pub fn decrement(&self) -> Self {
        Self::new(numeric_arith(ArithOp::Sub, Numeric::of(self), Numeric::Int(1)))
    }
}

macro_rules! record_binop {
    ($trait:ident, $method:ident, $op:expr) => {
        impl $trait<&KnowledgeRecord> for &KnowledgeRecord {
            type Output = KnowledgeRecord;

            fn $method(self, rhs: &KnowledgeRecord) -> KnowledgeRecord {
                arith($op, self, rhs)
            }
        }
    };
}

record_binop!(Add, add, ArithOp::Add);
record_binop!(Sub, sub, ArithOp::Sub);
record_binop!(Mul, mul, ArithOp::Mul);
record_binop!(Div, div, ArithOp::Div);
record_binop!(Rem, rem, ArithOp::Rem);

impl Neg for &KnowledgeRecord {
    type Output = KnowledgeRecord;

    fn neg(self) -> KnowledgeRecord {
        let value = match Numeric::of(self) {
            Numeric::Int(v) => Value::Integer(v.wrapping_neg()),
            Numeric::Double(v) => Value::Double(-v),
            Numeric::Ints(v) => Value::IntegerArray(v.into_iter().map(i64::wrapping_neg).collect()),
            Numeric::Doubles(v) => Value::DoubleArray(v.into_iter().map(|d| -d).collect()),
        };
        KnowledgeRecord::new(value)
    }
}

impl Not for &KnowledgeRecord {
    type Output = KnowledgeRecord;

    fn not(self) -> KnowledgeRecord {
        KnowledgeRecord::from(self.is_false())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec<T: Into<KnowledgeRecord>>(v: T) -> KnowledgeRecord {
        v.into()
    }

    #[test]
    fn test_integer_arithmetic() {
        assert_eq!((&rec(3) + &rec(4)).value, Value::Integer(7));
        assert_eq!((&rec(3) - &rec(4)).value, Value::Integer(-1));
        assert_eq!((&rec(3) * &rec(4)).value, Value::Integer(12));
        assert_eq!((&rec(9) / &rec(2)).value, Value::Integer(4));
        assert_eq!((&rec(9) % &rec(4)).value, Value::Integer(1));
    }

    #[test]
    fn test_integer_division_by_zero_is_zero() {
        assert_eq!((&rec(9) / &rec(0)).value, Value::Integer(0));
        assert_eq!((&rec(9) % &rec(0)).value, Value::Integer(0));
        assert_eq!((&rec(i64::MIN) / &rec(-1)).value, Value::Integer(i64::MIN));
    }

    #[test]
    fn test_mixed_numeric_becomes_double() {
        assert_eq!((&rec(3) + &rec(0.5)).value, Value::Double(3.5));
        assert_eq!((&rec(1.0) / &rec(4)).value, Value::Double(0.25));
    }

    #[test]
    fn test_string_concatenation_and_parse() {
        assert_eq!((&rec("a") + &rec(1)).to_string(), "a1");
        assert_eq!((&rec(1) + &rec("a")).to_string(), "1a");
        assert_eq!((&rec("6") * &rec(2)).value, Value::Integer(12));
        assert_eq!((&rec("x") - &rec(2)).value, Value::Integer(-2));
        assert_eq!((&rec("1.5") * &rec(2)).value, Value::Double(3.0));
    }

    #[test]
    fn test_uncreated_identity_for_add() {
        let none = KnowledgeRecord::uncreated();
        assert_eq!((&none + &rec("s")).value, Value::String("s".into()));
        assert_eq!((&rec(5) + &none).value, Value::Integer(5));
        assert_eq!((&none * &rec(5)).value, Value::Integer(0));
    }

    #[test]
    fn test_array_broadcast_and_elementwise() {
        let a = rec(vec![1i64, 2, 3]);
        assert_eq!((&a * &rec(2)).value, Value::IntegerArray(vec![2, 4, 6]));
        assert_eq!((&rec(10) - &a).value, Value::IntegerArray(vec![9, 8, 7]));
        assert_eq!((&a + &rec(vec![1i64])).value, Value::IntegerArray(vec![2, 2, 3]));
        assert_eq!((&a + &rec(0.5)).value, Value::DoubleArray(vec![1.5, 2.5, 3.5]));
    }

    #[test]
    fn test_comparisons() {
        assert!(rec(3).equals(&rec(3.0)));
        assert_eq!(rec(2).compare(&rec(3)), Some(Ordering::Less));
        assert_eq!(rec("b").compare(&rec("a")), Some(Ordering::Greater));
        assert_eq!(rec("10").compare(&rec(9)), Some(Ordering::Less));
        assert!(KnowledgeRecord::uncreated().equals(&rec(0)));
        assert_eq!(rec(f64::NAN).compare(&rec(1.0)), None);
        assert!(!rec(f64::NAN).equals(&rec(f64::NAN)));
        assert_eq!(rec(vec![1i64, 2]).compare(&rec(vec![1i64, 3])), Some(Ordering::Less));
    }

    #[test]
    fn test_negate_and_not() {
        assert_eq!((-&rec(5)).value, Value::Integer(-5));
        assert_eq!((-&rec(vec![1.0, -2.0])).value, Value::DoubleArray(vec![-1.0, 2.0]));
        assert_eq!((!&rec(0)).value, Value::Integer(1));
        assert_eq!((!&rec("x")).value, Value::Integer(0));
        assert_eq!((-&KnowledgeRecord::uncreated()).value, Value::Integer(0));
    }

    #[test]
    fn test_increment_never_concatenates() {
        assert_eq!(rec("41").increment().value, Value::Integer(42));
        assert_eq!(KnowledgeRecord::uncreated().increment().value, Value::Integer(1));
        assert_eq!(rec(1.5).decrement().value, Value::Double(0.5));
    }
}
