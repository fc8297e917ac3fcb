//! `#name(...)` built-ins.
//!
//! Arity is checked at compile time. Pure calls only look at their
//! arguments, so the prune pass may fold them when every argument is
//! constant; the rest touch the context, the clock or the outside world and
//! are evaluated by the interpreter.

use std::ops::RangeInclusive;

use crate::record::{KnowledgeRecord, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemCall {
    DeleteVariable,
    Evaluate,
    Expand,
    Fragment,
    GetClock,
    SetClock,
    GetTime,
    GetTimeSeconds,
    Print,
    RandDouble,
    RandInt,
    Size,
    Sleep,
    ToDouble,
    ToDoubles,
    ToInteger,
    ToIntegers,
    ToString,
    Type,
    Cos,
    Sin,
    Tan,
    Sqrt,
    Pow,
    IsInf,
}

impl SystemCall {
    /// Resolves a call name (without `#`), including aliases.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let call = match name {
            "clear_variable" | "delete_variable" => Self::DeleteVariable,
            "evaluate" | "eval" => Self::Evaluate,
            "expand" | "expand_statement" => Self::Expand,
            "fragment" => Self::Fragment,
            "get_clock" => Self::GetClock,
            "set_clock" => Self::SetClock,
            "get_time" => Self::GetTime,
            "get_time_seconds" => Self::GetTimeSeconds,
            "print" => Self::Print,
            "rand_double" => Self::RandDouble,
            "rand_int" => Self::RandInt,
            "size" => Self::Size,
            "sleep" => Self::Sleep,
            "to_double" => Self::ToDouble,
            "to_doubles" => Self::ToDoubles,
            "to_integer" => Self::ToInteger,
            "to_integers" => Self::ToIntegers,
            "to_string" => Self::ToString,
            "type" => Self::Type,
            "cos" => Self::Cos,
            "sin" => Self::Sin,
            "tan" => Self::Tan,
            "sqrt" => Self::Sqrt,
            "pow" => Self::Pow,
            "isinf" => Self::IsInf,
            _ => return None,
        };
        Some(call)
    }

    /// Canonical name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::DeleteVariable => "delete_variable",
            Self::Evaluate => "evaluate",
            Self::Expand => "expand",
            Self::Fragment => "fragment",
            Self::GetClock => "get_clock",
            Self::SetClock => "set_clock",
            Self::GetTime => "get_time",
            Self::GetTimeSeconds => "get_time_seconds",
            Self::Print => "print",
            Self::RandDouble => "rand_double",
            Self::RandInt => "rand_int",
            Self::Size => "size",
            Self::Sleep => "sleep",
            Self::ToDouble => "to_double",
            Self::ToDoubles => "to_doubles",
            Self::ToInteger => "to_integer",
            Self::ToIntegers => "to_integers",
            Self::ToString => "to_string",
            Self::Type => "type",
            Self::Cos => "cos",
            Self::Sin => "sin",
            Self::Tan => "tan",
            Self::Sqrt => "sqrt",
            Self::Pow => "pow",
            Self::IsInf => "isinf",
        }
    }

    /// Accepted argument counts.
    #[must_use]
    pub const fn arity(self) -> RangeInclusive<usize> {
        match self {
            Self::GetTime | Self::GetTimeSeconds => 0..=0,
            Self::GetClock => 0..=1,
            Self::SetClock | Self::ToString => 1..=2,
            Self::RandDouble | Self::RandInt => 0..=2,
            Self::Pow => 2..=2,
            Self::Fragment => 3..=3,
            _ => 1..=1,
        }
    }

    pub(crate) const fn arity_text(self) -> &'static str {
        match self {
            Self::GetTime | Self::GetTimeSeconds => "0",
            Self::GetClock => "0 or 1",
            Self::SetClock | Self::ToString => "1 or 2",
            Self::RandDouble | Self::RandInt => "0 to 2",
            Self::Pow => "2",
            Self::Fragment => "3",
            _ => "1",
        }
    }

    /// True when the result depends only on the argument values.
    #[must_use]
    pub const fn is_pure(self) -> bool {
        matches!(
            self,
            Self::Fragment
                | Self::Size
                | Self::ToDouble
                | Self::ToDoubles
                | Self::ToInteger
                | Self::ToIntegers
                | Self::ToString
                | Self::Type
                | Self::Cos
                | Self::Sin
                | Self::Tan
                | Self::Sqrt
                | Self::Pow
                | Self::IsInf
        )
    }

    /// Evaluates a pure call. `None` for calls that need the context.
    #[must_use]
    pub fn eval_pure(self, args: &[KnowledgeRecord]) -> Option<KnowledgeRecord> {
        let arg = |i: usize| args.get(i).cloned().unwrap_or_default();
        let result = match self {
            Self::Fragment => {
                let first = non_negative(arg(1).to_integer());
                let last = non_negative(arg(2).to_integer());
                arg(0).fragment(first, last)
            }
            Self::Size => KnowledgeRecord::from(arg(0).size()),
            Self::ToDouble => KnowledgeRecord::from(arg(0).to_double()),
            Self::ToDoubles => KnowledgeRecord::from(arg(0).to_doubles()),
            Self::ToInteger => KnowledgeRecord::from(arg(0).to_integer()),
            Self::ToIntegers => KnowledgeRecord::from(arg(0).to_integers()),
            Self::ToString => {
                let delimiter = args.get(1).map_or_else(|| ", ".to_string(), ToString::to_string);
                KnowledgeRecord::from(arg(0).to_string_delimited(&delimiter))
            }
            Self::Type => KnowledgeRecord::from(arg(0).kind().code()),
            Self::Cos => map_double(&arg(0), f64::cos),
            Self::Sin => map_double(&arg(0), f64::sin),
            Self::Tan => map_double(&arg(0), f64::tan),
            Self::Sqrt => map_double(&arg(0), f64::sqrt),
            Self::Pow => KnowledgeRecord::from(arg(0).to_double().powf(arg(1).to_double())),
            Self::IsInf => KnowledgeRecord::from(arg(0).to_double().is_infinite()),
            _ => return None,
        };
        Some(result)
    }
}

fn non_negative(v: i64) -> usize {
    usize::try_from(v).unwrap_or(0)
}

/// Applies `f` to a scalar, or element-wise to an array.
fn map_double(record: &KnowledgeRecord, f: fn(f64) -> f64) -> KnowledgeRecord {
    if record.is_array_type() {
        KnowledgeRecord::new(Value::DoubleArray(record.to_doubles().into_iter().map(f).collect()))
    } else {
        KnowledgeRecord::from(f(record.to_double()))
    }
}
