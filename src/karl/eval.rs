//! Tree-walking interpreter.
//!
//! One [`Evaluator`] runs a whole top-level evaluation under a single
//! caller-held [`ContextGuard`]. Nested KaRL function calls and `#evaluate`
//! share the guard and a call-depth counter.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tracing::{info, warn};

use crate::context::{ContextGuard, Function, KnowledgeUpdateSettings, VariableReference};
use crate::error::EvalError;
use crate::record::ops::{arith, ArithOp};
use crate::record::{KnowledgeRecord, Value};

use super::ast::{BinaryOp, LogicalOp, Node, SequenceOp, Target, UnaryOp, VariableNode};
use super::system_calls::SystemCall;
use super::MAX_CALL_DEPTH;

pub(crate) fn unary(op: UnaryOp, operand: &KnowledgeRecord) -> KnowledgeRecord {
    match op {
        UnaryOp::Negate => -operand,
        UnaryOp::Not => !operand,
    }
}

pub(crate) fn binary(op: BinaryOp, lhs: &KnowledgeRecord, rhs: &KnowledgeRecord) -> KnowledgeRecord {
    let ordering = || lhs.compare(rhs);
    let truth = match op {
        BinaryOp::Arith(op) => return arith(op, lhs, rhs),
        BinaryOp::Eq => lhs.equals(rhs),
        BinaryOp::Ne => !lhs.equals(rhs),
        BinaryOp::Lt => ordering() == Some(Ordering::Less),
        BinaryOp::Le => matches!(ordering(), Some(Ordering::Less | Ordering::Equal)),
        BinaryOp::Gt => ordering() == Some(Ordering::Greater),
        BinaryOp::Ge => matches!(ordering(), Some(Ordering::Greater | Ordering::Equal)),
    };
    KnowledgeRecord::from(truth)
}

/// `[a, b, ...]`: an integer array when every element is an integer,
/// otherwise a double array.
pub(crate) fn array_literal(items: &[KnowledgeRecord]) -> KnowledgeRecord {
    if items.iter().all(|r| matches!(r.value, Value::Integer(_) | Value::Uncreated)) {
        KnowledgeRecord::from(items.iter().map(KnowledgeRecord::to_integer).collect::<Vec<_>>())
    } else {
        KnowledgeRecord::from(items.iter().map(KnowledgeRecord::to_double).collect::<Vec<_>>())
    }
}

/// Folds the results of a sequence's items.
pub(crate) fn sequence_result(op: SequenceOp, results: impl IntoIterator<Item = KnowledgeRecord>) -> KnowledgeRecord {
    let mut results = results.into_iter();
    let Some(first) = results.next() else {
        return KnowledgeRecord::uncreated();
    };
    match op {
        SequenceOp::Both => results.fold(first, |best, r| {
            if r.compare(&best) == Some(Ordering::Greater) {
                r
            } else {
                best
            }
        }),
        SequenceOp::Then | SequenceOp::Comma => results.last().unwrap_or(first),
    }
}

enum Resolved<'n> {
    Bound(&'n VariableReference),
    Key(Cow<'n, str>),
}

pub(crate) struct Evaluator<'e, 'a> {
    guard: &'e mut ContextGuard<'a>,
    settings: KnowledgeUpdateSettings,
    /// `settings` with key expansion off, for keys already expanded.
    raw: KnowledgeUpdateSettings,
    depth: usize,
}

impl<'e, 'a> Evaluator<'e, 'a> {
    pub(crate) fn new(guard: &'e mut ContextGuard<'a>, settings: &KnowledgeUpdateSettings) -> Self {
        Self {
            guard,
            settings: settings.clone(),
            raw: KnowledgeUpdateSettings {
                expand_variables: false,
                ..settings.clone()
            },
            depth: 0,
        }
    }

    fn resolve<'n>(&self, variable: &'n VariableNode) -> Resolved<'n> {
        match &variable.reference {
            Some(reference) => Resolved::Bound(reference),
            None if self.settings.expand_variables => {
                Resolved::Key(Cow::Owned(self.guard.expand_key(&variable.key)))
            }
            None => Resolved::Key(Cow::Borrowed(variable.key.as_str())),
        }
    }

    fn read(&self, variable: &VariableNode) -> KnowledgeRecord {
        match self.resolve(variable) {
            Resolved::Bound(reference) => self.guard.get_by_ref(reference),
            Resolved::Key(key) => self.guard.get(&key),
        }
    }

    fn write(&mut self, variable: &VariableNode, value: KnowledgeRecord) {
        let _ = match self.resolve(variable) {
            Resolved::Bound(reference) => self.guard.set_by_ref(reference, value, &self.settings),
            Resolved::Key(key) => self.guard.set(&key, value, &self.raw),
        };
    }

    fn index_of(&mut self, index: &Node) -> Result<Option<usize>, EvalError> {
        Ok(usize::try_from(self.eval(index)?.to_integer()).ok())
    }

    /// Evaluates `target`'s index (if any) exactly once, then writes.
    fn modify_target(
        &mut self,
        target: &Target,
        update: impl FnOnce(&KnowledgeRecord) -> (KnowledgeRecord, KnowledgeRecord),
    ) -> Result<KnowledgeRecord, EvalError> {
        match target {
            Target::Variable(variable) => {
                let (stored, result) = update(&self.read(variable));
                self.write(variable, stored);
                Ok(result)
            }
            Target::Element { variable, index } => {
                let Some(i) = self.index_of(index)? else {
                    let (_, result) = update(&KnowledgeRecord::uncreated());
                    return Ok(result);
                };
                let current = self.read(variable).retrieve_index(i);
                let (stored, result) = update(&current);
                let _ = match self.resolve(variable) {
                    Resolved::Bound(reference) => self.guard.set_index_by_ref(reference, i, stored, &self.settings),
                    Resolved::Key(key) => self.guard.set_index(&key, i, stored, &self.raw),
                };
                Ok(result)
            }
        }
    }

    pub(crate) fn eval(&mut self, node: &Node) -> Result<KnowledgeRecord, EvalError> {
        match node {
            Node::Leaf(record) => Ok(record.clone()),
            Node::Variable(variable) => Ok(self.read(variable)),
            Node::ArrayElement { variable, index } => {
                let record = match self.index_of(index)? {
                    Some(i) => self.read(variable).retrieve_index(i),
                    None => KnowledgeRecord::uncreated(),
                };
                Ok(record)
            }
            Node::ArrayLiteral(items) => {
                let values = items.iter().map(|n| self.eval(n)).collect::<Result<Vec<_>, _>>()?;
                Ok(array_literal(&values))
            }
            Node::Unary { op, operand } => Ok(unary(*op, &self.eval(operand)?)),
            Node::Increment { target, delta, prefix } => {
                let (delta, prefix) = (*delta, *prefix);
                self.modify_target(target, |current| {
                    let next = if delta > 0 {
                        current.increment()
                    } else {
                        current.decrement()
                    };
                    let result = if prefix { next.clone() } else { current.clone() };
                    (next, result)
                })
            }
            Node::Binary { op, lhs, rhs } => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                Ok(binary(*op, &lhs, &rhs))
            }
            Node::Logical { op, lhs, rhs } => {
                let left = self.eval(lhs)?.is_true();
                let record = match op {
                    LogicalOp::And => KnowledgeRecord::from(left && self.eval(rhs)?.is_true()),
                    LogicalOp::Or => KnowledgeRecord::from(left || self.eval(rhs)?.is_true()),
                    LogicalOp::Implies if left => self.eval(rhs)?,
                    LogicalOp::Implies => KnowledgeRecord::from(0i64),
                };
                Ok(record)
            }
            Node::Assign { op, target, value } => {
                let value = self.eval(value)?;
                match op {
                    None => match target {
                        Target::Variable(variable) => {
                            self.write(variable, value.clone());
                            Ok(value)
                        }
                        Target::Element { .. } => self.modify_target(target, |_| (value.clone(), value.clone())),
                    },
                    Some(op) => {
                        let op: ArithOp = *op;
                        self.modify_target(target, |current| {
                            let next = arith(op, current, &value);
                            (next.clone(), next)
                        })
                    }
                }
            }
            Node::Sequence { op, items } => {
                let mut results = Vec::with_capacity(items.len());
                for item in items {
                    results.push(self.eval(item)?);
                }
                Ok(sequence_result(*op, results))
            }
            Node::Conditional {
                condition,
                then,
                otherwise,
            } => {
                if self.eval(condition)?.is_true() {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            Node::ForLoop {
                variable,
                start,
                step,
                end,
                inclusive,
                body,
            } => self.for_loop(variable, start, step.as_deref(), end, *inclusive, body),
            Node::FunctionCall { name, args } => self.call_function(name, args),
            Node::SystemCall { call, args } => self.system_call(*call, args),
        }
    }

    fn for_loop(
        &mut self,
        variable: &VariableNode,
        start: &Node,
        step: Option<&Node>,
        end: &Node,
        inclusive: bool,
        body: &Node,
    ) -> Result<KnowledgeRecord, EvalError> {
        let start = self.eval(start)?.to_integer();
        let step = match step {
            Some(node) => self.eval(node)?.to_integer(),
            None => 1,
        };
        let end = self.eval(end)?.to_integer();
        if step == 0 {
            return Ok(KnowledgeRecord::from(0i64));
        }

        let in_range = |i: i64| match (step > 0, inclusive) {
            (true, false) => i < end,
            (true, true) => i <= end,
            (false, false) => i > end,
            (false, true) => i >= end,
        };

        self.write(variable, KnowledgeRecord::from(start));
        let mut iterations: i64 = 0;
        loop {
            let i = self.read(variable).to_integer();
            if !in_range(i) {
                break;
            }
            self.eval(body)?;
            iterations += 1;
            let Some(next) = self.read(variable).to_integer().checked_add(step) else {
                break;
            };
            self.write(variable, KnowledgeRecord::from(next));
        }
        Ok(KnowledgeRecord::from(iterations))
    }

    fn enter(&mut self) -> Result<(), EvalError> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(EvalError::CallDepthExceeded {
                max_depth: MAX_CALL_DEPTH,
            });
        }
        self.depth += 1;
        Ok(())
    }

    fn call_function(&mut self, name: &str, args: &[Node]) -> Result<KnowledgeRecord, EvalError> {
        let Some(function) = self.guard.function(name) else {
            warn!(function = %name, "call to undefined function");
            return Ok(KnowledgeRecord::uncreated());
        };

        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg)?);
        }
        let local = KnowledgeUpdateSettings::local();
        for (i, value) in values.iter().enumerate() {
            let _ = self.guard.set(&format!(".{i}"), value.clone(), &local);
        }

        match &function {
            Function::Karl(body) => {
                self.enter()?;
                let result = self.eval(body.root());
                self.depth -= 1;
                result
            }
            external => {
                self.enter()?;
                let result = external.invoke_external(name, &values, self.guard);
                self.depth -= 1;
                result.unwrap_or_else(|| Ok(KnowledgeRecord::uncreated()))
            }
        }
    }

    /// Key named by a system-call argument: the variable's own key when
    /// the argument is a bare variable, else the argument's string value.
    fn key_argument(&mut self, arg: &Node) -> Result<String, EvalError> {
        match arg {
            Node::Variable(variable) => Ok(match self.resolve(variable) {
                Resolved::Bound(reference) => reference.name().to_string(),
                Resolved::Key(key) => key.into_owned(),
            }),
            other => Ok(self.eval(other)?.to_string()),
        }
    }

    fn system_call(&mut self, call: SystemCall, args: &[Node]) -> Result<KnowledgeRecord, EvalError> {
        if call.is_pure() {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(self.eval(arg)?);
            }
            return Ok(call.eval_pure(&values).unwrap_or_default());
        }

        let record = match call {
            SystemCall::DeleteVariable => {
                let key = self.key_argument(&args[0])?;
                KnowledgeRecord::from(self.guard.delete_variable(&key))
            }
            SystemCall::Evaluate => {
                let source = self.eval(&args[0])?.to_string();
                let expression = super::compile_locked(self.guard, &source, true)?;
                self.enter()?;
                let result = self.eval(expression.root());
                self.depth -= 1;
                result?
            }
            SystemCall::Expand => {
                let text = self.eval(&args[0])?.to_string();
                KnowledgeRecord::from(self.guard.expand_statement(&text))
            }
            SystemCall::GetClock => match args.first() {
                Some(arg) => {
                    let key = self.key_argument(arg)?;
                    KnowledgeRecord::from(clock_value(self.guard.key_clock(&key)))
                }
                None => KnowledgeRecord::from(clock_value(self.guard.clock())),
            },
            SystemCall::SetClock => {
                if let [target, value] = args {
                    let key = self.key_argument(target)?;
                    let clock = non_negative_clock(&self.eval(value)?);
                    KnowledgeRecord::from(clock_value(self.guard.set_key_clock(&key, clock)))
                } else {
                    let clock = non_negative_clock(&self.eval(&args[0])?);
                    KnowledgeRecord::from(clock_value(self.guard.set_clock(clock)))
                }
            }
            SystemCall::GetTime => KnowledgeRecord::from(Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)),
            SystemCall::GetTimeSeconds => KnowledgeRecord::from(Utc::now().timestamp()),
            SystemCall::Print => {
                let text = self.eval(&args[0])?.to_string();
                let text = self.guard.expand_statement(&text);
                info!(target: "karl::print", "{text}");
                KnowledgeRecord::from(0i64)
            }
            SystemCall::RandDouble => {
                let (lo, hi) = self.bounds(args, 0.0, 1.0, KnowledgeRecord::to_double)?;
                let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
                let v = if lo < hi {
                    rand::thread_rng().gen_range(lo..hi)
                } else {
                    lo
                };
                KnowledgeRecord::from(v)
            }
            SystemCall::RandInt => {
                let (lo, hi) = self.bounds(args, 0, i64::from(i32::MAX), KnowledgeRecord::to_integer)?;
                let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
                KnowledgeRecord::from(rand::thread_rng().gen_range(lo..=hi))
            }
            SystemCall::Sleep => {
                let seconds = self.eval(&args[0])?.to_double();
                if seconds > 0.0 {
                    match Duration::try_from_secs_f64(seconds) {
                        Ok(pause) => self.guard.unlocked(|| std::thread::sleep(pause)),
                        Err(_) => warn!(seconds, "#sleep duration out of range, not sleeping"),
                    }
                }
                KnowledgeRecord::from(seconds)
            }
            _ => KnowledgeRecord::uncreated(),
        };
        Ok(record)
    }

    fn bounds<T>(
        &mut self,
        args: &[Node],
        default_lo: T,
        default_hi: T,
        convert: fn(&KnowledgeRecord) -> T,
    ) -> Result<(T, T), EvalError> {
        let lo = match args.first() {
            Some(arg) => convert(&self.eval(arg)?),
            None => default_lo,
        };
        let hi = match args.get(1) {
            Some(arg) => convert(&self.eval(arg)?),
            None => default_hi,
        };
        Ok((lo, hi))
    }
}

fn clock_value(clock: u64) -> i64 {
    i64::try_from(clock).unwrap_or(i64::MAX)
}

fn non_negative_clock(record: &KnowledgeRecord) -> u64 {
    u64::try_from(record.to_integer()).unwrap_or(0)
}
