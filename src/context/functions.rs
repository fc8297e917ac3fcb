//! Function registry entries callable from KaRL.
//!
//! Every kind of function receives its evaluated arguments (also written
//! to the local pseudo-variables `.0`, `.1`, …) and a guard on the context
//! it is invoked from.

use std::fmt;
use std::sync::Arc;

use crate::context::ContextGuard;
use crate::error::EvalError;
use crate::karl::CompiledExpression;
use crate::record::KnowledgeRecord;

/// Signature of a native Rust callback.
///
/// Callbacks run while the context lock is held and must reach the context
/// only through the guard they are given. Calling a locking method on the
/// same [`ThreadSafeContext`](crate::ThreadSafeContext), for example through
/// a captured `Arc` or a `KnowledgeBase`, deadlocks.
pub type NativeFn = dyn Fn(&[KnowledgeRecord], &mut ContextGuard<'_>) -> KnowledgeRecord + Send + Sync;

/// Bridge to an embedded scripting interpreter.
pub trait ScriptCallback: Send + Sync {
    /// Name of the scripting runtime, used in diagnostics.
    fn runtime(&self) -> &str;

    /// Invokes the script function. The same locking rule as [`NativeFn`]
    /// applies.
    fn call(&self, args: &[KnowledgeRecord], context: &mut ContextGuard<'_>) -> Result<KnowledgeRecord, String>;
}

/// A registered function.
#[derive(Clone)]
pub enum Function {
    Native(Arc<NativeFn>),
    Script(Arc<dyn ScriptCallback>),
    Karl(Arc<CompiledExpression>),
}

impl Function {
    /// Wraps a native closure.
    pub fn native<F>(f: F) -> Self
    where
        F: Fn(&[KnowledgeRecord], &mut ContextGuard<'_>) -> KnowledgeRecord + Send + Sync + 'static,
    {
        Self::Native(Arc::new(f))
    }

    /// Short name of the function kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Native(_) => "native",
            Self::Script(_) => "script",
            Self::Karl(_) => "karl",
        }
    }

    /// Runs a native or script callback. KaRL bodies are evaluated by the
    /// caller, which owns the call-depth accounting.
    pub(crate) fn invoke_external(
        &self,
        name: &str,
        args: &[KnowledgeRecord],
        context: &mut ContextGuard<'_>,
    ) -> Option<Result<KnowledgeRecord, EvalError>> {
        match self {
            Self::Native(f) => Some(Ok(f(args, context))),
            Self::Script(cb) => Some(cb.call(args, context).map_err(|message| EvalError::FunctionFailed {
                name: name.to_string(),
                message: format!("{}: {message}", cb.runtime()),
            })),
            Self::Karl(_) => None,
        }
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native(_) => f.write_str("Function::Native"),
            Self::Script(cb) => write!(f, "Function::Script({})", cb.runtime()),
            Self::Karl(expr) => write!(f, "Function::Karl({:?})", expr.source()),
        }
    }
}
