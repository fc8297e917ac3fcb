//! KaRL: the knowledge and reasoning language.
//!
//! Source is tokenized, parsed into a [`Node`] tree whose variables are
//! bound to slots of one context, pruned, and then evaluated any number of
//! times against that context.

pub mod ast;
mod eval;
mod lexer;
mod parser;
mod prune;
mod system_calls;

use tracing::info;

use crate::context::{ContextGuard, EvalSettings, ThreadSafeContext};
use crate::error::{CompileError, EvalError};
use crate::record::KnowledgeRecord;

pub use ast::Node;
pub use prune::prune;
pub use system_calls::SystemCall;

use eval::Evaluator;
use parser::Parser;

/// Bound on nested KaRL function calls and `#evaluate` recursion.
pub const MAX_CALL_DEPTH: usize = 64;

/// Bound on the height of a compiled tree and on the parser's own nesting.
pub const MAX_NESTING_DEPTH: usize = 128;

/// A parsed expression bound to the context it was compiled against.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledExpression {
    source: String,
    root: Node,
}

impl CompiledExpression {
    /// The text this expression was compiled from.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub const fn root(&self) -> &Node {
        &self.root
    }

    #[must_use]
    pub fn into_root(self) -> Node {
        self.root
    }

    /// Evaluates under a single acquisition of the context lock.
    pub fn evaluate(&self, context: &ThreadSafeContext, settings: &EvalSettings) -> Result<KnowledgeRecord, EvalError> {
        let mut guard = context.lock();
        self.evaluate_locked(&mut guard, settings)
    }

    /// Evaluates under a lock the caller already holds.
    pub fn evaluate_locked(
        &self,
        guard: &mut ContextGuard<'_>,
        settings: &EvalSettings,
    ) -> Result<KnowledgeRecord, EvalError> {
        if let Some(statement) = &settings.pre_print_statement {
            info!(target: "karl::print", "{}", guard.expand_statement(statement));
        }
        let result = Evaluator::new(guard, &settings.update).eval(&self.root)?;
        if let Some(statement) = &settings.post_print_statement {
            info!(target: "karl::print", "{}", guard.expand_statement(statement));
        }
        Ok(result)
    }
}

/// Parses, binds and prunes `source` against `context`.
pub fn compile(context: &ThreadSafeContext, source: &str) -> Result<CompiledExpression, CompileError> {
    compile_locked(&mut context.lock(), source, true)
}

/// Parses and binds `source` without constant folding.
pub fn compile_unpruned(context: &ThreadSafeContext, source: &str) -> Result<CompiledExpression, CompileError> {
    compile_locked(&mut context.lock(), source, false)
}

pub(crate) fn compile_locked(
    guard: &mut ContextGuard<'_>,
    source: &str,
    prune_tree: bool,
) -> Result<CompiledExpression, CompileError> {
    let mut root = Parser::new(source, guard)?.parse_program()?;
    if prune_tree {
        prune(&mut root);
    }
    Ok(CompiledExpression {
        source: source.to_string(),
        root,
    })
}
