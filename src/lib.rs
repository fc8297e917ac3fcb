//! # KaRL - Knowledge and Reasoning Language
//!
//! KaRL is distributed shared-knowledge middleware. Each process holds a
//! [`ThreadSafeContext`]: a table of named [`KnowledgeRecord`]s stamped with
//! a Lamport clock and a writer quality. Logic is written in the KaRL
//! expression language, compiled once against a context and evaluated any
//! number of times. Modified globals are published to peers, and incoming
//! updates are merged per key by clock with quality as the tiebreak.
//!
//! ## Usage
//!
//! ```rust
//! use karl::{EvalSettings, KnowledgeBase};
//!
//! let kb = KnowledgeBase::default();
//! kb.evaluate_str("x = 3 + 4; y = x * 2", &EvalSettings::default())?;
//! assert_eq!(kb.get("y").to_integer(), 14);
//! # Ok::<(), karl::KarlError>(())
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod context;
pub mod error;
pub mod karl;
pub mod knowledge_base;
pub mod record;
pub mod sync;

pub use context::{
    ContextGuard, EvalSettings, Function, KnowledgeUpdateSettings, ScriptCallback, ThreadSafeContext,
    VariableReference, WaitSettings, WriteStatus,
};
pub use error::{CompileError, CompileErrorKind, EvalError, KarlError, KarlResult, TransportError};
pub use karl::{compile, compile_unpruned, CompiledExpression, Node, SystemCall};
pub use knowledge_base::{KnowledgeBase, KnowledgeBaseConfig, WaitOutcome};
pub use record::{FileKind, KnowledgeRecord, RecordKind, Status, Value, MAX_ARRAY_LEN};
pub use sync::{
    apply_update, process_message, InMemoryBus, InMemoryTransport, MergeStats, Transport, TransportSettings,
    UpdateMessage, UpdateOrigin, UpdateOutcome,
};
