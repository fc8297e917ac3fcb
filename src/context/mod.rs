//! Thread-safe knowledge context.
//!
//! The context maps keys to [`KnowledgeRecord`]s behind a single coarse
//! mutex. Every operation exists twice: on [`ThreadSafeContext`], which
//! acquires and releases the lock per call, and on [`ContextGuard`], which
//! holds the lock for as long as it lives so a sequence of operations sees
//! (and produces) one consistent snapshot of the whole table.
//!
//! Keys starting with `.` are local: they never advance the shared clock
//! and are never queued for sending.

mod expand;
mod functions;
mod settings;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::error::{CompileError, KarlError, KarlResult};
use crate::karl::{self, CompiledExpression};
use crate::record::{KnowledgeRecord, Status, MAX_ARRAY_LEN};

pub(crate) use expand::braces_balanced;
pub use functions::{Function, NativeFn, ScriptCallback};
pub use settings::{EvalSettings, KnowledgeUpdateSettings, WaitSettings};
pub(crate) use settings::{duration_ms, option_duration_ms};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// True for keys that never leave this process.
#[must_use]
pub fn is_local_key(key: &str) -> bool {
    key.starts_with('.')
}

/// Opaque handle to a variable slot.
///
/// Reading or writing through a reference skips the key lookup. A
/// reference stays valid for the lifetime of the context that issued it,
/// including across `delete_variable`; used against another context it
/// falls back to a lookup by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VariableReference {
    context_id: u64,
    slot: usize,
    name: Arc<str>,
}

impl VariableReference {
    /// Key this reference points at.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        is_local_key(&self.name)
    }
}

/// Result of a local write.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteStatus {
    Written,
    /// The key's write quality is above the caller's quality; nothing
    /// changed.
    InsufficientQuality,
    /// The key (after expansion) was empty; nothing changed.
    EmptyKey,
    /// An array index at or past [`MAX_ARRAY_LEN`]; nothing changed.
    IndexOutOfRange,
}

impl WriteStatus {
    #[must_use]
    pub const fn is_written(self) -> bool {
        matches!(self, Self::Written)
    }
}

#[derive(Debug)]
struct Slot {
    name: Arc<str>,
    record: KnowledgeRecord,
}

/// The mutable table guarded by the context lock.
#[derive(Debug, Default)]
pub struct ContextState {
    slots: Vec<Slot>,
    index: HashMap<Arc<str>, usize>,
    clock: u64,
    modifieds: BTreeMap<Arc<str>, usize>,
    functions: HashMap<String, Function>,
}

/// The knowledge table shared by evaluators and transports.
pub struct ThreadSafeContext {
    id: u64,
    state: Mutex<ContextState>,
    changed: Condvar,
}

impl fmt::Debug for ThreadSafeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadSafeContext").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Default for ThreadSafeContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadSafeContext {
    /// Creates an empty context with clock 0.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(ContextState::default()),
            changed: Condvar::new(),
        }
    }

    /// Process-unique id of this context.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Acquires the context lock until the guard is dropped.
    pub fn lock(&self) -> ContextGuard<'_> {
        ContextGuard {
            context: self,
            state: self.state.lock(),
        }
    }

    /// Acquires the context lock, giving up after `timeout`.
    pub fn try_lock_for(&self, timeout: Duration) -> Option<ContextGuard<'_>> {
        self.state.try_lock_for(timeout).map(|state| ContextGuard { context: self, state })
    }

    #[must_use]
    pub fn get(&self, key: &str) -> KnowledgeRecord {
        self.lock().get(key)
    }

    #[must_use]
    pub fn exists(&self, key: &str) -> bool {
        self.lock().exists(key)
    }

    pub fn set(
        &self,
        key: &str,
        value: impl Into<KnowledgeRecord>,
        settings: &KnowledgeUpdateSettings,
    ) -> WriteStatus {
        self.lock().set(key, value, settings)
    }

    pub fn set_with_quality(
        &self,
        key: &str,
        value: impl Into<KnowledgeRecord>,
        quality: u32,
        settings: &KnowledgeUpdateSettings,
    ) -> WriteStatus {
        self.lock().set_with_quality(key, value, quality, settings)
    }

    pub fn get_ref(&self, key: &str, settings: &KnowledgeUpdateSettings) -> Option<VariableReference> {
        self.lock().get_ref(key, settings)
    }

    #[must_use]
    pub fn get_by_ref(&self, reference: &VariableReference) -> KnowledgeRecord {
        self.lock().get_by_ref(reference)
    }

    pub fn set_by_ref(
        &self,
        reference: &VariableReference,
        value: impl Into<KnowledgeRecord>,
        settings: &KnowledgeUpdateSettings,
    ) -> WriteStatus {
        self.lock().set_by_ref(reference, value, settings)
    }

    pub fn set_index(
        &self,
        key: &str,
        index: usize,
        value: impl Into<KnowledgeRecord>,
        settings: &KnowledgeUpdateSettings,
    ) -> WriteStatus {
        self.lock().set_index(key, index, value, settings)
    }

    #[must_use]
    pub fn retrieve_index(&self, key: &str, index: usize) -> KnowledgeRecord {
        self.lock().retrieve_index(key, index)
    }

    pub fn set_quality(&self, key: &str, quality: u32) {
        self.lock().set_quality(key, quality);
    }

    pub fn delete_variable(&self, key: &str) -> bool {
        self.lock().delete_variable(key)
    }

    pub fn mark_modified(&self, key: &str) {
        self.lock().mark_modified(key);
    }

    #[must_use]
    pub fn clock(&self) -> u64 {
        self.lock().clock()
    }

    #[must_use]
    pub fn expand_statement(&self, statement: &str) -> String {
        self.lock().expand_statement(statement)
    }

    /// Wakes every thread blocked in a change wait.
    pub fn signal(&self) {
        self.changed.notify_all();
    }

    /// Blocks until a change is signalled or `timeout` passes. Returns
    /// false on timeout.
    pub fn wait_for_change(&self, timeout: Duration) -> bool {
        self.lock().wait_for_change_timeout(timeout)
    }

    /// Parses, binds and prunes `source` against this context.
    pub fn compile(&self, source: &str) -> Result<CompiledExpression, CompileError> {
        karl::compile(self, source)
    }

    /// Registers a native function under `name`.
    pub fn define_function<F>(&self, name: &str, f: F)
    where
        F: Fn(&[KnowledgeRecord], &mut ContextGuard<'_>) -> KnowledgeRecord + Send + Sync + 'static,
    {
        self.lock().define_function(name, Function::native(f));
    }

    /// Registers a scripting-runtime callback under `name`.
    pub fn define_script_function(&self, name: &str, callback: Arc<dyn ScriptCallback>) {
        self.lock().define_function(name, Function::Script(callback));
    }

    /// Compiles `source` and registers it as a KaRL function body.
    pub fn define_karl_function(&self, name: &str, source: &str) -> Result<(), CompileError> {
        let body = self.compile(source)?;
        self.lock().define_function(name, Function::Karl(Arc::new(body)));
        Ok(())
    }

    /// Snapshot of every existing variable.
    #[must_use]
    pub fn to_map(&self) -> BTreeMap<String, KnowledgeRecord> {
        self.lock().to_map()
    }

    /// Snapshot of every existing variable as a JSON object of values.
    pub fn to_json(&self) -> KarlResult<serde_json::Value> {
        let map = self.to_map();
        let mut out = serde_json::Map::with_capacity(map.len());
        for (key, record) in map {
            let value = serde_json::to_value(&record.value)
                .map_err(|e| KarlError::internal(format!("serialize '{key}': {e}")))?;
            out.insert(key, value);
        }
        Ok(serde_json::Value::Object(out))
    }
}

/// Scoped hold on the context lock.
pub struct ContextGuard<'a> {
    context: &'a ThreadSafeContext,
    state: MutexGuard<'a, ContextState>,
}

impl fmt::Debug for ContextGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextGuard")
            .field("context", &self.context.id)
            .field("clock", &self.state.clock)
            .field("variables", &self.state.slots.len())
            .finish()
    }
}

impl<'a> ContextGuard<'a> {
    fn lookup(&self, key: &str) -> Option<usize> {
        self.state.index.get(key).copied()
    }

    /// Slot for `key`, created (uncreated) if absent.
    pub(crate) fn intern(&mut self, key: &str) -> usize {
        if let Some(slot) = self.lookup(key) {
            return slot;
        }
        let name: Arc<str> = Arc::from(key);
        let slot = self.state.slots.len();
        self.state.slots.push(Slot {
            name: Arc::clone(&name),
            record: KnowledgeRecord::uncreated(),
        });
        self.state.index.insert(name, slot);
        slot
    }

    fn resolve(&mut self, reference: &VariableReference) -> usize {
        if reference.context_id == self.context.id && reference.slot < self.state.slots.len() {
            reference.slot
        } else {
            self.intern(&reference.name)
        }
    }

    fn prepare_key<'k>(&self, key: &'k str, settings: &KnowledgeUpdateSettings) -> std::borrow::Cow<'k, str> {
        if settings.expand_variables && key.contains('{') {
            std::borrow::Cow::Owned(self.expand_key(key))
        } else {
            std::borrow::Cow::Borrowed(key)
        }
    }

    /// Record stored under `key`; uncreated when absent.
    #[must_use]
    pub fn get(&self, key: &str) -> KnowledgeRecord {
        self.lookup(key)
            .map_or_else(KnowledgeRecord::uncreated, |slot| self.state.slots[slot].record.clone())
    }

    #[must_use]
    pub fn exists(&self, key: &str) -> bool {
        self.lookup(key).is_some_and(|slot| self.state.slots[slot].record.exists())
    }

    /// Handle for repeated access to `key`, creating the slot if needed.
    /// `None` when the key is empty.
    pub fn get_ref(&mut self, key: &str, settings: &KnowledgeUpdateSettings) -> Option<VariableReference> {
        let key = self.prepare_key(key, settings).into_owned();
        if key.is_empty() {
            return None;
        }
        let slot = self.intern(&key);
        Some(VariableReference {
            context_id: self.context.id,
            slot,
            name: Arc::clone(&self.state.slots[slot].name),
        })
    }

    #[must_use]
    pub fn get_by_ref(&self, reference: &VariableReference) -> KnowledgeRecord {
        self.record_by_ref(reference)
            .cloned()
            .unwrap_or_else(|| self.get(&reference.name))
    }

    /// Borrowed record behind a reference issued by this context.
    pub(crate) fn record_by_ref(&self, reference: &VariableReference) -> Option<&KnowledgeRecord> {
        if reference.context_id == self.context.id {
            self.state.slots.get(reference.slot).map(|s| &s.record)
        } else {
            None
        }
    }

    /// Applies a local write to `slot` with full clock/modified bookkeeping.
    fn write_slot(
        &mut self,
        slot: usize,
        quality: Option<u32>,
        settings: &KnowledgeUpdateSettings,
        mutate: impl FnOnce(&mut KnowledgeRecord),
    ) -> WriteStatus {
        let state = &mut *self.state;
        let entry = &mut state.slots[slot];
        if let Some(q) = quality {
            if entry.record.write_quality > q {
                trace!(key = %entry.name, write_quality = entry.record.write_quality, quality = q, "write rejected");
                return WriteStatus::InsufficientQuality;
            }
        }

        mutate(&mut entry.record);
        entry.record.quality = quality.unwrap_or(entry.record.write_quality);

        let global = !is_local_key(&entry.name) && !settings.treat_globals_as_locals;
        if global {
            state.clock = state.clock.saturating_add(settings.clock_increment);
        }
        entry.record.clock = state.clock;
        if global {
            entry.record.status = Status::Modified;
            state.modifieds.insert(Arc::clone(&entry.name), slot);
        }

        if settings.signal_changes {
            self.context.changed.notify_all();
        }
        WriteStatus::Written
    }

    fn write_key(
        &mut self,
        key: &str,
        quality: Option<u32>,
        settings: &KnowledgeUpdateSettings,
        mutate: impl FnOnce(&mut KnowledgeRecord),
    ) -> WriteStatus {
        let key = self.prepare_key(key, settings).into_owned();
        if key.is_empty() {
            return WriteStatus::EmptyKey;
        }
        let slot = self.intern(&key);
        self.write_slot(slot, quality, settings, mutate)
    }

    /// Stores `value` under `key` (creating it if absent).
    pub fn set(
        &mut self,
        key: &str,
        value: impl Into<KnowledgeRecord>,
        settings: &KnowledgeUpdateSettings,
    ) -> WriteStatus {
        let value = value.into().value;
        self.write_key(key, None, settings, |r| r.value = value)
    }

    /// Stores `value` only if the key's write quality does not exceed
    /// `quality`.
    pub fn set_with_quality(
        &mut self,
        key: &str,
        value: impl Into<KnowledgeRecord>,
        quality: u32,
        settings: &KnowledgeUpdateSettings,
    ) -> WriteStatus {
        let value = value.into().value;
        self.write_key(key, Some(quality), settings, |r| r.value = value)
    }

    pub fn set_by_ref(
        &mut self,
        reference: &VariableReference,
        value: impl Into<KnowledgeRecord>,
        settings: &KnowledgeUpdateSettings,
    ) -> WriteStatus {
        let value = value.into().value;
        let slot = self.resolve(reference);
        self.write_slot(slot, None, settings, |r| r.value = value)
    }

    /// Writes array element `index` of `key`, growing the array.
    pub fn set_index(
        &mut self,
        key: &str,
        index: usize,
        value: impl Into<KnowledgeRecord>,
        settings: &KnowledgeUpdateSettings,
    ) -> WriteStatus {
        if index >= MAX_ARRAY_LEN {
            debug!(key, index, "array index past limit, write ignored");
            return WriteStatus::IndexOutOfRange;
        }
        let element = value.into();
        self.write_key(key, None, settings, |r| {
            r.set_index(index, &element);
        })
    }

    pub fn set_index_by_ref(
        &mut self,
        reference: &VariableReference,
        index: usize,
        value: impl Into<KnowledgeRecord>,
        settings: &KnowledgeUpdateSettings,
    ) -> WriteStatus {
        if index >= MAX_ARRAY_LEN {
            debug!(key = %reference.name, index, "array index past limit, write ignored");
            return WriteStatus::IndexOutOfRange;
        }
        let element = value.into();
        let slot = self.resolve(reference);
        self.write_slot(slot, None, settings, |r| {
            r.set_index(index, &element);
        })
    }

    #[must_use]
    pub fn retrieve_index(&self, key: &str, index: usize) -> KnowledgeRecord {
        self.lookup(key)
            .map_or_else(KnowledgeRecord::uncreated, |slot| self.state.slots[slot].record.retrieve_index(index))
    }

    /// Sets the quality this process writes `key` with.
    pub fn set_quality(&mut self, key: &str, quality: u32) {
        let slot = self.intern(key);
        self.state.slots[slot].record.write_quality = quality;
    }

    /// Quality of the writer that produced the current value of `key`.
    #[must_use]
    pub fn get_quality(&self, key: &str) -> u32 {
        self.lookup(key).map_or(0, |slot| self.state.slots[slot].record.quality)
    }

    /// Resets `key` to uncreated. Returns whether it held a value.
    pub fn delete_variable(&mut self, key: &str) -> bool {
        let Some(slot) = self.lookup(key) else {
            return false;
        };
        let state = &mut *self.state;
        let entry = &mut state.slots[slot];
        let existed = entry.record.exists();
        entry.record = KnowledgeRecord::uncreated();
        state.modifieds.remove(key);
        existed
    }

    /// Queues `key` for the next send without changing its value.
    pub fn mark_modified(&mut self, key: &str) {
        if let Some(slot) = self.lookup(key) {
            self.queue_modified(slot);
        }
    }

    pub fn mark_modified_by_ref(&mut self, reference: &VariableReference) {
        let slot = self.resolve(reference);
        self.queue_modified(slot);
    }

    pub(crate) fn queue_modified(&mut self, slot: usize) {
        let state = &mut *self.state;
        let entry = &mut state.slots[slot];
        entry.record.status = Status::Modified;
        if !is_local_key(&entry.name) {
            state.modifieds.insert(Arc::clone(&entry.name), slot);
        }
    }

    /// Queued keys and their current records.
    #[must_use]
    pub fn modifieds(&self) -> Vec<(String, KnowledgeRecord)> {
        self.state
            .modifieds
            .iter()
            .map(|(name, slot)| (name.to_string(), self.state.slots[*slot].record.clone()))
            .collect()
    }

    /// Drains the queue, marking each record unmodified.
    pub fn take_modifieds(&mut self) -> Vec<(String, KnowledgeRecord)> {
        let state = &mut *self.state;
        let queued = std::mem::take(&mut state.modifieds);
        queued
            .into_iter()
            .map(|(name, slot)| {
                let record = &mut state.slots[slot].record;
                record.status = Status::Unmodified;
                (name.to_string(), record.clone())
            })
            .collect()
    }

    /// Empties the queue without sending.
    pub fn reset_modified(&mut self) {
        let state = &mut *self.state;
        for slot in std::mem::take(&mut state.modifieds).into_values() {
            state.slots[slot].record.status = Status::Unmodified;
        }
    }

    #[must_use]
    pub fn clock(&self) -> u64 {
        self.state.clock
    }

    /// Forces the context clock to `clock`.
    pub fn set_clock(&mut self, clock: u64) -> u64 {
        self.state.clock = clock;
        clock
    }

    /// Advances the context clock by one and returns it.
    pub fn inc_clock(&mut self) -> u64 {
        self.state.clock = self.state.clock.saturating_add(1);
        self.state.clock
    }

    /// Raises the context clock to at least `clock`.
    pub(crate) fn observe_clock(&mut self, clock: u64) {
        if clock > self.state.clock {
            self.state.clock = clock;
        }
    }

    /// Clock of the last write to `key`.
    #[must_use]
    pub fn key_clock(&self, key: &str) -> u64 {
        self.lookup(key).map_or(0, |slot| self.state.slots[slot].record.clock)
    }

    /// Overrides the clock of `key`. Returns the new key clock.
    pub fn set_key_clock(&mut self, key: &str, clock: u64) -> u64 {
        let slot = self.intern(key);
        self.state.slots[slot].record.clock = clock;
        clock
    }

    pub(crate) fn record_mut(&mut self, slot: usize) -> &mut KnowledgeRecord {
        &mut self.state.slots[slot].record
    }

    /// Applies `{var}` substitution to a key name.
    #[must_use]
    pub fn expand_key(&self, key: &str) -> String {
        expand::expand(key, |name| self.get(name).to_string())
    }

    /// Applies `{var}` substitution to free text.
    #[must_use]
    pub fn expand_statement(&self, statement: &str) -> String {
        self.expand_key(statement)
    }

    /// Wakes every thread blocked in a change wait.
    pub fn signal(&self) {
        self.context.changed.notify_all();
    }

    /// Runs `f` with the lock released, reacquiring it afterwards.
    pub fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        MutexGuard::unlocked(&mut self.state, f)
    }

    /// Compiles `source` under the held lock.
    pub fn compile(&mut self, source: &str) -> Result<CompiledExpression, CompileError> {
        karl::compile_locked(self, source, true)
    }

    /// Releases the lock until a change is signalled, then reacquires it.
    pub fn wait_for_change(&mut self) {
        self.context.changed.wait(&mut self.state);
    }

    /// Like [`Self::wait_for_change`] but gives up after `timeout`. Returns
    /// false on timeout.
    pub fn wait_for_change_timeout(&mut self, timeout: Duration) -> bool {
        !self.context.changed.wait_for(&mut self.state, timeout).timed_out()
    }

    #[must_use]
    pub fn function(&self, name: &str) -> Option<Function> {
        self.state.functions.get(name).cloned()
    }

    pub fn define_function(&mut self, name: &str, function: Function) {
        self.state.functions.insert(name.to_string(), function);
    }

    /// Every existing variable, ordered by key.
    #[must_use]
    pub fn to_map(&self) -> BTreeMap<String, KnowledgeRecord> {
        self.state
            .slots
            .iter()
            .filter(|s| s.record.exists())
            .map(|s| (s.name.to_string(), s.record.clone()))
            .collect()
    }

    /// Existing variables whose key starts with `prefix`.
    #[must_use]
    pub fn to_map_prefix(&self, prefix: &str) -> BTreeMap<String, KnowledgeRecord> {
        self.state
            .slots
            .iter()
            .filter(|s| s.record.exists() && s.name.starts_with(prefix))
            .map(|s| (s.name.to_string(), s.record.clone()))
            .collect()
    }

    /// Keys of every existing variable, ordered.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.to_map().into_keys().collect()
    }

    /// Resets every variable to uncreated. The clock is kept.
    pub fn clear(&mut self) {
        let state = &mut *self.state;
        for slot in &mut state.slots {
            slot.record = KnowledgeRecord::uncreated();
        }
        state.modifieds.clear();
    }
}
