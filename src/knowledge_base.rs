//! Knowledge base facade.
//!
//! [`KnowledgeBase`] ties one [`ThreadSafeContext`] to its transports:
//! every `set` or `evaluate` that modifies globals ends by handing the
//! queued modifications to each attached transport, unless the call asked
//! for delayed sending.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::context::{
    ContextGuard, EvalSettings, KnowledgeUpdateSettings, ThreadSafeContext, WaitSettings, WriteStatus,
};
use crate::error::{KarlError, KarlResult};
use crate::karl::CompiledExpression;
use crate::record::KnowledgeRecord;
use crate::sync::{InMemoryBus, InMemoryTransport, Transport, TransportSettings};

/// Construction-time configuration for a [`KnowledgeBase`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeBaseConfig {
    /// Identifier of this knowledge base; also the default transport id.
    pub id: String,
    /// Settings for transports created by the knowledge base itself.
    pub transport: Option<TransportSettings>,
}

impl Default for KnowledgeBaseConfig {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            transport: None,
        }
    }
}

impl KnowledgeBaseConfig {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            transport: None,
        }
    }

    /// Loads a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> KarlResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| KarlError::config(format!("read {}: {e}", path.display())))?;
        Self::from_json_str(&text).map_err(|e| KarlError::config(format!("{}: {e}", path.display())))
    }

    pub fn from_json_str(text: &str) -> KarlResult<Self> {
        serde_json::from_str(text).map_err(|e| KarlError::config(format!("invalid configuration: {e}")))
    }

    /// Transport settings to use. Without explicit settings the transport
    /// takes this config's id in the default domain.
    #[must_use]
    pub fn transport_settings(&self) -> TransportSettings {
        self.transport.clone().unwrap_or_else(|| TransportSettings {
            id: self.id.clone(),
            ..TransportSettings::default()
        })
    }
}

/// Result of [`KnowledgeBase::wait`].
#[derive(Debug, Clone, PartialEq)]
pub struct WaitOutcome {
    /// Value of the last evaluation.
    pub value: KnowledgeRecord,
    /// Whether the expression evaluated true before the wait ended.
    pub satisfied: bool,
    pub elapsed: Duration,
}

/// A context plus the transports that publish its modifications.
pub struct KnowledgeBase {
    id: String,
    config: KnowledgeBaseConfig,
    context: Arc<ThreadSafeContext>,
    transports: RwLock<Vec<Arc<dyn Transport>>>,
}

impl std::fmt::Debug for KnowledgeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeBase")
            .field("id", &self.id)
            .field("transports", &self.transports.read().len())
            .finish_non_exhaustive()
    }
}

impl Default for KnowledgeBase {
    fn default() -> Self {
        Self::new(KnowledgeBaseConfig::default())
    }
}

impl KnowledgeBase {
    /// Creates a knowledge base with an empty context and no transports.
    #[must_use]
    pub fn new(config: KnowledgeBaseConfig) -> Self {
        info!(id = %config.id, "knowledge base created");
        Self {
            id: config.id.clone(),
            config,
            context: Arc::new(ThreadSafeContext::new()),
            transports: RwLock::new(Vec::new()),
        }
    }

    /// Creates a knowledge base attached to `bus` through an
    /// [`InMemoryTransport`] built from `config`.
    pub fn with_bus(config: KnowledgeBaseConfig, bus: Arc<InMemoryBus>) -> KarlResult<Self> {
        let kb = Self::new(config);
        let transport = InMemoryTransport::new(bus, Arc::clone(&kb.context), kb.config.transport_settings())?;
        kb.attach_transport(Arc::new(transport));
        Ok(kb)
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn context(&self) -> Arc<ThreadSafeContext> {
        Arc::clone(&self.context)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> KnowledgeRecord {
        self.context.get(key)
    }

    /// Writes `key` with default settings and sends the modification.
    pub fn set(&self, key: &str, value: impl Into<KnowledgeRecord>) -> WriteStatus {
        self.set_with_settings(key, value, &KnowledgeUpdateSettings::default())
    }

    pub fn set_with_settings(
        &self,
        key: &str,
        value: impl Into<KnowledgeRecord>,
        settings: &KnowledgeUpdateSettings,
    ) -> WriteStatus {
        let status = self.context.set(key, value, settings);
        if status.is_written() && !settings.delay_sending_modifieds {
            self.send_modifieds();
        }
        status
    }

    pub fn compile(&self, source: &str) -> KarlResult<CompiledExpression> {
        Ok(self.context.compile(source)?)
    }

    /// Evaluates `expression`, then sends modified globals unless
    /// `settings` delays sending.
    pub fn evaluate(&self, expression: &CompiledExpression, settings: &EvalSettings) -> KarlResult<KnowledgeRecord> {
        let result = expression.evaluate(&self.context, settings)?;
        if !settings.update.delay_sending_modifieds {
            self.send_modifieds();
        }
        Ok(result)
    }

    /// Compiles and evaluates `source` once.
    pub fn evaluate_str(&self, source: &str, settings: &EvalSettings) -> KarlResult<KnowledgeRecord> {
        let expression = self.compile(source)?;
        self.evaluate(&expression, settings)
    }

    /// Registers a native function callable from KaRL.
    pub fn define_function<F>(&self, name: &str, f: F)
    where
        F: Fn(&[KnowledgeRecord], &mut ContextGuard<'_>) -> KnowledgeRecord + Send + Sync + 'static,
    {
        self.context.define_function(name, f);
    }

    /// Hands every queued modification to every transport. Returns the
    /// number of updates drained from the queue.
    ///
    /// With no transports attached the queue is left untouched, so the
    /// modifications go out once a transport is attached.
    pub fn send_modifieds(&self) -> usize {
        let transports = self.transports.read();
        if transports.is_empty() {
            return 0;
        }
        let updates = self.context.lock().take_modifieds();
        if updates.is_empty() {
            return 0;
        }
        for transport in transports.iter() {
            match transport.send_data(&updates) {
                Ok(bytes) => debug!(transport = transport.id(), updates = updates.len(), bytes, "modifieds sent"),
                Err(e) => warn!(transport = transport.id(), error = %e, "failed to send modifieds"),
            }
        }
        updates.len()
    }

    /// Logs the expanded `statement` on the `karl::print` target.
    pub fn print(&self, statement: &str) {
        info!(target: "karl::print", "{}", self.context.expand_statement(statement));
    }

    /// Logs every variable on the `karl::print` target, one per line.
    pub fn print_knowledge(&self) {
        for (key, record) in self.context.to_map() {
            info!(target: "karl::print", "{key}={record}");
        }
    }

    #[must_use]
    pub fn expand_statement(&self, statement: &str) -> String {
        self.context.expand_statement(statement)
    }

    /// Starts publishing this knowledge base's modifications on `transport`.
    pub fn attach_transport(&self, transport: Arc<dyn Transport>) {
        info!(id = %self.id, transport = transport.id(), "transport attached");
        self.transports.write().push(transport);
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.transports.read().len()
    }

    /// Closes and detaches every transport.
    pub fn close(&self) {
        let transports = std::mem::take(&mut *self.transports.write());
        for transport in &transports {
            transport.close();
        }
        if !transports.is_empty() {
            info!(id = %self.id, count = transports.len(), "transports closed");
        }
    }

    /// Evaluates `expression` until it is true or `max_wait_time` passes.
    ///
    /// Each evaluation runs under the context lock. Between evaluations the
    /// lock is released while waiting for a change signal, at most
    /// `poll_frequency` at a time, so updates from other threads or peers
    /// are seen as soon as they land.
    pub fn wait(&self, expression: &CompiledExpression, settings: &WaitSettings) -> KarlResult<WaitOutcome> {
        let start = Instant::now();
        let deadline = settings.max_wait_time.map(|max| start + max);
        let mut guard = self.context.lock();
        loop {
            let value = expression.evaluate_locked(&mut guard, &settings.eval)?;
            let satisfied = value.is_true();
            let now = Instant::now();
            let expired = deadline.is_some_and(|d| now >= d);
            if satisfied || expired {
                drop(guard);
                if !settings.eval.update.delay_sending_modifieds {
                    self.send_modifieds();
                }
                debug!(satisfied, elapsed_ms = start.elapsed().as_millis(), "wait finished");
                return Ok(WaitOutcome {
                    value,
                    satisfied,
                    elapsed: start.elapsed(),
                });
            }
            let pause = deadline.map_or(settings.poll_frequency, |d| settings.poll_frequency.min(d - now));
            guard.wait_for_change_timeout(pause);
        }
    }

    /// Compiles `source` and waits on it.
    pub fn wait_str(&self, source: &str, settings: &WaitSettings) -> KarlResult<WaitOutcome> {
        let expression = self.compile(source)?;
        self.wait(&expression, settings)
    }
}

impl Drop for KnowledgeBase {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use crate::error::TransportError;

    #[derive(Default)]
    struct Recording {
        sent: parking_lot::Mutex<Vec<Vec<(String, KnowledgeRecord)>>>,
        closed: std::sync::atomic::AtomicBool,
    }

    impl Transport for Recording {
        fn id(&self) -> &str {
            "recording"
        }

        fn send_data(&self, updates: &[(String, KnowledgeRecord)]) -> Result<usize, TransportError> {
            self.sent.lock().push(updates.to_vec());
            Ok(updates.len())
        }

        fn close(&self) {
            self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn with_recorder() -> (KnowledgeBase, Arc<Recording>) {
        let kb = KnowledgeBase::new(KnowledgeBaseConfig::new("kb"));
        let recorder = Arc::new(Recording::default());
        kb.attach_transport(Arc::clone(&recorder) as Arc<dyn Transport>);
        (kb, recorder)
    }

    #[test]
    fn test_config_from_json() {
        let config = KnowledgeBaseConfig::from_json_str(r#"{"id": "agent.0", "transport": {"domain": "ops"}}"#).unwrap();
        assert_eq!(config.id, "agent.0");
        assert_eq!(config.transport_settings().domain, "ops");
        assert!(KnowledgeBaseConfig::from_json_str("{").unwrap_err().to_string().contains("Configuration"));
    }

    #[test]
    fn test_config_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kb.json");
        std::fs::write(&path, r#"{"id": "agent.7", "transport": {"id": "agent.7", "participant_ttl": 3}}"#).unwrap();
        let config = KnowledgeBaseConfig::from_json_file(&path).unwrap();
        assert_eq!(config.id, "agent.7");
        assert_eq!(config.transport_settings().participant_ttl, 3);

        let missing = KnowledgeBaseConfig::from_json_file(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(missing, KarlError::Config { .. }));
    }

    #[test]
    fn test_transport_settings_default_to_kb_id() {
        let config = KnowledgeBaseConfig::new("agent.3");
        let settings = config.transport_settings();
        assert_eq!(settings.id, "agent.3");
        assert_eq!(settings.domain, "karl");
    }

    #[test]
    fn test_set_sends_globals_only() {
        let (kb, recorder) = with_recorder();
        let _ = kb.set("x", 1i64);
        let _ = kb.set(".local", 2i64);
        let sent = recorder.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][0].0, "x");
    }

    #[test]
    fn test_delayed_sending_waits_for_send_modifieds() {
        let (kb, recorder) = with_recorder();
        let _ = kb.set_with_settings("a", 1i64, &KnowledgeUpdateSettings::delayed());
        kb.evaluate_str("b = 2", &EvalSettings::delayed()).unwrap();
        assert!(recorder.sent.lock().is_empty());
        assert_eq!(kb.send_modifieds(), 2);
        assert_eq!(recorder.sent.lock()[0].len(), 2);
        assert_eq!(kb.send_modifieds(), 0);
    }

    #[test]
    fn test_evaluate_str_scenario() {
        let kb = KnowledgeBase::default();
        kb.evaluate_str("x = 3 + 4; y = x * 2", &EvalSettings::default()).unwrap();
        assert_eq!(kb.get("y").to_integer(), 14);
        assert_eq!(kb.expand_statement("y is {y}"), "y is 14");
    }

    #[test]
    fn test_close_detaches_transports() {
        let (kb, recorder) = with_recorder();
        kb.close();
        assert!(recorder.closed.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(kb.transport_count(), 0);
    }

    #[test]
    fn test_wait_times_out_unsatisfied() {
        let kb = KnowledgeBase::default();
        let outcome = kb
            .wait_str("x > 5", &WaitSettings::with_timeout(Duration::from_millis(30)))
            .unwrap();
        assert!(!outcome.satisfied);
        assert!(outcome.elapsed >= Duration::from_millis(30));
    }

    #[test]
    fn test_wait_wakes_on_write() {
        let kb = Arc::new(KnowledgeBase::default());
        let writer = Arc::clone(&kb);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let _ = writer.set("x", 6i64);
        });
        let settings = WaitSettings {
            poll_frequency: Duration::from_secs(5),
            ..WaitSettings::with_timeout(Duration::from_secs(10))
        };
        let outcome = kb.wait_str("x > 5", &settings).unwrap();
        handle.join().unwrap();
        assert!(outcome.satisfied);
        assert!(outcome.elapsed < Duration::from_secs(5));
    }
}
