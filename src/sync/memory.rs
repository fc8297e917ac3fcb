//! In-process transport.
//!
//! An [`InMemoryBus`] fans every published frame out to every subscribed
//! transport through bounded channels. Frames go through the same wire
//! encoding and inbound processing as a network transport would use, so
//! the bus doubles as the reference transport for tests and benchmarks.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::context::ThreadSafeContext;
use crate::error::{KarlError, KarlResult, TransportError};
use crate::karl::CompiledExpression;
use crate::record::KnowledgeRecord;

use super::merge::{MergeStats, MergeStatsSnapshot};
use super::message::UpdateMessage;
use super::transport::{process_message, Transport, TransportSettings};

type Frame = Arc<Vec<u8>>;

/// Broadcast medium shared by in-memory transports.
#[derive(Debug)]
pub struct InMemoryBus {
    capacity: usize,
    subscribers: Mutex<Vec<(String, Sender<Frame>)>>,
    dropped: AtomicU64,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InMemoryBus {
    /// Creates a bus whose subscribers buffer up to `capacity` frames.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
        }
    }

    pub(crate) fn subscribe(&self, id: &str) -> Receiver<Frame> {
        let (tx, rx) = bounded(self.capacity);
        self.subscribers.lock().push((id.to_string(), tx));
        rx
    }

    /// Removes every subscription registered under `id`.
    pub fn unsubscribe(&self, id: &str) {
        self.subscribers.lock().retain(|(sub, _)| sub != id);
    }

    /// Delivers `frame` to every subscriber without blocking. Returns the
    /// number of subscribers that accepted it.
    pub fn publish(&self, frame: &Frame) -> usize {
        let subscribers = self.subscribers.lock();
        let mut delivered = 0;
        for (id, tx) in subscribers.iter() {
            match tx.try_send(Arc::clone(frame)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(subscriber = %id, "bus queue full, frame dropped");
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        delivered
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Frames that could not be queued for a subscriber.
    #[must_use]
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// A [`Transport`] over an [`InMemoryBus`], with a dedicated reader thread
/// merging inbound frames into one context.
#[derive(Debug)]
pub struct InMemoryTransport {
    settings: TransportSettings,
    bus: Arc<InMemoryBus>,
    stats: Arc<MergeStats>,
    terminated: Arc<AtomicBool>,
    barrier: Arc<Barrier>,
    join: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

struct Reader {
    context: Arc<ThreadSafeContext>,
    settings: TransportSettings,
    on_data_received: Option<CompiledExpression>,
    bus: Arc<InMemoryBus>,
    rx: Receiver<Frame>,
    stats: Arc<MergeStats>,
    terminated: Arc<AtomicBool>,
    barrier: Arc<Barrier>,
}

impl InMemoryTransport {
    /// Subscribes to `bus` and starts the reader thread.
    ///
    /// `on_data_received_logic` is compiled against `context` up front; a
    /// compile error fails construction.
    pub fn new(bus: Arc<InMemoryBus>, context: Arc<ThreadSafeContext>, settings: TransportSettings) -> KarlResult<Self> {
        let on_data_received = settings
            .on_data_received_logic
            .as_deref()
            .map(|logic| context.compile(logic))
            .transpose()?;

        let stats = Arc::new(MergeStats::new());
        let terminated = Arc::new(AtomicBool::new(false));
        let barrier = Arc::new(Barrier::new(2));
        let rx = bus.subscribe(&settings.id);

        let reader = Reader {
            context,
            settings: settings.clone(),
            on_data_received,
            bus: Arc::clone(&bus),
            rx,
            stats: Arc::clone(&stats),
            terminated: Arc::clone(&terminated),
            barrier: Arc::clone(&barrier),
        };
        let join = thread::Builder::new()
            .name(format!("karl-read-{}", settings.id))
            .spawn(move || reader.run())
            .map_err(|e| {
                bus.unsubscribe(&settings.id);
                KarlError::internal(format!("failed to spawn transport reader: {e}"))
            })?;

        info!(id = %settings.id, domain = %settings.domain, "in-memory transport started");
        Ok(Self {
            settings,
            bus,
            stats,
            terminated,
            barrier,
            join: Mutex::new(Some(join)),
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub const fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Merge decisions made by the reader thread so far.
    #[must_use]
    pub fn stats(&self) -> MergeStatsSnapshot {
        self.stats.snapshot()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Transport for InMemoryTransport {
    fn id(&self) -> &str {
        &self.settings.id
    }

    fn send_data(&self, updates: &[(String, KnowledgeRecord)]) -> Result<usize, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Unavailable {
                id: self.settings.id.clone(),
            });
        }
        let message = UpdateMessage::new(
            &self.settings.id,
            &self.settings.domain,
            self.settings.rebroadcast_ttl,
            updates.to_vec(),
        );
        let frame = message.encode(self.settings.max_message_bytes)?;
        let bytes = frame.len();
        let delivered = self.bus.publish(&Arc::new(frame));
        debug!(id = %self.settings.id, updates = updates.len(), bytes, delivered, "updates sent");
        Ok(bytes)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.terminated.store(true, Ordering::Release);
        self.bus.unsubscribe(&self.settings.id);
        let handle = self.join.lock().take();
        if let Some(handle) = handle {
            self.barrier.wait();
            if handle.join().is_err() {
                warn!(id = %self.settings.id, "transport reader panicked");
            }
        }
        info!(id = %self.settings.id, "in-memory transport closed");
    }
}

impl Drop for InMemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Meets `close` at the barrier however the reader thread exits.
struct Rendezvous(Arc<Barrier>);

impl Drop for Rendezvous {
    fn drop(&mut self) {
        self.0.wait();
    }
}

impl Reader {
    fn run(self) {
        let _rendezvous = Rendezvous(Arc::clone(&self.barrier));
        debug!(id = %self.settings.id, "reader thread running");
        while !self.terminated.load(Ordering::Acquire) {
            match self.rx.recv_timeout(self.settings.read_timeout) {
                Ok(frame) => {
                    if panic::catch_unwind(AssertUnwindSafe(|| self.handle(&frame))).is_err() {
                        error!(id = %self.settings.id, "panic while handling frame, frame dropped");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!(id = %self.settings.id, "reader thread stopped");
    }

    fn handle(&self, frame: &[u8]) {
        let message = match UpdateMessage::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(id = %self.settings.id, error = %e, "undecodable frame dropped");
                return;
            }
        };
        let report = process_message(
            &self.context,
            &message,
            &self.settings,
            self.on_data_received.as_ref(),
            &self.stats,
        );
        if let Some(relay) = report.rebroadcast {
            match relay.encode(self.settings.max_message_bytes) {
                Ok(frame) => {
                    let delivered = self.bus.publish(&Arc::new(frame));
                    debug!(id = %self.settings.id, ttl = relay.ttl, delivered, "updates rebroadcast");
                }
                Err(e) => warn!(id = %self.settings.id, error = %e, "rebroadcast failed"),
            }
        }
    }
}
