//! Per-key merge of remote updates.
//!
//! Updates are ordered by key clock, with the writer's quality breaking
//! ties: a stored record is replaced unless it is newer, or equally new
//! and written at a higher quality. Applying the same update twice leaves
//! the same state, and a key's clock never moves backwards unless
//! `always_overwrite` is set.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::trace;

use crate::context::{is_local_key, ContextGuard, KnowledgeUpdateSettings};
use crate::record::{KnowledgeRecord, Status};

/// Where an incoming update came from, as judged by message-level checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOrigin {
    pub quality: u32,
    pub clock: u64,
    /// The message was published in this process's domain.
    pub domain_match: bool,
    /// The message was published by this process.
    pub self_origin: bool,
}

impl UpdateOrigin {
    /// A same-domain update from another peer.
    #[must_use]
    pub const fn peer(quality: u32, clock: u64) -> Self {
        Self {
            quality,
            clock,
            domain_match: true,
            self_origin: false,
        }
    }
}

#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOutcome {
    Accepted,
    /// The stored record has a higher clock.
    RejectedStale,
    /// Same clock, but the stored record was written at a higher quality.
    RejectedQuality,
    DroppedSelfOrigin,
    DroppedForeignDomain,
}

impl UpdateOutcome {
    #[must_use]
    pub const fn is_accepted(self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Merges `record` into `key` under the held lock.
///
/// On acceptance the value, clock and quality are overwritten, the record
/// is marked modified, the context clock is raised to at least the
/// incoming clock and waiters are woken. With `treat_globals_as_locals`
/// the key is not queued for sending.
pub fn apply_update(
    guard: &mut ContextGuard<'_>,
    key: &str,
    record: &KnowledgeRecord,
    origin: &UpdateOrigin,
    settings: &KnowledgeUpdateSettings,
) -> UpdateOutcome {
    if origin.self_origin {
        return UpdateOutcome::DroppedSelfOrigin;
    }
    if !origin.domain_match {
        return UpdateOutcome::DroppedForeignDomain;
    }

    let slot = guard.intern(key);
    let current = guard.record_mut(slot);
    if !settings.always_overwrite {
        if current.clock > origin.clock {
            trace!(key, local = current.clock, incoming = origin.clock, "stale update rejected");
            return UpdateOutcome::RejectedStale;
        }
        if current.clock == origin.clock && current.quality > origin.quality {
            trace!(key, local = current.quality, incoming = origin.quality, "lower quality update rejected");
            return UpdateOutcome::RejectedQuality;
        }
    }

    current.value = record.value.clone();
    current.clock = origin.clock;
    current.quality = origin.quality;
    current.status = Status::Modified;
    trace!(key, clock = origin.clock, quality = origin.quality, "update accepted");

    if !settings.treat_globals_as_locals && !is_local_key(key) {
        guard.queue_modified(slot);
    }
    guard.observe_clock(origin.clock);
    if settings.signal_changes {
        guard.signal();
    }
    UpdateOutcome::Accepted
}

impl KnowledgeRecord {
    /// Merges this record into `key` as a same-domain peer update.
    pub fn apply(
        &self,
        guard: &mut ContextGuard<'_>,
        key: &str,
        quality: u32,
        clock: u64,
        treat_as_local: bool,
    ) -> UpdateOutcome {
        let settings = KnowledgeUpdateSettings {
            treat_globals_as_locals: treat_as_local,
            ..KnowledgeUpdateSettings::default()
        };
        apply_update(guard, key, self, &UpdateOrigin::peer(quality, clock), &settings)
    }
}

/// Running totals of merge decisions.
#[derive(Debug, Default)]
pub struct MergeStats {
    accepted: AtomicU64,
    stale: AtomicU64,
    quality: AtomicU64,
    self_origin: AtomicU64,
    foreign_domain: AtomicU64,
    banned: AtomicU64,
    expired: AtomicU64,
}

/// Point-in-time copy of [`MergeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStatsSnapshot {
    pub accepted: u64,
    pub stale: u64,
    pub quality: u64,
    pub self_origin: u64,
    pub foreign_domain: u64,
    pub banned: u64,
    pub expired: u64,
}

impl MergeStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, outcome: UpdateOutcome) {
        let counter = match outcome {
            UpdateOutcome::Accepted => &self.accepted,
            UpdateOutcome::RejectedStale => &self.stale,
            UpdateOutcome::RejectedQuality => &self.quality,
            UpdateOutcome::DroppedSelfOrigin => &self.self_origin,
            UpdateOutcome::DroppedForeignDomain => &self.foreign_domain,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a message dropped because its sender is banned.
    pub fn record_banned(&self) {
        self.banned.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a message dropped because it arrived after its deadline.
    pub fn record_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MergeStatsSnapshot {
        MergeStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            quality: self.quality.load(Ordering::Relaxed),
            self_origin: self.self_origin.load(Ordering::Relaxed),
            foreign_domain: self.foreign_domain.load(Ordering::Relaxed),
            banned: self.banned.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }
}
