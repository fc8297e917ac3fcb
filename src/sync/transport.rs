//! Transport abstraction and inbound message processing.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context::{duration_ms, option_duration_ms, EvalSettings, KnowledgeUpdateSettings, ThreadSafeContext};
use crate::error::TransportError;
use crate::karl::CompiledExpression;
use crate::record::KnowledgeRecord;

use super::merge::{apply_update, MergeStats, UpdateOrigin, UpdateOutcome};
use super::message::{now_ms, UpdateMessage};

/// Settings shared by every transport implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Peer id stamped on outbound messages; inbound messages carrying it
    /// are dropped.
    pub id: String,
    /// Only messages from this domain are merged.
    pub domain: String,
    /// How long the reader thread blocks before rechecking for shutdown.
    #[serde(with = "duration_ms")]
    pub read_timeout: Duration,
    /// Hops granted to messages this peer publishes.
    pub rebroadcast_ttl: u8,
    /// Upper bound on hops this peer grants when relaying.
    /// 0 disables relaying.
    pub participant_ttl: u8,
    /// KaRL evaluated once per received message, under the same lock as
    /// the merge.
    pub on_data_received_logic: Option<String>,
    /// Messages older than this on arrival are dropped.
    #[serde(with = "option_duration_ms")]
    pub deadline: Option<Duration>,
    /// Originators whose messages are dropped.
    pub banned_peers: Vec<String>,
    pub max_message_bytes: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            domain: "karl".to_string(),
            read_timeout: Duration::from_millis(100),
            rebroadcast_ttl: 0,
            participant_ttl: 0,
            on_data_received_logic: None,
            deadline: None,
            banned_peers: Vec::new(),
            max_message_bytes: 64 * 1024,
        }
    }
}

impl TransportSettings {
    #[must_use]
    pub fn new(id: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            domain: domain.into(),
            ..Self::default()
        }
    }
}

/// A channel that publishes local modifications to peers.
///
/// Implementations own their receive side: they decode inbound frames and
/// hand them to [`process_message`].
pub trait Transport: Send + Sync {
    fn id(&self) -> &str;

    /// Publishes `updates`. Returns the number of bytes sent.
    fn send_data(&self, updates: &[(String, KnowledgeRecord)]) -> Result<usize, TransportError>;

    /// Stops the receive side. Later sends fail with
    /// [`TransportError::Unavailable`].
    fn close(&self);
}

/// Why a whole message was ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    SelfOrigin,
    ForeignDomain,
    BannedPeer,
    Expired,
}

/// What happened to one inbound message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReceiveReport {
    /// Set when message-level filtering discarded the message.
    pub dropped: Option<DropReason>,
    /// Per-key merge decisions, in message order.
    pub outcomes: Vec<(String, UpdateOutcome)>,
    /// Message to relay, when relaying applies.
    pub rebroadcast: Option<UpdateMessage>,
}

impl ReceiveReport {
    fn dropped(reason: DropReason) -> Self {
        Self {
            dropped: Some(reason),
            ..Self::default()
        }
    }

    /// Number of updates merged into the context.
    #[must_use]
    pub fn accepted(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_accepted()).count()
    }
}

/// Filters, merges and (optionally) relays one inbound message.
///
/// Message-level checks run first: self origin, foreign domain, banned
/// originator, deadline. The surviving updates are merged under one
/// acquisition of the context lock, followed by `on_data_received` under
/// the same lock. Waiters are signalled after the lock is released.
pub fn process_message(
    context: &ThreadSafeContext,
    message: &UpdateMessage,
    settings: &TransportSettings,
    on_data_received: Option<&CompiledExpression>,
    stats: &MergeStats,
) -> ReceiveReport {
    if message.originator == settings.id {
        stats.record(UpdateOutcome::DroppedSelfOrigin);
        return ReceiveReport::dropped(DropReason::SelfOrigin);
    }
    if message.domain != settings.domain {
        debug!(domain = %message.domain, from = %message.originator, "message from foreign domain dropped");
        stats.record(UpdateOutcome::DroppedForeignDomain);
        return ReceiveReport::dropped(DropReason::ForeignDomain);
    }
    if settings.banned_peers.iter().any(|p| *p == message.originator) {
        debug!(from = %message.originator, "message from banned peer dropped");
        stats.record_banned();
        return ReceiveReport::dropped(DropReason::BannedPeer);
    }
    if let Some(deadline) = settings.deadline {
        let age = now_ms().saturating_sub(message.timestamp_ms);
        if u128::from(age) > deadline.as_millis() {
            debug!(from = %message.originator, age_ms = age, "expired message dropped");
            stats.record_expired();
            return ReceiveReport::dropped(DropReason::Expired);
        }
    }

    debug!(from = %message.originator, updates = message.updates.len(), clock = message.clock, "message received");

    let merge_settings = KnowledgeUpdateSettings {
        treat_globals_as_locals: true,
        signal_changes: false,
        ..KnowledgeUpdateSettings::default()
    };
    let mut report = ReceiveReport::default();
    {
        let mut guard = context.lock();
        for (key, record) in &message.updates {
            let origin = UpdateOrigin::peer(record.quality, record.clock);
            let outcome = apply_update(&mut guard, key, record, &origin, &merge_settings);
            stats.record(outcome);
            report.outcomes.push((key.clone(), outcome));
        }
        if let Some(logic) = on_data_received {
            if let Err(e) = logic.evaluate_locked(&mut guard, &EvalSettings::default()) {
                warn!(error = %e, "on-data-received logic failed");
            }
        }
    }

    let accepted: Vec<(String, KnowledgeRecord)> = message
        .updates
        .iter()
        .zip(&report.outcomes)
        .filter(|(_, (_, outcome))| outcome.is_accepted())
        .map(|(update, _)| update.clone())
        .collect();
    if accepted.is_empty() {
        return report;
    }
    context.signal();

    if message.ttl > 0 && settings.participant_ttl > 0 {
        report.rebroadcast = Some(UpdateMessage {
            originator: message.originator.clone(),
            domain: message.domain.clone(),
            quality: message.quality,
            clock: message.clock,
            timestamp_ms: message.timestamp_ms,
            ttl: (message.ttl - 1).min(settings.participant_ttl),
            updates: accepted,
        });
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(key: &str, value: i64, clock: u64) -> (String, KnowledgeRecord) {
        let mut record = KnowledgeRecord::from(value);
        record.clock = clock;
        (key.to_string(), record)
    }

    fn message(from: &str, ttl: u8, updates: Vec<(String, KnowledgeRecord)>) -> UpdateMessage {
        UpdateMessage::new(from, "karl", ttl, updates)
    }

    fn settings() -> TransportSettings {
        TransportSettings::new("me", "karl")
    }

    #[test]
    fn test_settings_defaults() {
        let s = TransportSettings::default();
        assert_eq!(s.domain, "karl");
        assert_eq!(s.read_timeout, Duration::from_millis(100));
        assert!(uuid::Uuid::parse_str(&s.id).is_ok());
    }

    #[test]
    fn test_settings_from_json() {
        let s: TransportSettings =
            serde_json::from_str(r#"{"id": "agent.1", "read_timeout": 5, "deadline": 1000, "participant_ttl": 2}"#)
                .unwrap();
        assert_eq!(s.id, "agent.1");
        assert_eq!(s.read_timeout, Duration::from_millis(5));
        assert_eq!(s.deadline, Some(Duration::from_secs(1)));
        assert_eq!(s.participant_ttl, 2);
        assert_eq!(s.max_message_bytes, 64 * 1024);
    }

    #[test]
    fn test_merges_batch_and_reports_outcomes() {
        let ctx = ThreadSafeContext::new();
        let stats = MergeStats::new();
        let _ = ctx.lock().set_key_clock("old", 10);
        let msg = message("peer", 0, vec![update("x", 1, 3), update("old", 2, 4)]);
        let report = process_message(&ctx, &msg, &settings(), None, &stats);
        assert_eq!(report.outcomes, vec![
            ("x".to_string(), UpdateOutcome::Accepted),
            ("old".to_string(), UpdateOutcome::RejectedStale),
        ]);
        assert_eq!(report.accepted(), 1);
        assert!(report.rebroadcast.is_none());
        assert_eq!(ctx.get("x").to_integer(), 1);
        assert_eq!(ctx.clock(), 3);
        assert!(ctx.lock().modifieds().is_empty());
        assert_eq!(stats.snapshot().stale, 1);
    }

    #[test]
    fn test_message_level_filters() {
        let ctx = ThreadSafeContext::new();
        let stats = MergeStats::new();
        let own = message("me", 0, vec![update("x", 1, 1)]);
        assert_eq!(process_message(&ctx, &own, &settings(), None, &stats).dropped, Some(DropReason::SelfOrigin));

        let mut foreign = message("peer", 0, vec![update("x", 1, 1)]);
        foreign.domain = "other".into();
        assert_eq!(
            process_message(&ctx, &foreign, &settings(), None, &stats).dropped,
            Some(DropReason::ForeignDomain)
        );

        let banned = TransportSettings {
            banned_peers: vec!["peer".into()],
            ..settings()
        };
        let msg = message("peer", 0, vec![update("x", 1, 1)]);
        assert_eq!(process_message(&ctx, &msg, &banned, None, &stats).dropped, Some(DropReason::BannedPeer));

        let strict = TransportSettings {
            deadline: Some(Duration::from_millis(10)),
            ..settings()
        };
        let mut late = message("peer", 0, vec![update("x", 1, 1)]);
        late.timestamp_ms -= 60_000;
        assert_eq!(process_message(&ctx, &late, &strict, None, &stats).dropped, Some(DropReason::Expired));

        assert!(!ctx.exists("x"));
        let snap = stats.snapshot();
        assert_eq!((snap.self_origin, snap.foreign_domain, snap.banned, snap.expired), (1, 1, 1, 1));
    }

    #[test]
    fn test_rebroadcast_keeps_originator_and_decrements_ttl() {
        let ctx = ThreadSafeContext::new();
        let stats = MergeStats::new();
        let relay = TransportSettings {
            participant_ttl: 1,
            ..settings()
        };
        let msg = message("origin", 3, vec![update("x", 1, 1)]);
        let report = process_message(&ctx, &msg, &relay, None, &stats);
        let out = report.rebroadcast.unwrap();
        assert_eq!(out.originator, "origin");
        assert_eq!(out.ttl, 1);
        assert_eq!(out.updates.len(), 1);

        let again = process_message(&ctx, &msg, &relay, None, &stats);
        assert_eq!(again.accepted(), 1);
        let stale = message("origin", 3, vec![update("x", 0, 0)]);
        assert!(process_message(&ctx, &stale, &relay, None, &stats).rebroadcast.is_none());
    }

    #[test]
    fn test_no_rebroadcast_without_ttl() {
        let ctx = ThreadSafeContext::new();
        let stats = MergeStats::new();
        let relay = TransportSettings {
            participant_ttl: 5,
            ..settings()
        };
        let msg = message("origin", 0, vec![update("x", 1, 1)]);
        assert!(process_message(&ctx, &msg, &relay, None, &stats).rebroadcast.is_none());
    }

    #[test]
    fn test_on_data_received_runs_under_merge_lock() {
        let ctx = ThreadSafeContext::new();
        let stats = MergeStats::new();
        let logic = ctx.compile("received += 1; last = x").unwrap();
        let msg = message("peer", 0, vec![update("x", 5, 1)]);
        let _ = process_message(&ctx, &msg, &settings(), Some(&logic), &stats);
        assert_eq!(ctx.get("received").to_integer(), 1);
        assert_eq!(ctx.get("last").to_integer(), 5);
    }
}
