//! Per-call settings for updates, evaluation and waiting.
//!
//! Settings are plain values passed into each call; nothing here is global.
//! All of them deserialize from JSON with every field optional.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How a write is applied to the context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeUpdateSettings {
    /// Skip the clock/quality comparison when applying remote updates.
    pub always_overwrite: bool,
    /// Do not send modified globals right after the call; they stay
    /// queued until the next explicit `send_modifieds`.
    pub delay_sending_modifieds: bool,
    /// Write globals like locals: no clock advance, not queued for sending.
    pub treat_globals_as_locals: bool,
    /// Substitute `{var}` segments in key names before lookup.
    pub expand_variables: bool,
    /// Wake threads blocked in `wait_for_change`.
    pub signal_changes: bool,
    /// How far a global write advances the context clock.
    pub clock_increment: u64,
}

impl Default for KnowledgeUpdateSettings {
    fn default() -> Self {
        Self {
            always_overwrite: false,
            delay_sending_modifieds: false,
            treat_globals_as_locals: false,
            expand_variables: true,
            signal_changes: true,
            clock_increment: 1,
        }
    }
}

impl KnowledgeUpdateSettings {
    /// Settings for writes that must never leave this process.
    #[must_use]
    pub fn local() -> Self {
        Self {
            treat_globals_as_locals: true,
            ..Self::default()
        }
    }

    /// Settings that keep modifications queued instead of sending them.
    #[must_use]
    pub fn delayed() -> Self {
        Self {
            delay_sending_modifieds: true,
            ..Self::default()
        }
    }
}

/// Settings for evaluating a compiled expression.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalSettings {
    #[serde(flatten)]
    pub update: KnowledgeUpdateSettings,
    /// Statement expanded and printed before evaluation.
    pub pre_print_statement: Option<String>,
    /// Statement expanded and printed after evaluation.
    pub post_print_statement: Option<String>,
}

impl EvalSettings {
    /// Evaluation settings that keep modifications queued.
    #[must_use]
    pub fn delayed() -> Self {
        Self {
            update: KnowledgeUpdateSettings::delayed(),
            ..Self::default()
        }
    }
}

/// Settings for `wait`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitSettings {
    #[serde(flatten)]
    pub eval: EvalSettings,
    /// Longest pause between two evaluations of the condition.
    #[serde(with = "duration_ms")]
    pub poll_frequency: Duration,
    /// Give up after this long; `None` waits forever.
    #[serde(with = "option_duration_ms")]
    pub max_wait_time: Option<Duration>,
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            eval: EvalSettings::default(),
            poll_frequency: Duration::from_millis(10),
            max_wait_time: None,
        }
    }
}

impl WaitSettings {
    /// Default settings with a maximum wait.
    #[must_use]
    pub fn with_timeout(max_wait_time: Duration) -> Self {
        Self {
            max_wait_time: Some(max_wait_time),
            ..Self::default()
        }
    }
}

/// Serde adapter storing a `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Serde adapter storing an `Option<Duration>` as optional milliseconds.
pub(crate) mod option_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_defaults() {
        let s = KnowledgeUpdateSettings::default();
        assert!(!s.always_overwrite);
        assert!(!s.delay_sending_modifieds);
        assert!(!s.treat_globals_as_locals);
        assert!(s.expand_variables);
        assert!(s.signal_changes);
        assert_eq!(s.clock_increment, 1);
    }

    #[test]
    fn test_wait_defaults() {
        let s = WaitSettings::default();
        assert_eq!(s.poll_frequency, Duration::from_millis(10));
        assert!(s.max_wait_time.is_none());
    }

    #[test]
    fn test_wait_settings_from_partial_json() {
        let s: WaitSettings =
            serde_json::from_str(r#"{"poll_frequency": 5, "max_wait_time": 200, "delay_sending_modifieds": true}"#)
                .unwrap();
        assert_eq!(s.poll_frequency, Duration::from_millis(5));
        assert_eq!(s.max_wait_time, Some(Duration::from_millis(200)));
        assert!(s.eval.update.delay_sending_modifieds);
        assert!(s.eval.update.signal_changes);
    }

    #[test]
    fn test_eval_settings_json_roundtrip() {
        let s = EvalSettings {
            pre_print_statement: Some("x={x}".into()),
            ..EvalSettings::delayed()
        };
        let json = serde_json::to_string(&s).unwrap();
        let back: EvalSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(s, back);
    }
}
