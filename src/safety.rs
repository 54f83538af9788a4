//! Scrape safety policy evaluation.
//!
//! Turns the server's raw safety payload into a [`SafetyState`]. Normalization
//! never fails: missing or malformed fields fall back to zero / `None`, and every
//! counter is clamped to be non-negative.

use serde::Serialize;
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Why the server put new runs on hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CooldownReason {
    BlockedFailureThresholdExceeded,
    NetworkFailureThresholdExceeded,
    Other(String),
}

impl CooldownReason {
    pub fn from_token(token: &str) -> Self {
        match token {
            "blocked_failure_threshold_exceeded" => Self::BlockedFailureThresholdExceeded,
            "network_failure_threshold_exceeded" => Self::NetworkFailureThresholdExceeded,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_token(&self) -> &str {
        match self {
            Self::BlockedFailureThresholdExceeded => "blocked_failure_threshold_exceeded",
            Self::NetworkFailureThresholdExceeded => "network_failure_threshold_exceeded",
            Self::Other(token) => token,
        }
    }

    /// Built-in label used when the server does not send one.
    pub fn default_label(&self) -> String {
        match self {
            Self::BlockedFailureThresholdExceeded => {
                "Blocked responses exceeded safety threshold".to_string()
            }
            Self::NetworkFailureThresholdExceeded => {
                "Network failures exceeded safety threshold".to_string()
            }
            Self::Other(token) => token.replace('_', " "),
        }
    }
}

impl Serialize for CooldownReason {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_token())
    }
}

/// Failure-streak bookkeeping reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SafetyCounters {
    pub consecutive_blocked_runs: u64,
    pub consecutive_network_runs: u64,
    pub cooldown_entry_count: u64,
    pub blocked_start_count: u64,
    pub last_blocked_failure_count: u64,
    pub last_network_failure_count: u64,
    pub last_evaluated_run_id: Option<u64>,
}

/// Server-authoritative cooldown view. Always replaced wholesale.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SafetyState {
    pub cooldown_active: bool,
    pub cooldown_reason: Option<CooldownReason>,
    pub cooldown_reason_label: Option<String>,
    pub cooldown_until: Option<String>,
    pub cooldown_remaining_seconds: u64,
    pub recommended_action: Option<String>,
    pub counters: SafetyCounters,
}

impl SafetyState {
    /// Label for display: the server's label, else a built-in one for the reason.
    pub fn reason_label(&self) -> Option<String> {
        self.cooldown_reason_label
            .clone()
            .or_else(|| self.cooldown_reason.as_ref().map(CooldownReason::default_label))
    }

    /// Seconds left at `now`, preferring `cooldown_until` when it parses.
    pub fn remaining_seconds_at(&self, now: OffsetDateTime) -> f64 {
        if !self.cooldown_active {
            return 0.0;
        }
        match self
            .cooldown_until
            .as_deref()
            .and_then(|until| OffsetDateTime::parse(until, &Rfc3339).ok())
        {
            Some(until) => (until - now).as_seconds_f64().max(0.0),
            None => self.cooldown_remaining_seconds as f64,
        }
    }

    /// Countdown string for display, reading the wall clock.
    pub fn countdown_label(&self) -> String {
        format_cooldown_countdown(self.remaining_seconds_at(OffsetDateTime::now_utc()))
    }
}

/// Normalize a raw safety payload. Never fails.
pub fn normalize(raw: &Value) -> SafetyState {
    let Some(obj) = raw.as_object() else {
        return SafetyState::default();
    };
    let empty = Map::new();
    let counters = obj
        .get("counters")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    SafetyState {
        cooldown_active: parse_bool(obj.get("cooldown_active")),
        cooldown_reason: parse_nullable_string(obj.get("cooldown_reason"))
            .map(|token| CooldownReason::from_token(&token)),
        cooldown_reason_label: parse_nullable_string(obj.get("cooldown_reason_label")),
        cooldown_until: parse_nullable_string(obj.get("cooldown_until")),
        cooldown_remaining_seconds: parse_count(obj.get("cooldown_remaining_seconds")),
        recommended_action: parse_nullable_string(obj.get("recommended_action")),
        counters: SafetyCounters {
            consecutive_blocked_runs: parse_count(counters.get("consecutive_blocked_runs")),
            consecutive_network_runs: parse_count(counters.get("consecutive_network_runs")),
            cooldown_entry_count: parse_count(counters.get("cooldown_entry_count")),
            blocked_start_count: parse_count(counters.get("blocked_start_count")),
            last_blocked_failure_count: parse_count(counters.get("last_blocked_failure_count")),
            last_network_failure_count: parse_count(counters.get("last_network_failure_count")),
            last_evaluated_run_id: match counters.get("last_evaluated_run_id") {
                None | Some(Value::Null) => None,
                Some(v) => Some(parse_count(Some(v))),
            },
        },
    }
}

/// Format a countdown as `"{h}h {m}m"`, `"{m}m {s}s"` or `"{s}s"`.
///
/// Total over all inputs: non-finite and non-positive values render as `"0s"`.
pub fn format_cooldown_countdown(seconds: f64) -> String {
    let bounded = if seconds.is_finite() {
        seconds.floor().max(0.0) as u64
    } else {
        0
    };
    if bounded == 0 {
        return "0s".to_string();
    }

    let hours = bounded / 3600;
    let minutes = (bounded % 3600) / 60;
    let secs = bounded % 60;

    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {secs}s")
    } else {
        format!("{secs}s")
    }
}

fn parse_number(value: Option<&Value>) -> Option<f64> {
    let parsed = match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) if !s.trim().is_empty() => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    parsed.is_finite().then_some(parsed)
}

// Counters are whole, non-negative numbers; fractional input is truncated.
fn parse_count(value: Option<&Value>) -> u64 {
    parse_number(value).unwrap_or(0.0).max(0.0) as u64
}

fn parse_nullable_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        _ => None,
    }
}

fn parse_bool(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0 && f.is_finite()),
        Some(Value::String(s)) => {
            matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
        }
        _ => false,
    }
}
