use crate::safety::SafetyState;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default cadence for polling the latest run while one is active.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Grace period after which an unresolved trigger is shown as "likely running".
pub const STARTING_PHASE: Duration = Duration::from_millis(1500);

/// Timing knobs for the run lifecycle controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub starting_phase: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
            starting_phase: STARTING_PHASE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Manual,
    Scheduled,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Partial,
    Failed,
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
            RunStatus::Unknown => "unknown",
        }
    }
}

/// Server snapshot of one scrape run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: u64,
    pub trigger_type: TriggerType,
    pub status: RunStatus,
    #[serde(default, rename = "start_dt")]
    pub start_time: Option<String>,
    #[serde(default, rename = "end_dt")]
    pub end_time: Option<String>,
    #[serde(default)]
    pub scholar_count: u64,
    #[serde(default)]
    pub new_publication_count: u64,
    #[serde(default)]
    pub failed_count: u64,
    #[serde(default)]
    pub partial_count: u64,
}

impl Run {
    /// True once no further polling should happen for this run.
    ///
    /// Statuses this client does not know about fall back to the
    /// `end_dt` invariant: a run with an end time is finished.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            RunStatus::Queued | RunStatus::Running => false,
            RunStatus::Success | RunStatus::Partial | RunStatus::Failed => true,
            RunStatus::Unknown => self.end_time.is_some(),
        }
    }
}

/// Response of the run-list query, newest run first.
///
/// `safety_state` stays raw here; it is normalized by the controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunListing {
    #[serde(default)]
    pub runs: Vec<Run>,
    #[serde(default)]
    pub safety_state: serde_json::Value,
}

/// Successful result of a manual trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualRunResult {
    pub run_id: u64,
    pub status: RunStatus,
    #[serde(default)]
    pub scholar_count: u64,
    #[serde(default)]
    pub succeeded_count: u64,
    #[serde(default)]
    pub failed_count: u64,
    #[serde(default)]
    pub partial_count: u64,
    #[serde(default)]
    pub new_publication_count: u64,
    #[serde(default)]
    pub reused_existing_run: bool,
    #[serde(default)]
    pub idempotency_key: String,
    #[serde(default)]
    pub safety_state: serde_json::Value,
}

impl ManualRunResult {
    /// Run snapshot implied by the trigger response, used until the next list fetch.
    pub fn run_snapshot(&self) -> Run {
        Run {
            id: self.run_id,
            trigger_type: TriggerType::Manual,
            status: self.status,
            start_time: None,
            end_time: None,
            scholar_count: self.scholar_count,
            new_publication_count: self.new_publication_count,
            failed_count: self.failed_count,
            partial_count: self.partial_count,
        }
    }
}

/// Tagged outcome of `start_manual_check`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ManualCheckOutcome {
    Started {
        run_id: u64,
        reused_existing_run: bool,
    },
    AlreadyRunning {
        run_id: Option<u64>,
        request_id: Option<String>,
    },
    Error {
        message: String,
        status: Option<u16>,
        code: Option<String>,
        request_id: Option<String>,
    },
}

impl ManualCheckOutcome {
    /// Error outcome produced locally, without a server round-trip.
    pub fn local_error(message: impl Into<String>) -> Self {
        ManualCheckOutcome::Error {
            message: message.into(),
            status: None,
            code: None,
            request_id: None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ManualCheckOutcome::Error { .. })
    }
}

/// Events emitted by the controller and consumed by CLI layers.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    /// The held run snapshot changed (new id or new status).
    RunUpdated { run: Run },
    /// The held run reached a terminal status.
    RunCompleted { run: Run },
    PollingStarted,
    PollingStopped,
    /// A trigger was refused because the safety cooldown is active.
    CooldownBlocked { safety: Box<SafetyState> },
    Info(InfoEvent),
}

/// Structured info events for CLI output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoEvent {
    Message(String),
    LikelyRunning,
    RequestFailed { message: String },
    Reset,
}

impl InfoEvent {
    /// Render a human-readable message for CLI layers.
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::Message(msg) => msg.clone(),
            InfoEvent::LikelyRunning => "Run is starting…".to_string(),
            InfoEvent::RequestFailed { message } => format!("Request failed: {message}"),
            InfoEvent::Reset => "Run controller reset".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn run_decodes_wire_field_names() {
        let run: Run = serde_json::from_value(json!({
            "id": 11,
            "trigger_type": "manual",
            "status": "success",
            "start_dt": "2026-02-19T12:00:00Z",
            "end_dt": "2026-02-19T12:01:00Z",
            "scholar_count": 3,
            "new_publication_count": 2,
            "failed_count": 0,
            "partial_count": 0
        }))
        .unwrap();
        assert_eq!(run.id, 11);
        assert_eq!(run.start_time.as_deref(), Some("2026-02-19T12:00:00Z"));
        assert!(run.is_terminal());
    }

    #[test]
    fn unknown_status_is_terminal_only_with_end_time() {
        let mut run: Run = serde_json::from_value(json!({
            "id": 5,
            "trigger_type": "scheduled",
            "status": "resolving",
            "end_dt": null
        }))
        .unwrap();
        assert_eq!(run.status, RunStatus::Unknown);
        assert!(!run.is_terminal());
        run.end_time = Some("2026-02-19T12:01:00Z".into());
        assert!(run.is_terminal());
    }

    #[test]
    fn outcome_serializes_with_kind_tag() {
        let started = ManualCheckOutcome::Started {
            run_id: 25,
            reused_existing_run: false,
        };
        assert_eq!(
            serde_json::to_value(&started).unwrap(),
            json!({"kind": "started", "run_id": 25, "reused_existing_run": false})
        );
    }

    #[test]
    fn controller_config_accepts_humantime_strings() {
        let cfg: ControllerConfig =
            serde_json::from_value(json!({"poll_interval": "2s", "starting_phase": "800ms"}))
                .unwrap();
        assert_eq!(cfg.poll_interval, Duration::from_secs(2));
        assert_eq!(cfg.starting_phase, Duration::from_millis(800));
    }
}
