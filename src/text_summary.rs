//! Text summary builder for CLI output.
//!
//! Formats session snapshots, runs and trigger outcomes as human-readable lines.

use crate::model::{ManualCheckOutcome, Run, TriggerType};
use crate::orchestrator::SessionSnapshot;
use crate::safety::{format_cooldown_countdown, SafetyState};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::OffsetDateTime;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

/// Render an RFC 3339 timestamp as `YYYY-MM-DD HH:MM UTC`, or `-`.
pub(crate) fn format_timestamp(value: Option<&str>) -> String {
    let Some(raw) = value else {
        return "-".to_string();
    };
    let fmt = format_description!("[year]-[month]-[day] [hour]:[minute] UTC");
    OffsetDateTime::parse(raw, &Rfc3339)
        .ok()
        .and_then(|dt| dt.to_offset(time::UtcOffset::UTC).format(fmt).ok())
        .unwrap_or_else(|| raw.to_string())
}

pub(crate) fn run_line(run: &Run) -> String {
    format!(
        "Run #{} [{}] {} | started {} | finished {} | scholars {} | new pubs {} | failed {} | partial {}",
        run.id,
        trigger_label(run),
        run.status.as_str(),
        format_timestamp(run.start_time.as_deref()),
        format_timestamp(run.end_time.as_deref()),
        run.scholar_count,
        run.new_publication_count,
        run.failed_count,
        run.partial_count,
    )
}

fn trigger_label(run: &Run) -> &'static str {
    match run.trigger_type {
        TriggerType::Manual => "manual",
        TriggerType::Scheduled => "scheduled",
        TriggerType::Other => "other",
    }
}

/// Safety lines; `remaining_seconds` is computed by the caller so this stays clock-free.
pub(crate) fn safety_lines(safety: &SafetyState, remaining_seconds: f64) -> Vec<String> {
    let mut lines = Vec::new();
    if safety.cooldown_active {
        let reason = safety
            .reason_label()
            .unwrap_or_else(|| "Safety cooldown".to_string());
        lines.push(format!(
            "Cooldown: {reason} (remaining {})",
            format_cooldown_countdown(remaining_seconds)
        ));
        if let Some(action) = safety.recommended_action.as_deref() {
            lines.push(format!("Recommended: {action}"));
        }
    } else {
        lines.push("Cooldown: inactive".to_string());
    }
    let c = &safety.counters;
    lines.push(format!(
        "Safety counters: blocked streak {} | network streak {} | cooldowns {} | blocked starts {}",
        c.consecutive_blocked_runs,
        c.consecutive_network_runs,
        c.cooldown_entry_count,
        c.blocked_start_count,
    ));
    lines
}

pub(crate) fn build_session_summary(snap: &SessionSnapshot, remaining_seconds: f64) -> TextSummary {
    let mut lines = Vec::new();
    match snap.latest_run.as_ref() {
        Some(run) => lines.push(run_line(run)),
        None => lines.push("No runs yet.".to_string()),
    }
    let state = if snap.is_likely_running {
        "starting"
    } else if snap.is_submitting {
        "submitting"
    } else if snap.is_run_active {
        "running"
    } else if snap.safety_state.cooldown_active {
        "blocked"
    } else {
        "idle"
    };
    lines.push(format!(
        "State: {state} | polling {} | can start {}",
        yes_no(snap.is_polling),
        yes_no(snap.can_start)
    ));
    lines.extend(safety_lines(&snap.safety_state, remaining_seconds));
    if let Some(err) = snap.last_error_message.as_deref() {
        lines.push(format!("Last error: {err}"));
    }
    TextSummary { lines }
}

pub(crate) fn outcome_line(outcome: &ManualCheckOutcome) -> String {
    match outcome {
        ManualCheckOutcome::Started {
            run_id,
            reused_existing_run,
        } => {
            if *reused_existing_run {
                format!("Joined existing run #{run_id}")
            } else {
                format!("Started run #{run_id}")
            }
        }
        ManualCheckOutcome::AlreadyRunning { run_id, request_id } => {
            let run = run_id.map(|id| format!(" #{id}")).unwrap_or_default();
            let req = request_id
                .as_deref()
                .map(|id| format!(" (request {id})"))
                .unwrap_or_default();
            format!("A run{run} is already in progress{req}")
        }
        ManualCheckOutcome::Error {
            message,
            request_id,
            ..
        } => match request_id.as_deref() {
            Some(id) => format!("Could not start run: {message} (request {id})"),
            None => format!("Could not start run: {message}"),
        },
    }
}

fn yes_no(v: bool) -> &'static str {
    if v {
        "yes"
    } else {
        "no"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fake::run;
    use crate::model::RunStatus;
    use crate::safety::normalize;
    use serde_json::json;

    #[test]
    fn timestamps_render_in_utc_or_dash() {
        assert_eq!(format_timestamp(None), "-");
        assert_eq!(
            format_timestamp(Some("2026-02-19T13:05:00+01:00")),
            "2026-02-19 12:05 UTC"
        );
        assert_eq!(format_timestamp(Some("yesterday")), "yesterday");
    }

    #[test]
    fn run_line_includes_counts() {
        let line = run_line(&run(11, RunStatus::Success));
        assert!(line.starts_with("Run #11 [manual] success"));
        assert!(line.contains("new pubs 2"));
    }

    #[test]
    fn blocked_session_shows_countdown_and_action() {
        let snap = SessionSnapshot {
            safety_state: normalize(&json!({
                "cooldown_active": true,
                "cooldown_reason": "network_failure_threshold_exceeded",
                "recommended_action": "Check connectivity."
            })),
            ..SessionSnapshot::default()
        };
        let summary = build_session_summary(&snap, 3661.0);
        assert!(summary.lines.contains(&"No runs yet.".to_string()));
        assert!(summary.lines.iter().any(|l| l.starts_with("State: blocked")));
        assert!(summary.lines.contains(
            &"Cooldown: Network failures exceeded safety threshold (remaining 1h 1m)".to_string()
        ));
        assert!(summary.lines.contains(&"Recommended: Check connectivity.".to_string()));
    }

    #[test]
    fn outcome_lines() {
        assert_eq!(
            outcome_line(&ManualCheckOutcome::AlreadyRunning {
                run_id: Some(42),
                request_id: Some("req_123".into())
            }),
            "A run #42 is already in progress (request req_123)"
        );
        assert_eq!(
            outcome_line(&ManualCheckOutcome::Started {
                run_id: 25,
                reused_existing_run: true
            }),
            "Joined existing run #25"
        );
        assert_eq!(
            outcome_line(&ManualCheckOutcome::local_error("boom")),
            "Could not start run: boom"
        );
    }
}
