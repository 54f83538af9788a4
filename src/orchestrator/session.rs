//! Controller-owned session state and its transition rules.
//!
//! Nothing here does I/O; the controller feeds resolved responses in and
//! publishes [`SessionSnapshot`]s out.

use crate::model::{ManualRunResult, Run, RunListing};
use crate::safety::{self, SafetyState};
use serde::Serialize;
use serde_json::Value;

/// Read-only view published to subscribers after every state change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub(crate) struct SessionSnapshot {
    pub latest_run: Option<Run>,
    pub safety_state: SafetyState,
    pub is_submitting: bool,
    pub is_polling: bool,
    pub is_likely_running: bool,
    pub is_run_active: bool,
    pub can_start: bool,
    pub last_error_message: Option<String>,
}

/// How the held run snapshot moved after applying a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunChange {
    Unchanged,
    Updated,
    /// The held run went from non-terminal to terminal.
    Completed,
    /// The response carried an older run than the one held; ignored.
    Stale,
}

#[derive(Debug, Default)]
pub(crate) struct ControllerSession {
    latest_run: Option<Run>,
    safety_state: SafetyState,
    is_submitting: bool,
    is_polling: bool,
    is_likely_running: bool,
    last_error_message: Option<String>,
    // Set by a conflict response to the last list sequence issued before it.
    // Only a listing issued later, and carrying a run, clears it.
    conflict_after: Option<u64>,
}

impl ControllerSession {
    pub fn latest_run(&self) -> Option<&Run> {
        self.latest_run.as_ref()
    }

    pub fn is_submitting(&self) -> bool {
        self.is_submitting
    }

    pub fn is_run_active(&self) -> bool {
        self.conflict_after.is_some() || self.latest_run.as_ref().is_some_and(|r| !r.is_terminal())
    }

    pub fn can_start(&self) -> bool {
        !self.is_submitting && !self.is_run_active() && !self.safety_state.cooldown_active
    }

    pub fn begin_submission(&mut self) {
        self.is_submitting = true;
        self.is_likely_running = false;
    }

    pub fn end_submission(&mut self) {
        self.is_submitting = false;
        self.is_likely_running = false;
    }

    /// Starting phase elapsed without the trigger resolving.
    pub fn mark_likely_running(&mut self) -> bool {
        if !self.is_submitting || self.is_likely_running {
            return false;
        }
        self.is_likely_running = true;
        true
    }

    pub fn set_polling(&mut self, polling: bool) {
        self.is_polling = polling;
    }

    /// Apply a run-list response. `seq` is the sequence number the request
    /// was issued with. Safety state is replaced wholesale; an empty list
    /// keeps the held run.
    pub fn apply_listing(&mut self, listing: RunListing, seq: u64) -> RunChange {
        self.safety_state = safety::normalize(&listing.safety_state);
        self.last_error_message = None;
        let Some(run) = listing.runs.into_iter().next() else {
            return RunChange::Unchanged;
        };
        let change = self.replace_run(run);
        if change != RunChange::Stale && self.conflict_after.is_some_and(|after| seq > after) {
            self.conflict_after = None;
        }
        change
    }

    pub fn apply_trigger_success(&mut self, result: &ManualRunResult) -> RunChange {
        self.safety_state = safety::normalize(&result.safety_state);
        self.last_error_message = None;
        let change = self.replace_run(result.run_snapshot());
        if change != RunChange::Stale {
            self.conflict_after = None;
        }
        change
    }

    /// Another run is already in progress on the server. `last_issued_seq` is
    /// the newest list request already sent; its response predates the conflict.
    pub fn mark_conflict(&mut self, last_issued_seq: u64) {
        self.conflict_after = Some(last_issued_seq);
        self.last_error_message = None;
    }

    /// Trigger refused by the safety cooldown. The held run is left alone.
    pub fn apply_cooldown(&mut self, raw_safety: &Value, message: &str) {
        let mut state = safety::normalize(raw_safety);
        // The error code alone says the cooldown is on, even without an embedded state.
        state.cooldown_active = true;
        self.safety_state = state;
        self.last_error_message = Some(message.to_string());
    }

    pub fn record_failure(&mut self, message: &str) {
        self.last_error_message = Some(message.to_string());
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            latest_run: self.latest_run.clone(),
            safety_state: self.safety_state.clone(),
            is_submitting: self.is_submitting,
            is_polling: self.is_polling,
            is_likely_running: self.is_likely_running,
            is_run_active: self.is_run_active(),
            can_start: self.can_start(),
            last_error_message: self.last_error_message.clone(),
        }
    }

    fn replace_run(&mut self, run: Run) -> RunChange {
        let previous = self.latest_run.take();
        if let Some(prev) = previous.as_ref() {
            if prev.id > run.id {
                self.latest_run = previous;
                return RunChange::Stale;
            }
        }

        let change = match previous.as_ref() {
            Some(prev) if *prev == run => RunChange::Unchanged,
            Some(prev) if prev.id == run.id && !prev.is_terminal() && run.is_terminal() => {
                RunChange::Completed
            }
            _ => RunChange::Updated,
        };
        self.latest_run = Some(run);
        change
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fake::{listing, manual_result, run};
    use crate::model::RunStatus;
    use serde_json::json;

    #[test]
    fn default_session_can_start() {
        let session = ControllerSession::default();
        let snap = session.snapshot();
        assert!(snap.can_start);
        assert!(!snap.is_run_active);
        assert_eq!(snap.latest_run, None);
    }

    #[test]
    fn running_run_blocks_start_until_terminal() {
        let mut session = ControllerSession::default();
        assert_eq!(
            session.apply_listing(listing(vec![run(90, RunStatus::Running)]), 1),
            RunChange::Updated
        );
        assert!(session.is_run_active());
        assert!(!session.can_start());

        assert_eq!(
            session.apply_listing(listing(vec![run(90, RunStatus::Success)]), 2),
            RunChange::Completed
        );
        assert!(!session.is_run_active());
        assert!(session.can_start());
    }

    #[test]
    fn identical_listing_is_unchanged() {
        let mut session = ControllerSession::default();
        session.apply_listing(listing(vec![run(3, RunStatus::Queued)]), 1);
        assert_eq!(
            session.apply_listing(listing(vec![run(3, RunStatus::Queued)]), 2),
            RunChange::Unchanged
        );
    }

    #[test]
    fn older_run_does_not_replace_newer_one() {
        let mut session = ControllerSession::default();
        session.apply_trigger_success(&manual_result(30, RunStatus::Running));
        let change = session.apply_listing(
            RunListing {
                runs: vec![run(29, RunStatus::Success)],
                safety_state: json!({"counters": {"consecutive_network_runs": 2}}),
            },
            1,
        );
        assert_eq!(change, RunChange::Stale);
        assert_eq!(session.latest_run().map(|r| r.id), Some(30));
        // Safety state from the same response still applies.
        assert_eq!(session.snapshot().safety_state.counters.consecutive_network_runs, 2);
    }

    #[test]
    fn empty_listing_keeps_held_run_and_replaces_safety() {
        let mut session = ControllerSession::default();
        session.apply_trigger_success(&manual_result(77, RunStatus::Running));
        session.record_failure("boom");
        let change = session.apply_listing(
            RunListing {
                runs: Vec::new(),
                safety_state: json!({"cooldown_remaining_seconds": 5}),
            },
            1,
        );
        assert_eq!(change, RunChange::Unchanged);
        let snap = session.snapshot();
        assert_eq!(snap.latest_run.map(|r| r.id), Some(77));
        assert!(snap.is_run_active);
        assert_eq!(snap.safety_state.cooldown_remaining_seconds, 5);
        assert_eq!(snap.last_error_message, None);
    }

    #[test]
    fn conflict_counts_as_active_until_a_run_is_fetched() {
        let mut session = ControllerSession::default();
        session.apply_listing(listing(vec![run(41, RunStatus::Success)]), 1);
        session.mark_conflict(1);
        assert!(session.is_run_active());
        session.apply_listing(listing(Vec::new()), 2);
        assert!(session.is_run_active());
        session.apply_listing(listing(vec![run(42, RunStatus::Running)]), 3);
        assert!(session.is_run_active());
        session.apply_listing(listing(vec![run(42, RunStatus::Failed)]), 4);
        assert!(!session.is_run_active());
    }

    #[test]
    fn listing_issued_before_conflict_keeps_run_active() {
        let mut session = ControllerSession::default();
        session.apply_listing(listing(vec![run(7, RunStatus::Running)]), 1);
        // Request 2 is in flight when the conflict arrives.
        session.mark_conflict(2);
        let change = session.apply_listing(listing(vec![run(7, RunStatus::Success)]), 2);
        assert_eq!(change, RunChange::Completed);
        let snap = session.snapshot();
        assert!(snap.is_run_active);
        assert!(!snap.can_start);

        session.apply_listing(listing(vec![run(8, RunStatus::Running)]), 3);
        assert!(session.is_run_active());
        session.apply_listing(listing(vec![run(8, RunStatus::Success)]), 4);
        assert!(session.can_start());
    }

    #[test]
    fn cooldown_without_embedded_state_still_blocks() {
        let mut session = ControllerSession::default();
        session.apply_listing(listing(vec![run(11, RunStatus::Success)]), 1);
        session.apply_cooldown(&Value::Null, "Scrape safety cooldown is active.");
        let snap = session.snapshot();
        assert!(snap.safety_state.cooldown_active);
        assert!(!snap.can_start);
        assert_eq!(snap.latest_run.map(|r| r.id), Some(11));
        assert_eq!(
            snap.last_error_message.as_deref(),
            Some("Scrape safety cooldown is active.")
        );
    }

    #[test]
    fn likely_running_only_while_submitting() {
        let mut session = ControllerSession::default();
        assert!(!session.mark_likely_running());
        session.begin_submission();
        assert!(session.mark_likely_running());
        assert!(!session.mark_likely_running());
        assert!(session.snapshot().is_likely_running);
        session.end_submission();
        let snap = session.snapshot();
        assert!(!snap.is_likely_running);
        assert!(!snap.is_submitting);
    }
}
