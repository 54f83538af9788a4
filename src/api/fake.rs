//! Scripted in-memory [`RunsApi`] for controller tests.

use super::{ApiError, RunsApi};
use crate::model::{ManualRunResult, Run, RunListing, RunStatus, TriggerType};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

struct Scripted<T> {
    delay: Duration,
    result: Result<T, ApiError>,
}

/// Responses are consumed in order; an exhausted list script answers with an
/// empty listing, an exhausted trigger script with a transport error.
#[derive(Default)]
pub(crate) struct ScriptedApi {
    listings: Mutex<VecDeque<Scripted<RunListing>>>,
    triggers: Mutex<VecDeque<Scripted<ManualRunResult>>>,
    list_calls: AtomicUsize,
    trigger_calls: AtomicUsize,
    last_limit: AtomicUsize,
}

impl ScriptedApi {
    pub fn push_listing(&self, result: Result<RunListing, ApiError>) -> &Self {
        self.push_listing_after(Duration::ZERO, result)
    }

    pub fn push_listing_after(
        &self,
        delay: Duration,
        result: Result<RunListing, ApiError>,
    ) -> &Self {
        if let Ok(mut q) = self.listings.lock() {
            q.push_back(Scripted { delay, result });
        }
        self
    }

    pub fn push_trigger(&self, result: Result<ManualRunResult, ApiError>) -> &Self {
        self.push_trigger_after(Duration::ZERO, result)
    }

    pub fn push_trigger_after(
        &self,
        delay: Duration,
        result: Result<ManualRunResult, ApiError>,
    ) -> &Self {
        if let Ok(mut q) = self.triggers.lock() {
            q.push_back(Scripted { delay, result });
        }
        self
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn trigger_calls(&self) -> usize {
        self.trigger_calls.load(Ordering::SeqCst)
    }

    pub fn last_limit(&self) -> usize {
        self.last_limit.load(Ordering::SeqCst)
    }
}

impl RunsApi for ScriptedApi {
    async fn list_runs(&self, limit: usize) -> Result<RunListing, ApiError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.last_limit.store(limit, Ordering::SeqCst);
        let next = self.listings.lock().ok().and_then(|mut q| q.pop_front());
        match next {
            Some(s) => {
                if !s.delay.is_zero() {
                    tokio::time::sleep(s.delay).await;
                }
                s.result
            }
            None => Ok(RunListing::default()),
        }
    }

    async fn trigger_manual_run(&self) -> Result<ManualRunResult, ApiError> {
        self.trigger_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.triggers.lock().ok().and_then(|mut q| q.pop_front());
        match next {
            Some(s) => {
                if !s.delay.is_zero() {
                    tokio::time::sleep(s.delay).await;
                }
                s.result
            }
            None => Err(ApiError::transport("no scripted trigger response")),
        }
    }
}

pub(crate) fn run(id: u64, status: RunStatus) -> Run {
    let finished = !matches!(status, RunStatus::Queued | RunStatus::Running);
    Run {
        id,
        trigger_type: TriggerType::Manual,
        status,
        start_time: Some("2026-02-19T12:00:00Z".into()),
        end_time: finished.then(|| "2026-02-19T12:01:00Z".into()),
        scholar_count: 3,
        new_publication_count: 2,
        failed_count: 0,
        partial_count: 0,
    }
}

pub(crate) fn listing(runs: Vec<Run>) -> RunListing {
    RunListing {
        runs,
        safety_state: serde_json::json!({"cooldown_active": false}),
    }
}

pub(crate) fn manual_result(run_id: u64, status: RunStatus) -> ManualRunResult {
    ManualRunResult {
        run_id,
        status,
        scholar_count: 0,
        succeeded_count: 0,
        failed_count: 0,
        partial_count: 0,
        new_publication_count: 0,
        reused_existing_run: false,
        idempotency_key: "abc".into(),
        safety_state: serde_json::json!({"cooldown_active": false}),
    }
}
