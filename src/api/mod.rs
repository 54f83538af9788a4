//! Collaborator contracts for the runs backend.
//!
//! The controller only sees [`RunsApi`]; transport details and error-code
//! decoding stay behind this boundary.

mod error;
mod http;

pub(crate) use error::ApiError;
pub(crate) use http::{ClientSettings, HttpRunsClient};

use crate::model::{ManualRunResult, RunListing};
use std::future::Future;

/// Run query + run trigger calls against the backend.
pub(crate) trait RunsApi: Send + Sync + 'static {
    /// List the most recent runs, newest first.
    fn list_runs(&self, limit: usize)
        -> impl Future<Output = Result<RunListing, ApiError>> + Send;

    /// Ask the backend to start a manual run.
    fn trigger_manual_run(&self) -> impl Future<Output = Result<ManualRunResult, ApiError>> + Send;
}

#[cfg(test)]
pub(crate) mod fake;
