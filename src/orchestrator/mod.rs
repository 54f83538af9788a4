//! Application-level orchestration utilities.
//!
//! This module owns run lifecycle control: triggering manual runs, polling the
//! latest run while one is active, and honoring the server's safety cooldown.
//! CLI layers drive it through a [`RunLifecycleHandle`] and observe it through
//! session snapshots and [`crate::model::ControllerEvent`]s.

mod controller;
mod scheduler;
mod session;

pub(crate) use controller::{spawn_controller, RunLifecycleHandle};
pub(crate) use session::SessionSnapshot;
