use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::bus::Outcome;
use crate::runner::RunnerState;

/// Point-in-time view of one hosted job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub name: String,
    pub job_type: String,
    pub runner_id: Uuid,
    pub state: RunnerState,
    pub triggers: Vec<&'static str>,
    pub last_anchor: Option<DateTime<Utc>>,
    pub last_outcome: Option<Outcome>,
    pub executions: u64,
    pub failures: u64,
    pub last_error: Option<String>,
}

/// Live per-job status written by runners and read by the host.
///
/// Every update names the runner it comes from; updates from a runner that
/// has since been replaced are ignored.
#[derive(Clone, Default)]
pub struct StatusBoard {
    entries: Arc<DashMap<String, JobStatus>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a runner. Counters carry over from a replaced runner of
    /// the same job.
    pub fn register(&self, name: &str, job_type: &str, runner_id: Uuid, triggers: Vec<&'static str>) {
        let mut entry = self.entries.entry(name.to_string()).or_insert_with(|| JobStatus {
            name: name.to_string(),
            job_type: job_type.to_string(),
            runner_id,
            state: RunnerState::Waiting,
            triggers: Vec::new(),
            last_anchor: None,
            last_outcome: None,
            executions: 0,
            failures: 0,
            last_error: None,
        });
        entry.job_type = job_type.to_string();
        entry.runner_id = runner_id;
        entry.state = RunnerState::Waiting;
        entry.triggers = triggers;
    }

    pub fn set_state(&self, name: &str, runner_id: Uuid, state: RunnerState) {
        self.update(name, runner_id, |s| s.state = state);
    }

    pub fn record_execution(&self, name: &str, runner_id: Uuid, outcome: Outcome, error: Option<String>) {
        self.update(name, runner_id, |s| {
            s.executions += 1;
            s.last_outcome = Some(outcome);
            if outcome == Outcome::Failed {
                s.failures += 1;
            }
            if error.is_some() {
                s.last_error = error;
            }
        });
    }

    pub fn record_anchor(&self, name: &str, runner_id: Uuid, anchor: DateTime<Utc>) {
        self.update(name, runner_id, |s| s.last_anchor = Some(anchor));
    }

    pub fn record_error(&self, name: &str, runner_id: Uuid, error: String) {
        self.update(name, runner_id, |s| s.last_error = Some(error));
    }

    /// Forget a job, unless it has been taken over by a newer runner.
    pub fn remove(&self, name: &str, runner_id: Uuid) {
        self.entries.remove_if(name, |_, s| s.runner_id == runner_id);
    }

    pub fn get(&self, name: &str) -> Option<JobStatus> {
        self.entries.get(name).map(|s| s.clone())
    }

    /// All jobs, sorted by name.
    pub fn snapshot(&self) -> Vec<JobStatus> {
        let mut all: Vec<JobStatus> = self.entries.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn update(&self, name: &str, runner_id: Uuid, f: impl FnOnce(&mut JobStatus)) {
        if let Some(mut entry) = self.entries.get_mut(name) {
            if entry.runner_id == runner_id {
                f(entry.value_mut());
            }
        }
    }
}
