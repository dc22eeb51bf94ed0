//! Reconciliation loop: keeps one runner per configured job.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use cadence_core::{JobDefinition, JobsConfig};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::manual::ManualTriggerRegistry;
use crate::runner::{JobRunner, RunnerDeps};
use crate::status::StatusBoard;

/// What one reconciliation pass changed.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

pub struct Scheduler {
    deps: RunnerDeps,
    running: HashMap<String, JobRunner>,
    /// Tasks of removed jobs that may still be finishing, by job name. A job
    /// added back under the same name waits for its entry here.
    retired: HashMap<String, JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(deps: RunnerDeps) -> Self {
        Self {
            deps,
            running: HashMap::new(),
            retired: HashMap::new(),
        }
    }

    pub fn status(&self) -> &StatusBoard {
        &self.deps.status
    }

    pub fn manual(&self) -> &ManualTriggerRegistry {
        &self.deps.manual
    }

    pub fn running_jobs(&self) -> Vec<String> {
        let mut names: Vec<String> = self.running.keys().cloned().collect();
        names.sort();
        names
    }

    /// Converge the running set onto `desired`. Never waits on job tasks.
    pub fn reconcile(
        &mut self,
        desired: &BTreeMap<String, JobDefinition>,
        parent: &CancellationToken,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let mut to_remove: Vec<String> = self
            .running
            .keys()
            .filter(|name| !desired.contains_key(*name))
            .cloned()
            .collect();
        to_remove.sort();

        for (name, definition) in desired {
            match self.running.get(name) {
                None => {
                    let predecessor = self.retired.remove(name);
                    let runner = JobRunner::start(definition.clone(), &self.deps, parent, predecessor);
                    info!(job = %name, runner = %runner.id(), "job added");
                    self.running.insert(name.clone(), runner);
                    report.added.push(name.clone());
                }
                Some(current) if current.definition() != definition => {
                    // Old runner goes first; the replacement waits for its task.
                    let Some(old) = self.running.remove(name) else {
                        continue;
                    };
                    let old_id = old.id();
                    let predecessor = old.dispose();
                    let runner = JobRunner::start(definition.clone(), &self.deps, parent, predecessor);
                    info!(job = %name, old_runner = %old_id, runner = %runner.id(), "job updated");
                    self.running.insert(name.clone(), runner);
                    report.updated.push(name.clone());
                }
                Some(_) => {}
            }
        }

        for name in to_remove {
            if let Some(runner) = self.running.remove(&name) {
                let id = runner.id();
                if let Some(task) = runner.dispose() {
                    self.retired.insert(name.clone(), task);
                }
                self.deps.status.remove(&name, id);
                info!(job = %name, runner = %id, "job removed");
                report.removed.push(name);
            }
        }

        self.retired.retain(|_, task| !task.is_finished());
        report
    }

    /// Run until `shutdown` fires, reconciling on every configuration change,
    /// then wait for every runner task to finish.
    pub async fn run(mut self, mut config: watch::Receiver<Arc<JobsConfig>>, shutdown: CancellationToken) {
        let scope = shutdown.child_token();

        let initial = config.borrow_and_update().definitions();
        let report = self.reconcile(&initial, &scope);
        info!(jobs = ?self.running_jobs(), added = report.added.len(), "scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = config.changed() => {
                    if changed.is_err() {
                        warn!("configuration source closed; keeping current jobs");
                        shutdown.cancelled().await;
                        break;
                    }
                    let desired = config.borrow_and_update().definitions();
                    let report = self.reconcile(&desired, &scope);
                    if !report.is_empty() {
                        info!(
                            added = ?report.added,
                            updated = ?report.updated,
                            removed = ?report.removed,
                            "configuration reconciled"
                        );
                    }
                }
            }
        }

        scope.cancel();
        self.shutdown().await;
    }

    /// Cancel every runner and wait for all runner tasks, including those of
    /// runners disposed earlier.
    pub async fn shutdown(&mut self) {
        let mut tasks: Vec<JoinHandle<()>> = self.retired.drain().map(|(_, task)| task).collect();
        for (name, runner) in self.running.drain() {
            debug!(
                job = %name,
                state = ?runner.state(),
                disabled = runner.is_disabled(),
                "stopping runner"
            );
            if let Some(task) = runner.dispose() {
                tasks.push(task);
            }
        }
        if tasks.is_empty() {
            info!("scheduler stopped; no jobs were running");
            return;
        }
        let count = tasks.len();
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "runner task ended abnormally");
            }
        }
        info!(runners = count, "scheduler stopped");
    }
}
