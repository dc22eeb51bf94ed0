//! Trigger sources. Each produces a fresh one-shot signal per round; the
//! pipeline races them and drops the losers.

use std::sync::Arc;
use std::time::Duration;

use cadence_core::CronExpression;
use chrono::{DateTime, Utc};
use futures_util::future::{self, BoxFuture, FutureExt};
use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{debug, warn};

use crate::bus::{CompletionBus, CompletionEvent};
use crate::manual::{ManualTriggerRegistry, RegistrationId};

/// Longest single sleep. Long waits are split so that the remaining time is
/// recomputed against the wall clock after each chunk.
const MAX_SLEEP_CHUNK: Duration = Duration::from_secs(24 * 60 * 60);

/// Inputs shared by every source for one round, captured before any source
/// is asked for a signal.
#[derive(Debug, Clone, Copy)]
pub struct RoundContext {
    pub now: DateTime<Utc>,
    /// Anchor snapshot taken at the start of the round.
    pub anchor: Option<DateTime<Utc>>,
}

pub trait TriggerSource: Send + Sync {
    fn kind(&self) -> &'static str;

    /// A signal for this round. Completes once, when the source's condition
    /// is met; may never complete.
    fn signal(&self, round: &RoundContext) -> BoxFuture<'static, ()>;

    /// Release registrations and subscriptions held by the source.
    fn close(&self) {}
}

/// Sleep until a wall-clock instant, in chunks of at most one day.
pub async fn sleep_until_utc(target: DateTime<Utc>) {
    loop {
        let remaining = match (target - Utc::now()).to_std() {
            Ok(d) if !d.is_zero() => d,
            _ => return,
        };
        tokio::time::sleep(remaining.min(MAX_SLEEP_CHUNK)).await;
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

pub struct ScheduleTrigger {
    job: String,
    cron: CronExpression,
}

impl ScheduleTrigger {
    pub fn new(job: impl Into<String>, cron: CronExpression) -> Self {
        Self {
            job: job.into(),
            cron,
        }
    }

    /// The occurrence this round waits for. Counted from the anchor when the
    /// job has run before, otherwise from now.
    pub fn next_occurrence(&self, round: &RoundContext) -> Option<DateTime<Utc>> {
        self.cron.next_after(round.anchor.unwrap_or(round.now))
    }
}

impl TriggerSource for ScheduleTrigger {
    fn kind(&self) -> &'static str {
        "schedule"
    }

    fn signal(&self, round: &RoundContext) -> BoxFuture<'static, ()> {
        match self.next_occurrence(round) {
            Some(next) if next <= round.now => {
                debug!(job = %self.job, cron = %self.cron, due = %next, "occurrence already due");
                future::ready(()).boxed()
            }
            Some(next) => {
                debug!(job = %self.job, cron = %self.cron, next = %next, "waiting for occurrence");
                sleep_until_utc(next).boxed()
            }
            None => {
                warn!(job = %self.job, cron = %self.cron, "schedule has no further occurrences");
                future::pending().boxed()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Manual
// ---------------------------------------------------------------------------

/// Fires when `ManualTriggerRegistry::trigger(job)` is called. A call made
/// while no round is waiting is remembered and fires the next round.
pub struct ManualTrigger {
    job: String,
    registry: ManualTriggerRegistry,
    registration: RegistrationId,
    notify: Arc<Notify>,
}

impl ManualTrigger {
    pub fn new(job: impl Into<String>, registry: &ManualTriggerRegistry) -> Self {
        let job = job.into();
        let notify = Arc::new(Notify::new());
        let n = notify.clone();
        let registration = registry.register(&job, move || n.notify_one());
        Self {
            job,
            registry: registry.clone(),
            registration,
            notify,
        }
    }
}

impl TriggerSource for ManualTrigger {
    fn kind(&self) -> &'static str {
        "manual"
    }

    fn signal(&self, _round: &RoundContext) -> BoxFuture<'static, ()> {
        let notify = self.notify.clone();
        async move { notify.notified().await }.boxed()
    }

    fn close(&self) {
        self.registry.unregister(&self.job, self.registration);
    }
}

impl Drop for ManualTrigger {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// Fires when any of the upstream jobs publishes a completion. Subscribes at
/// construction so completions between rounds are not lost.
pub struct CompletionTrigger {
    job: String,
    upstream: Arc<Vec<String>>,
    rx: Arc<Mutex<Option<broadcast::Receiver<CompletionEvent>>>>,
}

impl CompletionTrigger {
    pub fn new(job: impl Into<String>, upstream: Vec<String>, bus: &CompletionBus) -> Self {
        Self {
            job: job.into(),
            upstream: Arc::new(upstream),
            rx: Arc::new(Mutex::new(Some(bus.subscribe()))),
        }
    }
}

impl TriggerSource for CompletionTrigger {
    fn kind(&self) -> &'static str {
        "completion"
    }

    fn signal(&self, _round: &RoundContext) -> BoxFuture<'static, ()> {
        let rx = self.rx.clone();
        let upstream = self.upstream.clone();
        let job = self.job.clone();
        async move {
            let mut guard = rx.lock().await;
            let Some(rx) = guard.as_mut() else {
                return future::pending().await;
            };
            loop {
                match rx.recv().await {
                    Ok(event) if upstream.iter().any(|u| *u == event.job_name) => {
                        debug!(job = %job, upstream = %event.job_name, "upstream completed");
                        return;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(job = %job, skipped = n, "completion subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return future::pending().await;
                    }
                }
            }
        }
        .boxed()
    }

    fn close(&self) {
        // A round still waiting holds the lock; that round's future owns a
        // clone of the Arc and the receiver goes away with it.
        if let Ok(mut guard) = self.rx.try_lock() {
            guard.take();
        }
    }
}
