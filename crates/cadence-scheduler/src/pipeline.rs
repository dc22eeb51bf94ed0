//! The per-job signal pipeline.
//!
//! One call to [`SignalPipeline::next`] is one or more rounds of:
//!
//! 1. snapshot the anchor
//! 2. race the trigger sources (first to fire wins, the rest are dropped)
//! 3. try the lock; on denial wait out the cooldown and start over
//! 4. re-read the anchor; if it moved, another host already ran this
//!    occurrence, so release the lock and start over
//!
//! and returns once a round passes both gates.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cadence_core::JobDefinition;
use chrono::{DateTime, Utc};
use futures_util::future::select_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::anchor::AnchorStore;
use crate::bus::CompletionBus;
use crate::error::Result;
use crate::lock::{LockHandle, LockProvider};
use crate::manual::ManualTriggerRegistry;
use crate::trigger::{
    CompletionTrigger, ManualTrigger, RoundContext, ScheduleTrigger, TriggerSource,
};

/// A round that passed both gates. The runner must release `lock` after
/// persisting the new anchor.
#[derive(Debug)]
pub struct Fired {
    pub lock: LockHandle,
    /// Kind of the source that fired.
    pub trigger: &'static str,
    pub snapshot: Option<DateTime<Utc>>,
}

pub struct SignalPipeline {
    job: String,
    sources: Vec<Box<dyn TriggerSource>>,
    anchors: Arc<dyn AnchorStore>,
    locks: Arc<dyn LockProvider>,
    lock_cooldown: Duration,
}

impl SignalPipeline {
    pub fn new(
        job: impl Into<String>,
        sources: Vec<Box<dyn TriggerSource>>,
        anchors: Arc<dyn AnchorStore>,
        locks: Arc<dyn LockProvider>,
        lock_cooldown: Duration,
    ) -> Self {
        Self {
            job: job.into(),
            sources,
            anchors,
            locks,
            lock_cooldown,
        }
    }

    /// Wire one source per trigger in the definition.
    pub fn for_definition(
        definition: &JobDefinition,
        anchors: Arc<dyn AnchorStore>,
        locks: Arc<dyn LockProvider>,
        manual: &ManualTriggerRegistry,
        bus: &CompletionBus,
        lock_cooldown: Duration,
    ) -> Self {
        let name = &definition.name;
        let spec = &definition.triggers;
        let mut sources: Vec<Box<dyn TriggerSource>> = Vec::new();

        for cron in &spec.schedules {
            sources.push(Box::new(ScheduleTrigger::new(name, cron.clone())));
        }
        if spec.manual {
            sources.push(Box::new(ManualTrigger::new(name, manual)));
        }
        if !spec.completions.is_empty() {
            sources.push(Box::new(CompletionTrigger::new(
                name,
                spec.completions.clone(),
                bus,
            )));
        }
        if spec.is_empty() {
            warn!(job = %name, "job has no triggers and will never run");
        }

        Self::new(name.clone(), sources, anchors, locks, lock_cooldown)
    }

    pub fn source_kinds(&self) -> Vec<&'static str> {
        self.sources.iter().map(|s| s.kind()).collect()
    }

    /// Wait for the next gated firing. `Ok(None)` once `cancel` fires;
    /// storage and lock-provider errors fail the call.
    pub async fn next(&self, cancel: &CancellationToken) -> Result<Option<Fired>> {
        loop {
            // 1. anchor snapshot
            let Some(snapshot) = until_cancelled(cancel, self.anchors.get_anchor(&self.job)).await else {
                return Ok(None);
            };
            let snapshot = snapshot?;
            let round = RoundContext {
                now: Utc::now(),
                anchor: snapshot,
            };

            // 2. first source to fire
            let trigger = if self.sources.is_empty() {
                cancel.cancelled().await;
                return Ok(None);
            } else {
                let signals: Vec<_> = self.sources.iter().map(|s| s.signal(&round)).collect();
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(None),
                    (_, idx, _) = select_all(signals) => self.sources[idx].kind(),
                }
            };
            debug!(job = %self.job, trigger, "signal fired");

            // 3. lock gate
            let Some(acquired) = until_cancelled(cancel, self.locks.try_acquire(&self.job)).await else {
                return Ok(None);
            };
            let Some(lock) = acquired? else {
                info!(
                    job = %self.job,
                    cooldown_secs = self.lock_cooldown.as_secs_f64(),
                    "lock held elsewhere; skipping occurrence"
                );
                if !sleep_or_cancel(self.lock_cooldown, cancel).await {
                    return Ok(None);
                }
                continue;
            };

            // 4. anchor consistency gate
            let Some(current) = until_cancelled(cancel, self.anchors.get_anchor(&self.job)).await else {
                return Ok(None);
            };
            let current = current?;
            if current != snapshot {
                info!(
                    job = %self.job,
                    snapshot = ?snapshot,
                    current = ?current,
                    "anchor moved since round start; occurrence already handled"
                );
                lock.release();
                continue;
            }

            return Ok(Some(Fired {
                lock,
                trigger,
                snapshot,
            }));
        }
    }

    /// Tear down registrations and subscriptions. Idempotent.
    pub fn close(&self) {
        for source in &self.sources {
            source.close();
        }
    }
}

async fn until_cancelled<T>(cancel: &CancellationToken, fut: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        v = fut => Some(v),
    }
}

/// Sleep for `duration`; `false` if cancelled first.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
