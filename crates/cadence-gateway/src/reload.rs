//! Config file polling. Publishes the `[jobs]` table whenever it changes so
//! the scheduler can reconcile.

use std::sync::Arc;
use std::time::Duration;

use cadence_core::{CadenceConfig, JobsConfig};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Re-read `path` every `interval` until `shutdown` fires.
///
/// A file that fails to load or parse leaves the current jobs in place.
pub async fn poll_config(
    path: String,
    interval: Duration,
    tx: watch::Sender<Arc<JobsConfig>>,
    shutdown: CancellationToken,
) {
    info!(path = %path, interval_secs = interval.as_secs(), "watching config for job changes");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let jobs = match CadenceConfig::load(Some(&path)) {
            Ok(config) => config.jobs,
            Err(e) => {
                warn!(path = %path, error = %e, "config reload failed; keeping current jobs");
                continue;
            }
        };

        let changed = tx.send_if_modified(|current| {
            if **current == jobs {
                false
            } else {
                *current = Arc::new(jobs);
                true
            }
        });
        if changed {
            info!(path = %path, "job configuration changed");
        } else {
            debug!("job configuration unchanged");
        }
    }
    debug!("config poller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    const ONE_JOB: &str = "[jobs.a]\ntype = \"log\"\ntriggers = { manual = true }\n";
    const TWO_JOBS: &str = "[jobs.a]\ntype = \"log\"\ntriggers = { manual = true }\n\n\
                            [jobs.b]\ntype = \"log\"\ntriggers = { manual = true }\n";

    #[tokio::test]
    async fn publishes_only_real_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cadence.toml");
        std::fs::write(&path, ONE_JOB).unwrap();

        let initial = CadenceConfig::from_toml(ONE_JOB).unwrap().jobs;
        let (tx, mut rx) = watch::channel(Arc::new(initial));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(poll_config(
            path.to_string_lossy().into_owned(),
            Duration::from_millis(20),
            tx,
            shutdown.clone(),
        ));

        // Same content: no notification.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!rx.has_changed().unwrap());

        // Broken file: still nothing.
        std::fs::write(&path, "[jobs.a\n").unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!rx.has_changed().unwrap());

        std::fs::write(&path, TWO_JOBS).unwrap();
        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rx.borrow_and_update().names().count(), 2);

        shutdown.cancel();
        task.await.unwrap();
    }
}
