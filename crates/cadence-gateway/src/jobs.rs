//! Built-in job types: `log` and `command`.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use cadence_scheduler::{ExecutionInfo, Job, JobTypeRegistry};
use serde::Deserialize;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Max characters of command output kept in logs and error messages.
const MAX_OUTPUT_CHARS: usize = 4_000;

/// Registry with every built-in job type.
pub fn builtin_registry() -> JobTypeRegistry {
    let mut registry = JobTypeRegistry::new();
    registry
        .register_default::<LogJob>("log")
        .register_default::<CommandJob>("command");
    registry
}

// ---------------------------------------------------------------------------
// log
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LogSettings {
    #[serde(default = "default_message")]
    message: String,
}

fn default_message() -> String {
    "tick".to_string()
}

/// Logs `settings.message` at info level. Handy as a heartbeat.
#[derive(Default)]
pub struct LogJob;

#[async_trait]
impl Job for LogJob {
    async fn execute(&self, info: &ExecutionInfo, _cancel: CancellationToken) -> anyhow::Result<()> {
        let settings: LogSettings = info.settings.get()?;
        info!(job = %info.job_name, "{}", settings.message);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// command
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CommandSettings {
    command: String,
    /// Kill the command after this many seconds. No limit when unset.
    #[serde(default)]
    timeout_secs: Option<u64>,
}

/// Runs `settings.command` through `sh -c`. A non-zero exit, a timeout or
/// cancellation fails the execution; the child is killed in the latter two.
#[derive(Default)]
pub struct CommandJob;

#[async_trait]
impl Job for CommandJob {
    async fn execute(&self, info: &ExecutionInfo, cancel: CancellationToken) -> anyhow::Result<()> {
        let settings: CommandSettings = info.settings.get()?;
        debug!(job = %info.job_name, command = %settings.command, "spawning command");

        let child = Command::new("sh")
            .arg("-c")
            .arg(&settings.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn `{}`", settings.command))?;

        let deadline = async {
            match settings.timeout_secs {
                Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                None => std::future::pending().await,
            }
        };

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            out = child.wait_with_output() => out.context("failed to wait for command")?,
            _ = cancel.cancelled() => bail!("cancelled while running `{}`", settings.command),
            _ = deadline => bail!(
                "`{}` timed out after {}s",
                settings.command,
                settings.timeout_secs.unwrap_or_default()
            ),
        };

        let stdout = truncate_output(&String::from_utf8_lossy(&output.stdout), MAX_OUTPUT_CHARS);
        let stderr = truncate_output(&String::from_utf8_lossy(&output.stderr), MAX_OUTPUT_CHARS);

        if !output.status.success() {
            bail!(
                "`{}` exited with {}: {}",
                settings.command,
                output.status,
                stderr.trim()
            );
        }

        info!(
            job = %info.job_name,
            status = %output.status,
            stdout = %stdout.trim(),
            "command finished"
        );
        Ok(())
    }
}

/// Keep the head and tail of long output, dropping the middle.
fn truncate_output(output: &str, max_chars: usize) -> String {
    let total = output.chars().count();
    if total <= max_chars {
        return output.to_owned();
    }
    let half = max_chars / 2;
    let head: String = output.chars().take(half).collect();
    let tail: String = output.chars().skip(total - half).collect();
    format!("{head}\n... [{} chars omitted] ...\n{tail}", total - max_chars)
}
