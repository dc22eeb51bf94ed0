//! Anchor stores: where each job's last execution attempt is recorded.
//!
//! The store does no locking of its own. The pipeline's snapshot / re-check
//! protocol is what keeps concurrent hosts from acting on a stale anchor.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use rusqlite::{Connection, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

use crate::db::init_db;
use crate::error::{Result, SchedulerError};

#[async_trait]
pub trait AnchorStore: Send + Sync {
    /// Timestamp of the last recorded attempt, `None` if the job never ran.
    async fn get_anchor(&self, job: &str) -> Result<Option<DateTime<Utc>>>;

    /// Record "now" as the job's anchor and return it.
    async fn drop_anchor(&self, job: &str) -> Result<DateTime<Utc>>;
}

fn format_anchor(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_anchor(job: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SchedulerError::AnchorStore {
            job: job.to_string(),
            reason: format!("unreadable anchor `{}`: {e}", raw.trim()),
        })
}

// ---------------------------------------------------------------------------
// File
// ---------------------------------------------------------------------------

/// One file per job at `<base>/<job>-anchor.txt`.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// reader sees either the old or the new timestamp, never a partial one.
pub struct FileAnchorStore {
    base: PathBuf,
}

impl FileAnchorStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn path_for(&self, job: &str) -> PathBuf {
        self.base.join(format!("{job}-anchor.txt"))
    }
}

#[async_trait]
impl AnchorStore for FileAnchorStore {
    async fn get_anchor(&self, job: &str) -> Result<Option<DateTime<Utc>>> {
        match tokio::fs::read_to_string(self.path_for(job)).await {
            Ok(raw) => parse_anchor(job, &raw).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SchedulerError::AnchorStore {
                job: job.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn drop_anchor(&self, job: &str) -> Result<DateTime<Utc>> {
        let now = Utc::now();
        let target = self.path_for(job);
        let tmp = self
            .base
            .join(format!(".{job}-anchor.{}.tmp", Uuid::new_v4().simple()));

        let write = async {
            tokio::fs::create_dir_all(&self.base).await?;
            tokio::fs::write(&tmp, format_anchor(now)).await?;
            tokio::fs::rename(&tmp, &target).await
        };

        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(SchedulerError::AnchorStore {
                job: job.to_string(),
                reason: e.to_string(),
            });
        }

        debug!(job = %job, anchor = %now, "anchor written");
        Ok(now)
    }
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

/// Anchors in a `job_anchors` table, for hosts that already keep a database.
pub struct SqliteAnchorStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAnchorStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::new(Connection::open(path)?)
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl AnchorStore for SqliteAnchorStore {
    async fn get_anchor(&self, job: &str) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT anchor FROM job_anchors WHERE job_name = ?1",
                [job],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|r| parse_anchor(job, &r)).transpose()
    }

    async fn drop_anchor(&self, job: &str) -> Result<DateTime<Utc>> {
        let now = Utc::now();
        let formatted = format_anchor(now);
        self.conn().execute(
            "INSERT INTO job_anchors (job_name, anchor, updated_at) VALUES (?1, ?2, ?2)
             ON CONFLICT(job_name) DO UPDATE SET anchor = excluded.anchor,
                                                updated_at = excluded.updated_at",
            rusqlite::params![job, formatted],
        )?;
        debug!(job = %job, anchor = %now, "anchor written");
        Ok(now)
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// Process-local anchors. Lost on restart.
#[derive(Default, Clone)]
pub struct MemoryAnchorStore {
    anchors: Arc<DashMap<String, DateTime<Utc>>>,
}

impl MemoryAnchorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an anchor, e.g. to make a job overdue.
    pub fn set_anchor(&self, job: &str, at: DateTime<Utc>) {
        self.anchors.insert(job.to_string(), at);
    }
}

#[async_trait]
impl AnchorStore for MemoryAnchorStore {
    async fn get_anchor(&self, job: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.anchors.get(job).map(|a| *a))
    }

    async fn drop_anchor(&self, job: &str) -> Result<DateTime<Utc>> {
        let now = Utc::now();
        self.anchors.insert(job.to_string(), now);
        Ok(now)
    }
}
