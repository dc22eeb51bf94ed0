//! `cadence-scheduler`: runs configured jobs on cron, manual and
//! completion triggers without double-executing across cooperating hosts.
//!
//! # Overview
//!
//! Each job gets a [`runner::JobRunner`] driven by a
//! [`pipeline::SignalPipeline`]. A round of the pipeline snapshots the job's
//! anchor, waits for the first trigger source to fire, takes the job's lock
//! and re-checks the anchor before handing the firing to the runner. The
//! runner executes the job, writes the new anchor and only then releases the
//! lock. The [`scheduler::Scheduler`] diffs configuration snapshots against
//! the running set and adds, replaces or removes runners.
//!
//! # Trigger sources
//!
//! | Source       | Fires when                                         |
//! |--------------|----------------------------------------------------|
//! | `schedule`   | the next cron occurrence after the anchor is due   |
//! | `manual`     | `ManualTriggerRegistry::trigger(job)` is called    |
//! | `completion` | an upstream job publishes a completion event       |

pub mod anchor;
pub mod bus;
pub mod db;
pub mod error;
pub mod lock;
pub mod manual;
pub mod pipeline;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod status;
pub mod trigger;

pub use anchor::{AnchorStore, FileAnchorStore, MemoryAnchorStore, SqliteAnchorStore};
pub use bus::{CompletionBus, CompletionEvent, Outcome};
pub use error::{Result, SchedulerError};
pub use lock::{LockHandle, LockProvider, NamedLockProvider, NoopLockProvider, SingletonLockProvider};
pub use manual::{ManualTriggerRegistry, RegistrationId};
pub use registry::{ExecutionInfo, Job, JobSettings, JobTypeRegistry};
pub use runner::{JobRunner, RunnerDeps, RunnerState, RunnerTuning};
pub use scheduler::{ReconcileReport, Scheduler};
pub use status::{JobStatus, StatusBoard};
